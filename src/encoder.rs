// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The encoder state machine.
//!
//! Encoding is simpler than decoding: the firmware neither delays nor
//! reorders frames, so one raw input frame produces exactly one encoded
//! output frame. The cycle is: push one raw frame, run [`Encoder::encode`],
//! and copy the result out with [`Encoder::get_encoded_frame`] into a buffer
//! sized by the reported byte count.
//!
//! What the firmware does not do is produce self-contained streams. It
//! emits SPS/PPS (or VOS/VIS/VOL) only on request, writes no access unit
//! delimiters in the right position, and omits the JFIF APP0 segment from
//! JPEG headers. The encoder therefore pre-generates the header blobs at
//! open time and assembles AUD + headers + payload itself when the frame is
//! retrieved.
//!
//! Closed GOPs are emulated: the firmware has no notion of them, so frames
//! at the configured interval are simply forced to be IDR.

use std::sync::Arc;

use log::debug;
use log::error;
use log::info;
use log::trace;
use thiserror::Error;

use crate::backend;
use crate::backend::pack_frame_rate;
use crate::backend::EncCoreOpenParams;
use crate::backend::EncHeaderKind;
use crate::backend::EncHeaderRequest;
use crate::backend::EncOutputInfo;
use crate::backend::EncStartParams;
use crate::backend::EncStdParams;
use crate::backend::EncoderCore;
use crate::backend::JpegEncTables;
use crate::backend::RetCode;
use crate::backend::ScratchBuffer;
use crate::backend::VpuCore;
use crate::backend::VpuFramebuffer;
use crate::backend::FRAME_PHYSADDR_ALIGNMENT;
use crate::capabilities::H264Level;
use crate::capabilities::H264Profile;
use crate::decoder::convert_frame_type;
use crate::dmabuf::map_dma_buffer;
use crate::dmabuf::DmaBuffer;
use crate::dmabuf::DmaBufferError;
use crate::dmabuf::DmaMapping;
use crate::dmabuf::MapFlags;
use crate::dmabuf::PhysicalAddress;
use crate::geometry::compute_frame_encoding_metrics;
use crate::geometry::compute_internal_encoding_metrics;
use crate::geometry::FramebufferMetrics;
use crate::ChromaSampling;
use crate::ColorFormat;
use crate::CompressionFormat;
use crate::FrameType;
use crate::RawFrame;

/// Size of the encoded-data region at the start of the stream buffer.
pub const VPU_ENC_MAIN_BITSTREAM_BUFFER_SIZE: usize = 1024 * 1024;
/// MPEG-4 scratch space, carved out of the stream buffer tail to keep both
/// regions in one DMA allocation.
const VPU_ENC_MPEG4_SCRATCH_SIZE: usize = 0x080000;

/// Minimum size of the stream buffer handed to [`Encoder::open`].
pub const VPU_ENC_MIN_REQUIRED_STREAM_BUFFER_SIZE: usize =
    VPU_ENC_MAIN_BITSTREAM_BUFFER_SIZE + VPU_ENC_MPEG4_SCRATCH_SIZE;

/// Framebuffers reserved on top of the reported minimum for the firmware's
/// subsampled reconstruction images.
const VPU_ENC_NUM_EXTRA_SUBSAMPLE_FRAMEBUFFERS: usize = 2;

const JPEG_ENC_HEADER_DATA_MAX_SIZE: usize = 2048;

const VPU_WAIT_TIMEOUT_MS: u32 = 500;
const VPU_MAX_TIMEOUT_COUNTS: u32 = 4;

/// A fixed Annex-B access unit delimiter NAL.
const H264_AUD: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

/// Size of [`JPEG_JFIF_APP0_SEGMENT`].
pub const JPEG_JFIF_APP0_SEGMENT_SIZE: usize = 18;

/// The canonical JFIF APP0 segment: marker, length, "JFIF" identifier,
/// version 1.02, pixel aspect ratio 1:1, no thumbnail. The firmware omits
/// it, but some consumers refuse JPEG files carrying neither a JFIF nor an
/// EXIF segment, so it is inserted between the SOI marker and the rest of
/// the firmware-produced header.
pub const JPEG_JFIF_APP0_SEGMENT: [u8; JPEG_JFIF_APP0_SEGMENT_SIZE] = [
    0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x02, 0x01, 0x00, 0x01, 0x00,
    0x01, 0x00, 0x00,
];

// Indices into the pre-generated header array. Unique per format only.
const ENC_HEADER_IDX_H264_SPS_RBSP: usize = 0;
const ENC_HEADER_IDX_H264_PPS_RBSP: usize = 1;
const ENC_HEADER_IDX_MPEG4_VOS: usize = 0;
const ENC_HEADER_IDX_MPEG4_VIS: usize = 1;
const ENC_HEADER_IDX_MPEG4_VOL: usize = 2;
const ENC_HEADER_NUM_INDICES: usize = 3;

/// Errors of the encoder surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncError {
    #[error("encoder error")]
    Error,
    #[error("invalid parameters")]
    InvalidParams,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid framebuffer")]
    InvalidFramebuffer,
    #[error("insufficient framebuffers")]
    InsufficientFramebuffers,
    #[error("invalid stride")]
    InvalidStride,
    #[error("wrong call sequence")]
    InvalidCall,
    #[error("timeout")]
    Timeout,
    #[error("already called")]
    AlreadyCalled,
    #[error("stream buffer size is {actual} bytes; need at least {required} bytes")]
    InsufficientStreamBufferSize { actual: usize, required: usize },
    #[error("unsupported compression format")]
    UnsupportedCompressionFormat,
    #[error("unsupported color format")]
    UnsupportedColorFormat,
    #[error("DMA memory access error")]
    DmaMemoryAccessError,
    /// Kept for compatibility with the retired output-callback surface.
    #[error("write callback failed")]
    WriteCallbackFailed,
}

impl From<RetCode> for EncError {
    fn from(code: RetCode) -> Self {
        match code {
            RetCode::InvalidHandle => EncError::InvalidHandle,
            RetCode::InvalidParam => EncError::InvalidParams,
            RetCode::InvalidFrameBuffer => EncError::InvalidFramebuffer,
            RetCode::InsufficientFrameBuffers => EncError::InsufficientFramebuffers,
            RetCode::InvalidStride => EncError::InvalidStride,
            RetCode::WrongCallSequence | RetCode::NotInitialized => EncError::InvalidCall,
            RetCode::CalledBefore => EncError::AlreadyCalled,
            RetCode::Timeout => EncError::Timeout,
            RetCode::MemoryAccessViolation => EncError::DmaMemoryAccessError,
            _ => EncError::Error,
        }
    }
}

impl From<DmaBufferError> for EncError {
    fn from(err: DmaBufferError) -> Self {
        error!("{:#}", anyhow::Error::from(err));
        EncError::DmaMemoryAccessError
    }
}

/// What one [`Encoder::encode`] step produced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncOutput {
    /// No raw frame was staged; push one and call encode again.
    MoreInputDataNeeded,
    /// A frame was encoded; retrieve it with [`Encoder::get_encoded_frame`]
    /// into a buffer of at least `encoded_frame_size` bytes.
    EncodedFrameAvailable { encoded_frame_size: usize },
}

/// MPEG-4 specific open parameters.
#[derive(Copy, Clone, Debug)]
pub struct Mpeg4EncParams {
    pub enable_data_partitioning: bool,
    pub enable_reversible_vlc: bool,
    pub intra_dc_vlc_thr: u32,
    pub enable_hec: bool,
    pub version_id: u32,
}

/// H.263 specific open parameters (annex toggles).
#[derive(Copy, Clone, Debug)]
pub struct H263EncParams {
    pub enable_annex_i: bool,
    pub enable_annex_j: bool,
    pub enable_annex_k: bool,
    pub enable_annex_t: bool,
}

/// H.264 specific open parameters.
#[derive(Copy, Clone, Debug)]
pub struct H264EncParams {
    pub profile: H264Profile,
    /// Level to declare. When `None`, the level is estimated from
    /// resolution, bitrate and frame rate.
    pub level: Option<H264Level>,
    pub enable_access_unit_delimiters: bool,
}

/// Format-specific open parameters.
#[derive(Copy, Clone, Debug)]
pub enum EncFormatParams {
    Mpeg4(Mpeg4EncParams),
    H263(H263EncParams),
    H264(H264EncParams),
    Jpeg,
}

/// Parameters for [`Encoder::open`]. Use
/// [`crate::capabilities::set_default_open_params`] for sensible defaults.
#[derive(Clone, Debug)]
pub struct EncOpenParams {
    pub compression_format: CompressionFormat,
    pub color_format: ColorFormat,
    pub frame_width: usize,
    pub frame_height: usize,
    /// Bitrate in kbps. 0 disables rate control; `quantization` is used
    /// instead.
    pub bitrate_kbps: u32,
    pub quantization: u32,
    pub gop_size: u32,
    pub min_intra_refresh_mb_count: u32,
    /// Every `closed_gop_interval` GOPs, a frame is forced to IDR to close
    /// the GOP. 0 leaves GOPs open.
    pub closed_gop_interval: u32,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
    pub format_params: EncFormatParams,
}

/// Stream-level information available right after [`Encoder::open`].
#[derive(Clone, Debug, Default)]
pub struct EncStreamInfo {
    /// Layout raw input frames must follow.
    pub frame_encoding_metrics: FramebufferMetrics,
    /// Minimum size/alignment of the pool framebuffers to add.
    pub min_framebuffer_size: usize,
    pub framebuffer_alignment: usize,
    pub min_num_required_framebuffers: usize,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
    /// The declared H.264 level (estimated when the open params left it
    /// unset).
    pub h264_level: Option<H264Level>,
}

/// Metadata of one encoded frame written by
/// [`Encoder::get_encoded_frame`].
#[derive(Copy, Clone, Debug)]
pub struct EncodedFrameInfo {
    pub data_size: usize,
    /// Whether headers were prepended to the payload.
    pub has_header: bool,
    pub frame_type: FrameType,
    pub pts: u64,
    pub dts: u64,
    pub context: u64,
    /// Whether a decoder can start at this frame (IDR for H.264, I
    /// elsewhere).
    pub is_sync_point: bool,
}

pub struct Encoder {
    core: Arc<dyn VpuCore>,
    handle: Box<dyn EncoderCore>,

    stream_buffer: Arc<dyn DmaBuffer>,
    stream_mapping: DmaMapping,
    stream_buffer_physical_address: PhysicalAddress,

    open_params: EncOpenParams,
    stream_info: EncStreamInfo,

    num_framebuffers_to_be_added: usize,
    /// Count of registered main pool slots (excludes the subsample
    /// buffers).
    num_registered_framebuffers: usize,
    pool_registered: bool,

    /// Layout of the internal reference framebuffers; stricter alignment
    /// than input frames, hence separate from the stream-info metrics.
    internal_fb_y_stride: usize,
    internal_fb_uv_stride: usize,
    internal_fb_u_offset: usize,
    internal_fb_v_offset: usize,

    enc_output_info: EncOutputInfo,

    /// Pre-generated header blobs (SPS/PPS or VOS/VIS/VOL).
    main_headers: [Vec<u8>; ENC_HEADER_NUM_INDICES],
    /// Per-frame JPEG header scratch; re-queried for every frame.
    jpeg_header: Vec<u8>,

    prepend_header_to_frame: bool,
    /// True until the first frame after open or flush has been encoded.
    first_frame: bool,
    h264_aud_enabled: bool,

    staged_raw_frame: Option<RawFrame>,

    encoded_frame_available: bool,
    encoded_frame_context: u64,
    encoded_frame_pts: u64,
    encoded_frame_dts: u64,
    encoded_frame_type: FrameType,
    encoded_frame_data_size: usize,

    frame_counter: u64,
    /// Frame distance between forced IDR frames
    /// (`closed_gop_interval * gop_size`); 0 disables the emulation.
    interval_between_idr_frames: u64,

    closed: bool,
}

impl Encoder {
    /// Opens an encoder instance.
    ///
    /// `stream_buffer` must be at least
    /// [`VPU_ENC_MIN_REQUIRED_STREAM_BUFFER_SIZE`] bytes and stays mapped
    /// until the encoder is closed.
    pub fn open(
        core: Arc<dyn VpuCore>,
        open_params: EncOpenParams,
        stream_buffer: Arc<dyn DmaBuffer>,
    ) -> Result<Encoder, EncError> {
        let stream_buffer_size = stream_buffer.size();
        if stream_buffer_size < VPU_ENC_MIN_REQUIRED_STREAM_BUFFER_SIZE {
            error!(
                "stream buffer size is {} bytes; need at least {} bytes",
                stream_buffer_size, VPU_ENC_MIN_REQUIRED_STREAM_BUFFER_SIZE
            );
            return Err(EncError::InsufficientStreamBufferSize {
                actual: stream_buffer_size,
                required: VPU_ENC_MIN_REQUIRED_STREAM_BUFFER_SIZE,
            });
        }

        if open_params.gop_size == 0 {
            error!("GOP size must be at least 1");
            return Err(EncError::InvalidParams);
        }

        if open_params.frame_rate_denominator == 0 {
            error!("frame rate denominator must be at least 1");
            return Err(EncError::InvalidParams);
        }

        let stream_mapping =
            map_dma_buffer(&stream_buffer, MapFlags::read_write().with_manual_sync())?;
        let stream_buffer_physical_address = stream_buffer.physical_address();

        let semi_planar = open_params.color_format.is_semi_planar();
        let metrics = compute_frame_encoding_metrics(
            open_params.color_format,
            open_params.frame_width,
            open_params.frame_height,
        );
        let internal_metrics = compute_internal_encoding_metrics(
            open_params.color_format,
            open_params.frame_width,
            open_params.frame_height,
        );

        let mut stream_info = EncStreamInfo {
            frame_encoding_metrics: metrics,
            min_framebuffer_size: (if semi_planar {
                internal_metrics.u_offset
            } else {
                internal_metrics.v_offset
            }) + internal_metrics.uv_size,
            framebuffer_alignment: FRAME_PHYSADDR_ALIGNMENT,
            min_num_required_framebuffers: 0,
            frame_rate_numerator: open_params.frame_rate_numerator,
            frame_rate_denominator: open_params.frame_rate_denominator,
            h264_level: None,
        };

        let mut h264_aud_enabled = false;
        let std_params = match (open_params.compression_format, &open_params.format_params) {
            (CompressionFormat::Mpeg4, EncFormatParams::Mpeg4(params)) => EncStdParams::Mpeg4 {
                data_partitioning: params.enable_data_partitioning,
                reversible_vlc: params.enable_reversible_vlc,
                intra_dc_vlc_thr: params.intra_dc_vlc_thr,
                hec_enable: params.enable_hec,
                version_id: params.version_id,
            },

            (CompressionFormat::H263, EncFormatParams::H263(params)) => EncStdParams::H263 {
                annex_i: params.enable_annex_i,
                annex_j: params.enable_annex_j,
                annex_k: params.enable_annex_k,
                annex_t: params.enable_annex_t,
            },

            (CompressionFormat::H264, EncFormatParams::H264(params)) => {
                // Estimate the level if none was specified.
                let level = params.level.unwrap_or_else(|| {
                    let level = estimate_h264_level(
                        metrics.aligned_width,
                        metrics.aligned_height,
                        open_params.bitrate_kbps,
                        open_params.frame_rate_numerator,
                        open_params.frame_rate_denominator,
                    );
                    debug!(
                        "no h.264 level given; estimated level {:?} out of width, height, \
                         bitrate, framerate",
                        level
                    );
                    level
                });
                stream_info.h264_level = Some(level);

                // The firmware outputs SPS/PPS infrequently, so headers are
                // inserted manually before each I/IDR frame. That breaks
                // the firmware's AUD placement (AUDs must precede SPS/PPS),
                // so its AUD generation stays off and AUDs are inserted
                // manually too.
                h264_aud_enabled = params.enable_access_unit_delimiters;

                // Frames not sized to 16-pixel boundaries get the
                // remainders cropped.
                let width_remainder = metrics.actual_width & 15;
                let height_remainder = metrics.actual_height & 15;

                EncStdParams::H264 {
                    constrained_intra_pred: false,
                    disable_deblocking: false,
                    deblock_filter_offset_alpha: 6,
                    deblock_filter_offset_beta: 0,
                    chroma_qp_offset: 0,
                    aud_enable: false,
                    frame_cropping: width_remainder != 0 || height_remainder != 0,
                    frame_crop_right: width_remainder,
                    frame_crop_bottom: height_remainder,
                }
            }

            (CompressionFormat::Jpeg, EncFormatParams::Jpeg) => {
                // The quantization value is a quality reduction; the IJG
                // quality factor runs the other way.
                let quality_factor = 100 - open_params.quantization.min(99);
                EncStdParams::Jpeg {
                    source_sampling: open_params.color_format.sampling(),
                    restart_interval: 60,
                    tables: Box::new(set_jpeg_tables(
                        quality_factor,
                        open_params.color_format.sampling(),
                    )),
                }
            }

            _ => {
                error!(
                    "compression format {:?} is not supported for encoding",
                    open_params.compression_format
                );
                return Err(EncError::UnsupportedCompressionFormat);
            }
        };

        let core_params = EncCoreOpenParams {
            bitstream_buffer: stream_buffer_physical_address,
            bitstream_buffer_size: VPU_ENC_MAIN_BITSTREAM_BUFFER_SIZE,
            pic_width: metrics.actual_width,
            pic_height: metrics.actual_height,
            frame_rate: pack_frame_rate(
                open_params.frame_rate_numerator,
                open_params.frame_rate_denominator,
            ),
            bitrate_kbps: open_params.bitrate_kbps,
            gop_size: open_params.gop_size,
            chroma_interleave: semi_planar,
            initial_delay: 0,
            vbv_buffer_size: 0,
            intra_refresh_mb_count: open_params.min_intra_refresh_mb_count,
            rc_intra_qp: -1,
            user_gamma: (0.75 * 32768.0) as u32,
            // The firmware permits no other search range for H.263.
            me_search_range: if open_params.compression_format == CompressionFormat::H263 {
                3
            } else {
                0
            },
            intra_cost_weight: 0,
            ring_buffer_enable: false,
            linear_to_tiled_enable: true,
            map_type: 0,
            std_params,
        };

        debug!(
            "opening encoder; size of actual frame: {} x {} pixel; \
             size of total aligned frame: {} x {} pixel",
            metrics.actual_width, metrics.actual_height, metrics.aligned_width,
            metrics.aligned_height
        );

        backend::load(core.as_ref()).map_err(|code| {
            error!("loading VPU failed: {}", code);
            EncError::Error
        })?;

        let handle = match core.open_encoder(&core_params) {
            Ok(handle) => handle,
            Err(code) => {
                error!("could not open encoder: {}", code);
                backend::unload(core.as_ref());
                return Err(EncError::Error);
            }
        };

        // Closed GOP intervals are emulated by forcing IDR frames at this
        // distance.
        let interval_between_idr_frames =
            u64::from(open_params.closed_gop_interval) * u64::from(open_params.gop_size);

        let mut encoder = Encoder {
            core,
            handle,
            stream_buffer,
            stream_mapping,
            stream_buffer_physical_address,
            open_params,
            stream_info,
            num_framebuffers_to_be_added: 0,
            num_registered_framebuffers: 0,
            pool_registered: false,
            internal_fb_y_stride: internal_metrics.y_stride,
            internal_fb_uv_stride: internal_metrics.uv_stride,
            internal_fb_u_offset: internal_metrics.u_offset,
            internal_fb_v_offset: internal_metrics.v_offset,
            enc_output_info: EncOutputInfo::default(),
            main_headers: Default::default(),
            jpeg_header: Vec::new(),
            prepend_header_to_frame: false,
            first_frame: true,
            h264_aud_enabled,
            staged_raw_frame: None,
            encoded_frame_available: false,
            encoded_frame_context: 0,
            encoded_frame_pts: 0,
            encoded_frame_dts: 0,
            encoded_frame_type: FrameType::Unknown,
            encoded_frame_data_size: 0,
            frame_counter: 0,
            interval_between_idr_frames,
            closed: false,
        };

        match encoder.handle.initial_info() {
            Ok(info) => {
                debug!("initial info min framebuffer count: {}", info.min_frame_buffer_count);
                let mut min = info.min_frame_buffer_count;
                if encoder.open_params.compression_format != CompressionFormat::Jpeg {
                    min += VPU_ENC_NUM_EXTRA_SUBSAMPLE_FRAMEBUFFERS;
                }
                encoder.stream_info.min_num_required_framebuffers = min;
                encoder.num_framebuffers_to_be_added = min;
            }
            Err(code) => {
                error!("could not get initial information: {}", code);
                encoder.teardown_after_failed_open();
                return Err(EncError::Error);
            }
        }

        // Header generation only works after the initial info is out.
        if let Err(err) = encoder.generate_all_header_data() {
            encoder.teardown_after_failed_open();
            return Err(err);
        }

        // JPEG uses no framebuffer pool; the firmware only wants the stride,
        // plus a parked rotator.
        if encoder.open_params.compression_format == CompressionFormat::Jpeg {
            let stride = encoder.stream_info.frame_encoding_metrics.y_stride;
            if let Err(code) = encoder.handle.register_framebuffers(
                &[],
                stride,
                0,
                0,
                &ScratchBuffer::default(),
            ) {
                error!("could not register JPEG encoder configuration: {}", code);
                encoder.teardown_after_failed_open();
                return Err(EncError::Error);
            }

            if let Err(code) = encoder.handle.set_rotation_angle(0) {
                error!("could not reset rotation angle: {}", code);
            }
            if let Err(code) = encoder.handle.set_mirror(0) {
                error!("could not reset mirror direction: {}", code);
            }
        }

        debug!("successfully opened encoder");

        Ok(encoder)
    }

    fn teardown_after_failed_open(&mut self) {
        self.closed = true;
        if let Err(code) = self.handle.close() {
            error!("could not close encoder: {}", code);
        }
        backend::unload(self.core.as_ref());
    }

    pub fn stream_info(&self) -> &EncStreamInfo {
        &self.stream_info
    }

    /// Registers the reference framebuffer pool. The final two buffers are
    /// used as subsample scratch; the rest become main slots. JPEG needs no
    /// pool, so the call is a no-op then.
    pub fn add_framebuffers_to_pool(
        &mut self,
        fb_dma_buffers: &[Arc<dyn DmaBuffer>],
    ) -> Result<(), EncError> {
        if self.open_params.compression_format == CompressionFormat::Jpeg {
            debug!("JPEG encoding does not use a framebuffer pool");
            return Ok(());
        }

        if self.num_framebuffers_to_be_added == 0 {
            error!("no framebuffers need to be added");
            return Err(EncError::InvalidCall);
        }

        if fb_dma_buffers.len() < self.num_framebuffers_to_be_added {
            error!(
                "encoder needs {} framebuffers to be added, got {}",
                self.num_framebuffers_to_be_added,
                fb_dma_buffers.len()
            );
            return Err(EncError::InsufficientFramebuffers);
        }

        debug_assert!(fb_dma_buffers.len() >= VPU_ENC_NUM_EXTRA_SUBSAMPLE_FRAMEBUFFERS);
        let num_main = fb_dma_buffers.len() - VPU_ENC_NUM_EXTRA_SUBSAMPLE_FRAMEBUFFERS;

        let mut internal_framebuffers = Vec::with_capacity(num_main);
        for (i, fb_dma_buffer) in fb_dma_buffers[..num_main].iter().enumerate() {
            let phys_addr = fb_dma_buffer.physical_address();
            if phys_addr == 0 {
                error!("could not get physical address for DMA buffer {}/{}", i, num_main);
                return Err(EncError::DmaMemoryAccessError);
            }

            internal_framebuffers.push(VpuFramebuffer {
                index: i,
                y_stride: self.internal_fb_y_stride,
                uv_stride: self.internal_fb_uv_stride,
                buf_y: phys_addr,
                buf_cb: phys_addr + self.internal_fb_u_offset as PhysicalAddress,
                buf_cr: phys_addr + self.internal_fb_v_offset as PhysicalAddress,
                // The encoder does not use MvCol data.
                buf_mv_col: 0,
            });
        }

        // The MPEG-4 scratch buffer shares the stream buffer DMA block,
        // right after the bitstream region.
        let scratch = ScratchBuffer {
            base: self.stream_buffer_physical_address
                + VPU_ENC_MAIN_BITSTREAM_BUFFER_SIZE as PhysicalAddress,
            size: VPU_ENC_MPEG4_SCRATCH_SIZE,
        };

        let subsample_a = fb_dma_buffers[num_main].physical_address();
        let subsample_b = fb_dma_buffers[num_main + 1].physical_address();

        self.handle
            .register_framebuffers(
                &internal_framebuffers,
                self.stream_info.frame_encoding_metrics.y_stride,
                subsample_a,
                subsample_b,
                &scratch,
            )
            .map_err(|code| {
                error!("could not register framebuffers: {}", code);
                EncError::Error
            })?;

        self.num_registered_framebuffers = num_main;
        self.pool_registered = true;
        self.num_framebuffers_to_be_added = 0;

        Ok(())
    }

    /// Stages one raw frame for the next [`Encoder::encode`] call.
    pub fn push_raw_frame(&mut self, raw_frame: RawFrame) -> Result<(), EncError> {
        if self.staged_raw_frame.is_some() {
            error!("tried to push a raw frame before a previous one was encoded");
            return Err(EncError::InvalidCall);
        }

        trace!("staged raw frame");
        self.staged_raw_frame = Some(raw_frame);

        Ok(())
    }

    /// Encodes the staged raw frame.
    pub fn encode(&mut self) -> Result<EncOutput, EncError> {
        if self.encoded_frame_available {
            error!("cannot encode new frame before the old one was retrieved");
            return Err(EncError::InvalidCall);
        }

        if !self.pool_registered
            && self.open_params.compression_format != CompressionFormat::Jpeg
        {
            error!(
                "cannot encode anything without an initialized framebuffer pool; \
                 check that framebuffers were added"
            );
            return Err(EncError::InvalidCall);
        }

        if self.staged_raw_frame.is_none() {
            trace!("no data left to encode");
            return Ok(EncOutput::MoreInputDataNeeded);
        }

        let result = self.encode_staged_frame();

        if result.is_ok() {
            self.frame_counter += 1;
        }
        self.staged_raw_frame = None;

        result
    }

    fn encode_staged_frame(&mut self) -> Result<EncOutput, EncError> {
        let staged = self.staged_raw_frame.clone().ok_or(EncError::InvalidCall)?;
        let metrics = self.stream_info.frame_encoding_metrics;

        let mut forced_idr_for_closed_gop = false;
        if self.open_params.compression_format == CompressionFormat::H264 {
            forced_idr_for_closed_gop = self.interval_between_idr_frames > 0
                && self.frame_counter % self.interval_between_idr_frames == 0;
            if forced_idr_for_closed_gop {
                trace!("forcing this frame to be encoded as an IDR frame to produce closed GOP");
            }
        }

        let raw_frame_phys_addr = staged.dma_buffer.physical_address();
        if raw_frame_phys_addr == 0 {
            error!("could not get physical address for the staged raw frame");
            return Err(EncError::DmaMemoryAccessError);
        }
        trace!("encoding raw frame with physical address {:#x}", raw_frame_phys_addr);

        // Every JPEG frame is independent and needs its own header; fetch it
        // now so get_encoded_frame() can prepend it.
        if self.open_params.compression_format == CompressionFormat::Jpeg {
            self.jpeg_header =
                self.handle.jpeg_header(JPEG_ENC_HEADER_DATA_MAX_SIZE).map_err(|code| {
                    error!("could not retrieve JPEG header: {}", code);
                    EncError::Error
                })?;
            trace!("added JPEG header with {} byte", self.jpeg_header.len());
        }

        let params = EncStartParams {
            source: VpuFramebuffer {
                // An index distinct from every registered framebuffer.
                index: self.num_registered_framebuffers + 1,
                y_stride: metrics.y_stride,
                uv_stride: metrics.uv_stride,
                buf_y: raw_frame_phys_addr + metrics.y_offset as PhysicalAddress,
                buf_cb: raw_frame_phys_addr + metrics.u_offset as PhysicalAddress,
                buf_cr: raw_frame_phys_addr + metrics.v_offset as PhysicalAddress,
                buf_mv_col: 0,
            },
            force_i_picture: staged.frame_types[0].is_intra_request() || forced_idr_for_closed_gop,
            // For JPEG, quantization already went into the tables at open
            // time and the firmware ignores this field.
            quant_param: if self.open_params.compression_format != CompressionFormat::Jpeg {
                self.open_params.quantization
            } else {
                0
            },
        };

        self.handle.start_one_frame(&params).map_err(|code| {
            error!("could not start encoding frame: {}", code);
            EncError::Error
        })?;

        trace!("waiting for encoding completion");
        let mut timeout = true;
        for _ in 0..VPU_MAX_TIMEOUT_COUNTS {
            if self.handle.wait_for_interrupt(VPU_WAIT_TIMEOUT_MS) {
                timeout = false;
                break;
            }
            info!("timeout after waiting {} ms for frame completion", VPU_WAIT_TIMEOUT_MS);
        }

        // Fetched even after a timeout: start_one_frame locks the firmware
        // until the output info is read.
        self.enc_output_info = self.handle.output_info().map_err(|code| {
            error!("could not get output information: {}", code);
            EncError::Error
        })?;

        if timeout {
            return Err(EncError::Timeout);
        }

        self.encoded_frame_type = convert_frame_type(
            self.open_params.compression_format,
            self.enc_output_info.pic_type,
            false,
        )[0];

        trace!(
            "output info: bitstreamBuffer {:#x} bitstreamSize {} picType {} ({:?})",
            self.enc_output_info.bitstream_buffer,
            self.enc_output_info.bitstream_size,
            self.enc_output_info.pic_type,
            self.encoded_frame_type,
        );

        let add_header = match self.open_params.compression_format {
            CompressionFormat::Jpeg => true,
            CompressionFormat::H264 | CompressionFormat::Mpeg4 => {
                self.first_frame
                    || self.encoded_frame_type == FrameType::Idr
                    || self.encoded_frame_type == FrameType::I
            }
            _ => false,
        };

        let mut encoded_data_size = self.enc_output_info.bitstream_size;
        if self.h264_aud_enabled {
            encoded_data_size += H264_AUD.len();
        }
        if add_header {
            encoded_data_size += match self.open_params.compression_format {
                // The APP0 segment is inserted host-side; the firmware
                // header does not contain it.
                CompressionFormat::Jpeg => self.jpeg_header.len() + JPEG_JFIF_APP0_SEGMENT_SIZE,
                CompressionFormat::H264 => {
                    self.main_headers[ENC_HEADER_IDX_H264_SPS_RBSP].len()
                        + self.main_headers[ENC_HEADER_IDX_H264_PPS_RBSP].len()
                }
                CompressionFormat::Mpeg4 => {
                    self.main_headers[ENC_HEADER_IDX_MPEG4_VOS].len()
                        + self.main_headers[ENC_HEADER_IDX_MPEG4_VIS].len()
                        + self.main_headers[ENC_HEADER_IDX_MPEG4_VOL].len()
                }
                _ => 0,
            };
        }

        // One input frame always immediately produces one output frame, so
        // the metadata moves over as-is.
        self.encoded_frame_context = staged.context;
        self.encoded_frame_pts = staged.pts;
        self.encoded_frame_dts = staged.dts;
        self.encoded_frame_data_size = encoded_data_size;
        self.encoded_frame_available = true;
        self.prepend_header_to_frame = add_header;
        self.first_frame = false;

        Ok(EncOutput::EncodedFrameAvailable { encoded_frame_size: encoded_data_size })
    }

    /// Writes the encoded frame into `dest` and returns its metadata.
    ///
    /// `dest` must hold at least the `encoded_frame_size` reported by
    /// [`Encoder::encode`]. Layout: AUD (when enabled), headers (when
    /// prepended), payload.
    pub fn get_encoded_frame(&mut self, dest: &mut [u8]) -> Result<EncodedFrameInfo, EncError> {
        if !self.encoded_frame_available {
            error!("cannot retrieve encoded frame since there is none");
            return Err(EncError::InvalidCall);
        }

        if dest.len() < self.encoded_frame_data_size {
            error!(
                "insufficient space in output buffer: need {} byte, got {}",
                self.encoded_frame_data_size,
                dest.len()
            );
            return Err(EncError::Error);
        }

        let mut write_offset = 0;

        // The AUD comes before the SPS/PPS header data.
        if self.h264_aud_enabled {
            dest[write_offset..write_offset + H264_AUD.len()].copy_from_slice(&H264_AUD);
            write_offset += H264_AUD.len();
        }

        if self.prepend_header_to_frame {
            match self.open_params.compression_format {
                CompressionFormat::H264 => {
                    for idx in [ENC_HEADER_IDX_H264_SPS_RBSP, ENC_HEADER_IDX_H264_PPS_RBSP] {
                        let header = &self.main_headers[idx];
                        dest[write_offset..write_offset + header.len()].copy_from_slice(header);
                        write_offset += header.len();
                    }
                }

                CompressionFormat::Mpeg4 => {
                    for idx in [
                        ENC_HEADER_IDX_MPEG4_VOS,
                        ENC_HEADER_IDX_MPEG4_VIS,
                        ENC_HEADER_IDX_MPEG4_VOL,
                    ] {
                        let header = &self.main_headers[idx];
                        dest[write_offset..write_offset + header.len()].copy_from_slice(header);
                        write_offset += header.len();
                    }
                }

                CompressionFormat::Jpeg => {
                    if self.jpeg_header.len() < 2 {
                        error!("firmware JPEG header is too short");
                        return Err(EncError::Error);
                    }

                    // The firmware header starts with the SOI marker. Copy
                    // that, insert the APP0 segment right after it (that is
                    // how valid JFIF files are structured), then the rest of
                    // the firmware header.
                    dest[write_offset..write_offset + 2].copy_from_slice(&self.jpeg_header[0..2]);
                    write_offset += 2;

                    dest[write_offset..write_offset + JPEG_JFIF_APP0_SEGMENT_SIZE]
                        .copy_from_slice(&JPEG_JFIF_APP0_SEGMENT);
                    write_offset += JPEG_JFIF_APP0_SEGMENT_SIZE;

                    let rest = &self.jpeg_header[2..];
                    dest[write_offset..write_offset + rest.len()].copy_from_slice(rest);
                    write_offset += rest.len();
                }

                _ => (),
            }
        }

        // Copy the payload out of the stream buffer.
        if self.enc_output_info.bitstream_buffer != 0 {
            let payload_offset =
                (self.enc_output_info.bitstream_buffer - self.stream_buffer_physical_address)
                    as usize;
            let payload_size = self.enc_output_info.bitstream_size;

            self.stream_buffer.begin_sync_session();
            let payload = &self.stream_mapping.as_slice()[payload_offset..payload_offset + payload_size];
            dest[write_offset..write_offset + payload_size].copy_from_slice(payload);
            self.stream_buffer.end_sync_session();
        }

        let info = EncodedFrameInfo {
            data_size: self.encoded_frame_data_size,
            has_header: self.prepend_header_to_frame,
            frame_type: self.encoded_frame_type,
            pts: self.encoded_frame_pts,
            dts: self.encoded_frame_dts,
            context: self.encoded_frame_context,
            // Only IDR frames are valid sync points in H.264.
            is_sync_point: if self.open_params.compression_format == CompressionFormat::H264 {
                self.encoded_frame_type == FrameType::Idr
            } else {
                self.encoded_frame_type == FrameType::I
            },
        };

        self.encoded_frame_available = false;

        Ok(info)
    }

    /// Adjusts the target bitrate at runtime. Fails when rate control was
    /// disabled at open time.
    pub fn set_bitrate(&mut self, bitrate_kbps: u32) -> Result<(), EncError> {
        if self.open_params.bitrate_kbps == 0 {
            error!("rate control disabled in the encoder open parameters");
            return Err(EncError::InvalidCall);
        }

        trace!("setting bitrate to {} kbps", bitrate_kbps);

        self.handle.set_bitrate(bitrate_kbps).map_err(|code| {
            error!("could not set bitrate: {}", code);
            EncError::Error
        })
    }

    /// Adjusts the frame rate at runtime.
    pub fn set_frame_rate(&mut self, numerator: u32, denominator: u32) -> Result<(), EncError> {
        if denominator == 0 {
            return Err(EncError::InvalidParams);
        }

        trace!("setting frame rate to {}/{} fps", numerator, denominator);

        self.handle.set_frame_rate(pack_frame_rate(numerator, denominator)).map_err(|code| {
            error!("could not set frame rate: {}", code);
            EncError::Error
        })
    }

    /// Resets the per-stream state. The next encoded frame carries headers
    /// again and restarts the closed-GOP cadence.
    pub fn flush(&mut self) {
        self.first_frame = true;
        self.staged_raw_frame = None;
        self.encoded_frame_available = false;
        self.frame_counter = 0;
    }

    /// Closes the encoder.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        debug!("closing encoder");

        match self.handle.close() {
            Err(RetCode::FrameNotComplete) => {
                // The firmware refuses to close while a frame is partially
                // encoded; reset it and retry.
                if let Err(code) = self.handle.software_reset() {
                    error!("could not reset encoder: {}", code);
                }
                if let Err(code) = self.handle.close() {
                    error!("could not close encoder: {}", code);
                }
            }
            Err(code) => error!("could not close encoder: {}", code),
            Ok(()) => (),
        }

        backend::unload(self.core.as_ref());
    }

    fn generate_all_header_data(&mut self) -> Result<(), EncError> {
        match self.open_params.compression_format {
            CompressionFormat::H264 => {
                self.main_headers[ENC_HEADER_IDX_H264_SPS_RBSP] =
                    self.generate_header_data(EncHeaderKind::H264SpsRbsp, None, "h.264 SPS")?;
                self.main_headers[ENC_HEADER_IDX_H264_PPS_RBSP] =
                    self.generate_header_data(EncHeaderKind::H264PpsRbsp, None, "h.264 PPS")?;
            }

            CompressionFormat::Mpeg4 => {
                let metrics = &self.stream_info.frame_encoding_metrics;
                let indication = mpeg4_user_profile_level_indication(
                    metrics.actual_width,
                    metrics.actual_height,
                    self.open_params.frame_rate_numerator,
                    self.open_params.frame_rate_denominator,
                );

                self.main_headers[ENC_HEADER_IDX_MPEG4_VOS] = self.generate_header_data(
                    EncHeaderKind::Mpeg4VosHeader,
                    Some(indication),
                    "MPEG-4 VOS header",
                )?;
                self.main_headers[ENC_HEADER_IDX_MPEG4_VIS] = self.generate_header_data(
                    EncHeaderKind::Mpeg4VisHeader,
                    Some(indication),
                    "MPEG-4 VIS header",
                )?;
                self.main_headers[ENC_HEADER_IDX_MPEG4_VOL] = self.generate_header_data(
                    EncHeaderKind::Mpeg4VolHeader,
                    Some(indication),
                    "MPEG-4 VOL header",
                )?;
            }

            // JPEG headers are generated during encoding.
            _ => (),
        }

        Ok(())
    }

    fn generate_header_data(
        &mut self,
        kind: EncHeaderKind,
        mpeg4_user_profile_level: Option<u32>,
        description: &str,
    ) -> Result<Vec<u8>, EncError> {
        let request = EncHeaderRequest { kind, mpeg4_user_profile_level };
        let data = self.handle.generate_header(&request).map_err(|code| {
            error!("header generation command failed: {}", code);
            EncError::Error
        })?;

        trace!("generated {} with {} byte", description, data.len());

        Ok(data)
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decides the MPEG-4 user profile/level indication from the macroblock
/// rate, per the simple-profile level table in ISO/IEC 14496-2 Annex N.
fn mpeg4_user_profile_level_indication(
    width: usize,
    height: usize,
    frame_rate_numerator: u32,
    frame_rate_denominator: u32,
) -> u32 {
    let num_macroblocks_per_frame = ((width + 15) / 16) * ((height + 15) / 16);
    // The added half denominator rounds instead of truncating.
    let num_macroblocks_per_second = (num_macroblocks_per_frame as u64
        * u64::from(frame_rate_numerator)
        + u64::from((frame_rate_denominator + 1) / 2))
        / u64::from(frame_rate_denominator);

    let indication = if width <= 176 && height <= 144 && num_macroblocks_per_second <= 1485 {
        1
    } else if width <= 352 && height <= 288 && num_macroblocks_per_second <= 5940 {
        2
    } else if width <= 352 && height <= 288 && num_macroblocks_per_second <= 11880 {
        3
    } else if width <= 640 && height <= 480 && num_macroblocks_per_second <= 36000 {
        4
    } else if width <= 720 && height <= 576 && num_macroblocks_per_second <= 40500 {
        5
    } else {
        6
    };

    trace!(
        "frame size: {} x {} pixel, {} macroblocks per second => \
         MPEG-4 user profile level indication = {}",
        width,
        height,
        num_macroblocks_per_second,
        indication
    );

    indication
}

/// One row of the H.264 level limit table (Rec. ITU-T H.264 table A-1):
/// max macroblocks per second, max macroblocks per frame, max bitrate in
/// kbps at the baseline/main scale factor.
struct H264LevelLimits {
    level: H264Level,
    max_macroblocks_per_second: u32,
    max_macroblocks_per_frame: u32,
    max_bitrate_kbps: u32,
}

#[rustfmt::skip]
const H264_LEVEL_TABLE: [H264LevelLimits; 16] = [
    H264LevelLimits { level: H264Level::L1,   max_macroblocks_per_second: 1485,   max_macroblocks_per_frame: 99,    max_bitrate_kbps: 64 },
    H264LevelLimits { level: H264Level::L1b,  max_macroblocks_per_second: 1485,   max_macroblocks_per_frame: 99,    max_bitrate_kbps: 128 },
    H264LevelLimits { level: H264Level::L1_1, max_macroblocks_per_second: 3000,   max_macroblocks_per_frame: 396,   max_bitrate_kbps: 192 },
    H264LevelLimits { level: H264Level::L1_2, max_macroblocks_per_second: 6000,   max_macroblocks_per_frame: 396,   max_bitrate_kbps: 384 },
    H264LevelLimits { level: H264Level::L1_3, max_macroblocks_per_second: 11880,  max_macroblocks_per_frame: 396,   max_bitrate_kbps: 768 },
    H264LevelLimits { level: H264Level::L2,   max_macroblocks_per_second: 11880,  max_macroblocks_per_frame: 396,   max_bitrate_kbps: 2000 },
    H264LevelLimits { level: H264Level::L2_1, max_macroblocks_per_second: 19800,  max_macroblocks_per_frame: 792,   max_bitrate_kbps: 4000 },
    H264LevelLimits { level: H264Level::L2_2, max_macroblocks_per_second: 20250,  max_macroblocks_per_frame: 1620,  max_bitrate_kbps: 4000 },
    H264LevelLimits { level: H264Level::L3,   max_macroblocks_per_second: 40500,  max_macroblocks_per_frame: 1620,  max_bitrate_kbps: 10000 },
    H264LevelLimits { level: H264Level::L3_1, max_macroblocks_per_second: 108000, max_macroblocks_per_frame: 3600,  max_bitrate_kbps: 14000 },
    H264LevelLimits { level: H264Level::L3_2, max_macroblocks_per_second: 216000, max_macroblocks_per_frame: 5120,  max_bitrate_kbps: 20000 },
    H264LevelLimits { level: H264Level::L4,   max_macroblocks_per_second: 245760, max_macroblocks_per_frame: 8192,  max_bitrate_kbps: 20000 },
    H264LevelLimits { level: H264Level::L4_1, max_macroblocks_per_second: 245760, max_macroblocks_per_frame: 8192,  max_bitrate_kbps: 50000 },
    H264LevelLimits { level: H264Level::L4_2, max_macroblocks_per_second: 522240, max_macroblocks_per_frame: 8704,  max_bitrate_kbps: 50000 },
    H264LevelLimits { level: H264Level::L5,   max_macroblocks_per_second: 589824, max_macroblocks_per_frame: 22080, max_bitrate_kbps: 135000 },
    H264LevelLimits { level: H264Level::L5_1, max_macroblocks_per_second: 983040, max_macroblocks_per_frame: 36864, max_bitrate_kbps: 240000 },
];

/// Estimates the smallest H.264 level whose limits fit the given
/// resolution, bitrate and frame rate.
fn estimate_h264_level(
    aligned_width: usize,
    aligned_height: usize,
    bitrate_kbps: u32,
    frame_rate_numerator: u32,
    frame_rate_denominator: u32,
) -> H264Level {
    let macroblocks_per_frame = ((aligned_width + 15) / 16) * ((aligned_height + 15) / 16);
    let macroblocks_per_second = (macroblocks_per_frame as u64
        * u64::from(frame_rate_numerator))
        / u64::from(frame_rate_denominator.max(1));

    for limits in &H264_LEVEL_TABLE {
        if macroblocks_per_second <= u64::from(limits.max_macroblocks_per_second)
            && macroblocks_per_frame <= limits.max_macroblocks_per_frame as usize
            && bitrate_kbps <= limits.max_bitrate_kbps
        {
            return limits.level;
        }
    }

    H264Level::L5_1
}

/// Zigzag scan order mapping coefficient positions to raster positions.
#[rustfmt::skip]
const JPEG_ZIGZAG_PATTERN: [usize; 64] = [
     0,  1,  8, 16,  9,  2,  3, 10,
    17, 24, 32, 25, 18, 11,  4,  5,
    12, 19, 26, 33, 40, 48, 41, 34,
    27, 20, 13,  6,  7, 14, 21, 28,
    35, 42, 49, 56, 57, 50, 43, 36,
    29, 22, 15, 23, 30, 37, 44, 51,
    58, 59, 52, 45, 38, 31, 39, 46,
    53, 60, 61, 54, 47, 55, 62, 63,
];

/// The default IJG luminance quantization table, in raster order.
#[rustfmt::skip]
const JPEG_QUANTIZATION_TABLE_LUMA: [u8; 64] = [
    16,  11,  10,  16,  24,  40,  51,  61,
    12,  12,  14,  19,  26,  58,  60,  55,
    14,  13,  16,  24,  40,  57,  69,  56,
    14,  17,  22,  29,  51,  87,  80,  62,
    18,  22,  37,  56,  68, 109, 103,  77,
    24,  35,  55,  64,  81, 104, 113,  92,
    49,  64,  78,  87, 103, 121, 120, 101,
    72,  92,  95,  98, 112, 100, 103,  99,
];

/// The default IJG chrominance quantization table, in raster order.
#[rustfmt::skip]
const JPEG_QUANTIZATION_TABLE_CHROMA: [u8; 64] = [
    17,  18,  24,  47,  99,  99,  99,  99,
    18,  21,  26,  66,  99,  99,  99,  99,
    24,  26,  56,  99,  99,  99,  99,  99,
    47,  66,  99,  99,  99,  99,  99,  99,
    99,  99,  99,  99,  99,  99,  99,  99,
    99,  99,  99,  99,  99,  99,  99,  99,
    99,  99,  99,  99,  99,  99,  99,  99,
    99,  99,  99,  99,  99,  99,  99,  99,
];

// The default Huffman tables of the firmware library.

const JPEG_ENC_HUFFMAN_BITS_LUMA_DC: [u8; 16] =
    [0x00, 0x01, 0x05, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

const JPEG_ENC_HUFFMAN_BITS_LUMA_AC: [u8; 16] =
    [0x00, 0x02, 0x01, 0x03, 0x03, 0x02, 0x04, 0x03, 0x05, 0x05, 0x04, 0x04, 0x00, 0x00, 0x01, 0x7D];

const JPEG_ENC_HUFFMAN_BITS_CHROMA_DC: [u8; 16] =
    [0x00, 0x03, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];

const JPEG_ENC_HUFFMAN_BITS_CHROMA_AC: [u8; 16] =
    [0x00, 0x02, 0x01, 0x02, 0x04, 0x04, 0x03, 0x04, 0x07, 0x05, 0x04, 0x04, 0x00, 0x01, 0x02, 0x77];

const JPEG_ENC_HUFFMAN_VALUE_LUMA_DC: [u8; 12] =
    [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B];

#[rustfmt::skip]
const JPEG_ENC_HUFFMAN_VALUE_LUMA_AC: [u8; 162] = [
    0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12,
    0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61, 0x07,
    0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xA1, 0x08,
    0x23, 0x42, 0xB1, 0xC1, 0x15, 0x52, 0xD1, 0xF0,
    0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0A, 0x16,
    0x17, 0x18, 0x19, 0x1A, 0x25, 0x26, 0x27, 0x28,
    0x29, 0x2A, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39,
    0x3A, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49,
    0x4A, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59,
    0x5A, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69,
    0x6A, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79,
    0x7A, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89,
    0x8A, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98,
    0x99, 0x9A, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7,
    0xA8, 0xA9, 0xAA, 0xB2, 0xB3, 0xB4, 0xB5, 0xB6,
    0xB7, 0xB8, 0xB9, 0xBA, 0xC2, 0xC3, 0xC4, 0xC5,
    0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xD2, 0xD3, 0xD4,
    0xD5, 0xD6, 0xD7, 0xD8, 0xD9, 0xDA, 0xE1, 0xE2,
    0xE3, 0xE4, 0xE5, 0xE6, 0xE7, 0xE8, 0xE9, 0xEA,
    0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8,
    0xF9, 0xFA,
];

const JPEG_ENC_HUFFMAN_VALUE_CHROMA_DC: [u8; 12] =
    [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B];

#[rustfmt::skip]
const JPEG_ENC_HUFFMAN_VALUE_CHROMA_AC: [u8; 162] = [
    0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21,
    0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61, 0x71,
    0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91,
    0xA1, 0xB1, 0xC1, 0x09, 0x23, 0x33, 0x52, 0xF0,
    0x15, 0x62, 0x72, 0xD1, 0x0A, 0x16, 0x24, 0x34,
    0xE1, 0x25, 0xF1, 0x17, 0x18, 0x19, 0x1A, 0x26,
    0x27, 0x28, 0x29, 0x2A, 0x35, 0x36, 0x37, 0x38,
    0x39, 0x3A, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48,
    0x49, 0x4A, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58,
    0x59, 0x5A, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68,
    0x69, 0x6A, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78,
    0x79, 0x7A, 0x82, 0x83, 0x84, 0x85, 0x86, 0x87,
    0x88, 0x89, 0x8A, 0x92, 0x93, 0x94, 0x95, 0x96,
    0x97, 0x98, 0x99, 0x9A, 0xA2, 0xA3, 0xA4, 0xA5,
    0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xB2, 0xB3, 0xB4,
    0xB5, 0xB6, 0xB7, 0xB8, 0xB9, 0xBA, 0xC2, 0xC3,
    0xC4, 0xC5, 0xC6, 0xC7, 0xC8, 0xC9, 0xCA, 0xD2,
    0xD3, 0xD4, 0xD5, 0xD6, 0xD7, 0xD8, 0xD9, 0xDA,
    0xE2, 0xE3, 0xE4, 0xE5, 0xE6, 0xE7, 0xE8, 0xE9,
    0xEA, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8,
    0xF9, 0xFA,
];

/// Component info rows for each sampling pattern, as the firmware copies
/// them into SOF headers (JPEG spec section B.2.2). Per row: component
/// number, vertical and horizontal sampling factor, quantization table
/// index, two reserved bytes.
#[rustfmt::skip]
const JPEG_ENC_COMPONENT_INFO_TABLES: [[[u8; 6]; 4]; 5] = [
    // 4:2:0: one U and one V pixel per 2x2 patch of Y pixels.
    [[0x00, 0x02, 0x02, 0x00, 0x00, 0x00],
     [0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
     [0x02, 0x01, 0x01, 0x01, 0x01, 0x01],
     [0x03, 0x00, 0x00, 0x00, 0x00, 0x00]],
    // 4:2:2 horizontal: one U and one V pixel per horizontal Y pair.
    [[0x00, 0x02, 0x01, 0x00, 0x00, 0x00],
     [0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
     [0x02, 0x01, 0x01, 0x01, 0x01, 0x01],
     [0x03, 0x00, 0x00, 0x00, 0x00, 0x00]],
    // 4:2:2 vertical: one U and one V pixel per vertical Y pair.
    [[0x00, 0x01, 0x02, 0x00, 0x00, 0x00],
     [0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
     [0x02, 0x01, 0x01, 0x01, 0x01, 0x01],
     [0x03, 0x00, 0x00, 0x00, 0x00, 0x00]],
    // 4:4:4: one U and one V pixel per Y pixel.
    [[0x00, 0x01, 0x01, 0x00, 0x00, 0x00],
     [0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
     [0x02, 0x01, 0x01, 0x01, 0x01, 0x01],
     [0x03, 0x00, 0x00, 0x00, 0x00, 0x00]],
    // 4:0:0: only Y pixels; grayscale.
    [[0x00, 0x01, 0x01, 0x00, 0x00, 0x00],
     [0x01, 0x00, 0x00, 0x00, 0x00, 0x00],
     [0x02, 0x00, 0x00, 0x00, 0x00, 0x00],
     [0x03, 0x00, 0x00, 0x00, 0x00, 0x00]],
];

/// Scales one quantization table into zigzag order, clamping every
/// coefficient to the baseline range.
fn copy_quantization_table(source_table: &[u8; 64], scale_factor: u32) -> [u8; 64] {
    let mut dest = [0u8; 64];
    for (i, value) in dest.iter_mut().enumerate() {
        // The +50 ensures rounding instead of truncation.
        let scaled =
            (u32::from(source_table[JPEG_ZIGZAG_PATTERN[i]]) * scale_factor + 50) / 100;
        // The JPEG encoder supports baseline data only, so coefficients
        // above 255 (or below 1) are out.
        *value = scaled.clamp(1, 255) as u8;
    }
    dest
}

/// Builds the Huffman/quantization/component tables for one encoder
/// instance. `quality_factor` follows the IJG 1..100 convention.
fn set_jpeg_tables(quality_factor: u32, sampling: ChromaSampling) -> JpegEncTables {
    let quality_factor = quality_factor.clamp(1, 100);

    // The Independent JPEG Group's formula, as used in libjpeg, turning a
    // quality factor into a table scale factor.
    let scale_factor =
        if quality_factor < 50 { 5000 / quality_factor } else { 200 - quality_factor * 2 };

    let component_info = JPEG_ENC_COMPONENT_INFO_TABLES[match sampling {
        ChromaSampling::S420 => 0,
        ChromaSampling::S422H => 1,
        ChromaSampling::S422V => 2,
        ChromaSampling::S444 => 3,
        ChromaSampling::S400 => 4,
    }];

    JpegEncTables {
        huffman_bits_luma_dc: JPEG_ENC_HUFFMAN_BITS_LUMA_DC,
        huffman_bits_luma_ac: JPEG_ENC_HUFFMAN_BITS_LUMA_AC,
        huffman_bits_chroma_dc: JPEG_ENC_HUFFMAN_BITS_CHROMA_DC,
        huffman_bits_chroma_ac: JPEG_ENC_HUFFMAN_BITS_CHROMA_AC,
        huffman_values_luma_dc: JPEG_ENC_HUFFMAN_VALUE_LUMA_DC,
        huffman_values_luma_ac: JPEG_ENC_HUFFMAN_VALUE_LUMA_AC,
        huffman_values_chroma_dc: JPEG_ENC_HUFFMAN_VALUE_CHROMA_DC,
        huffman_values_chroma_ac: JPEG_ENC_HUFFMAN_VALUE_CHROMA_AC,
        // Cb and Cr use the same table.
        quant_luma: copy_quantization_table(&JPEG_QUANTIZATION_TABLE_LUMA, scale_factor),
        quant_cb: copy_quantization_table(&JPEG_QUANTIZATION_TABLE_CHROMA, scale_factor),
        quant_cr: copy_quantization_table(&JPEG_QUANTIZATION_TABLE_CHROMA, scale_factor),
        component_info,
    }
}
