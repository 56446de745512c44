// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder state machine.
//!
//! Decoding works by first feeding the firmware encoded data until it can
//! report stream-level information (size, frame rate, minimum pool size).
//! Based on that, the caller adds framebuffers to the VPU, forming the
//! framebuffer pool. From then on the cycle is: push one encoded frame into
//! the ring bitstream buffer, run [`Decoder::decode`], and when it reports a
//! displayable frame, fetch it with [`Decoder::get_decoded_frame`].
//!
//! The firmware picks a pool framebuffer per decoded frame and reports its
//! index; a parallel array of frame pool entries associates the
//! caller's context/pts/dts with that index so they can be handed back in
//! presentation order, which may differ from submission order when the
//! stream reorders frames.
//!
//! Decoded pool frames are in the VPU's tiled layout; [`Decoder::get_decoded_frame`]
//! runs the external detiling engine to move them into the caller-owned
//! output buffer, then releases the pool slot back to the firmware.
//!
//! JPEG decoding is the odd one out: there is no real pool (the firmware
//! decodes straight into the output buffer through its rotator), no firmware
//! format-change reporting (the SOF header of every frame is parsed
//! host-side instead), and the bitstream buffer operates in line-buffer
//! mode rather than as a ring.

use std::sync::Arc;

use log::debug;
use log::error;
use log::info;
use log::trace;
use thiserror::Error;

use crate::backend;
use crate::backend::BitstreamStd;
use crate::backend::DecAuxBuffers;
use crate::backend::DecCoreOpenParams;
use crate::backend::DecInitialInfo;
use crate::backend::DecOutputInfo;
use crate::backend::DecStartParams;
use crate::backend::DecoderCore;
use crate::backend::RetCode;
use crate::backend::VpuCore;
use crate::backend::VpuFramebuffer;
use crate::backend::DECODE_IDX_ALL_FRAMES_DECODED;
use crate::backend::DECODE_IDX_FRAME_NOT_DECODED;
use crate::backend::DECODING_SUCCESS_INCOMPLETE_BIT;
use crate::backend::DECODING_SUCCESS_PARAMS_CHANGED_BIT;
use crate::backend::DISPLAY_IDX_ALL_FRAMES_DISPLAYED;
use crate::backend::DISPLAY_IDX_NO_FRAME;
use crate::backend::DISPLAY_IDX_SKIP_MODE_NO_FRAME;
use crate::backend::FRAME_PHYSADDR_ALIGNMENT;
use crate::codec::ivf;
use crate::codec::jpeg;
use crate::codec::rcv;
use crate::codec::vc1;
use crate::detile::DetileEngine;
use crate::detile::DetileJob;
use crate::dmabuf::map_dma_buffer;
use crate::dmabuf::DmaBuffer;
use crate::dmabuf::DmaBufferError;
use crate::dmabuf::DmaMapping;
use crate::dmabuf::MapFlags;
use crate::dmabuf::PhysicalAddress;
use crate::geometry::compute_framebuffer_metrics;
use crate::geometry::FramebufferMetrics;
use crate::align_up;
use crate::ColorFormat;
use crate::CompressionFormat;
use crate::EncodedFrame;
use crate::FrameType;
use crate::InterlacingMode;
use crate::RawFrame;

/// Size of the ring buffer region at the start of the stream buffer.
pub const VPU_DEC_MAIN_BITSTREAM_BUFFER_SIZE: usize = 1024 * 1024 * 3;
/// Worst-case H.264 slice buffer, kept in the stream buffer tail.
const VPU_MAX_SLICE_BUFFER_SIZE: usize = 1920 * 1088 * 15 / 20;
/// SPS/PPS save area, kept after the slice buffer.
const VPU_PS_SAVE_BUFFER_SIZE: usize = 1024 * 512;
/// VP8 macroblock prediction buffer. Shares the slice/PS region, since the
/// firmware never uses both at the same time.
const VPU_VP8_MB_PRED_BUFFER_SIZE: usize = 68 * (1920 * 1088 / 256);

/// Minimum size of the stream buffer handed to [`Decoder::open`].
pub const VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE: usize =
    VPU_DEC_MAIN_BITSTREAM_BUFFER_SIZE + VPU_MAX_SLICE_BUFFER_SIZE + VPU_PS_SAVE_BUFFER_SIZE;

/// Milliseconds to wait for frame completion.
const VPU_WAIT_TIMEOUT_MS: u32 = 500;
/// How many timeouts are tolerated in series.
const VPU_MAX_TIMEOUT_COUNTS: u32 = 4;

/// The `min_frame_buffer_count` the firmware reports is sometimes too low,
/// especially for main/high profile H.264 with heavy reordering. Registering
/// this many extra framebuffers works around it.
const NUM_EXTRA_FRAMEBUFFERS_REQUIRED: usize = 4;

const _: () = assert!(
    VPU_VP8_MB_PRED_BUFFER_SIZE < VPU_MAX_SLICE_BUFFER_SIZE + VPU_PS_SAVE_BUFFER_SIZE,
    "VP8 prediction buffer must fit into the slice/PS region"
);

/// Errors of the decoder surface.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecError {
    #[error("decoder error")]
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
    #[error("invalid extra header data: {0}")]
    InvalidExtraHeaderData(&'static str),
    #[error("unsupported compression format")]
    UnsupportedCompressionFormat,
    #[error("DMA memory access error")]
    DmaMemoryAccessError,
}

impl From<RetCode> for DecError {
    fn from(code: RetCode) -> Self {
        match code {
            RetCode::InvalidHandle => DecError::InvalidHandle,
            RetCode::InvalidParam => DecError::InvalidParams,
            RetCode::InvalidFrameBuffer => DecError::InvalidFramebuffer,
            RetCode::InsufficientFrameBuffers => DecError::InsufficientFramebuffers,
            RetCode::InvalidStride => DecError::InvalidStride,
            RetCode::WrongCallSequence | RetCode::NotInitialized => DecError::InvalidCall,
            RetCode::CalledBefore => DecError::AlreadyCalled,
            RetCode::Timeout => DecError::Timeout,
            RetCode::MemoryAccessViolation => DecError::DmaMemoryAccessError,
            _ => DecError::Error,
        }
    }
}

impl From<DmaBufferError> for DecError {
    fn from(err: DmaBufferError) -> Self {
        error!("{:#}", anyhow::Error::from(err));
        DecError::DmaMemoryAccessError
    }
}

/// What one [`Decoder::decode`] step produced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecOutput {
    /// The step consumed input but nothing is ready yet.
    NoOutputYet,
    /// Stream information was negotiated; add framebuffers to the pool
    /// before decoding further.
    NewStreamInfoAvailable,
    /// Push another encoded frame before calling decode again.
    MoreInputNeeded,
    /// A frame is ready; fetch it with [`Decoder::get_decoded_frame`].
    DecodedFrameAvailable,
    /// The input frame was dropped; see [`Decoder::skipped_frame_info`].
    FrameSkipped,
    /// The stream changed parameters mid-flight. Drain, close and reopen.
    VideoParametersChanged,
    /// All queued frames have been emitted.
    Eos,
}

/// Why an input frame produced no output.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SkippedFrameReason {
    /// The encoded data was corrupted or incomplete.
    CorruptedFrame,
    /// The frame only exists to feed the decoder (VP8 invisible frames,
    /// JPEG bookkeeping entries) and was never meant to be displayed.
    InternalFrame,
}

/// Metadata of the most recently skipped frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SkippedFrameInfo {
    pub reason: SkippedFrameReason,
    pub context: u64,
    pub pts: u64,
    pub dts: u64,
}

/// Crop rectangle in offset/size form.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CropRectangle {
    pub left: usize,
    pub top: usize,
    pub width: usize,
    pub height: usize,
}

/// Parameters for [`Decoder::open`].
#[derive(Clone, Debug)]
pub struct DecOpenParams {
    pub compression_format: CompressionFormat,
    /// Frame size, when known from the container. May be 0 for formats that
    /// carry the size in-band.
    pub frame_width: usize,
    pub frame_height: usize,
    /// Out-of-band codec data from the container. Required for WMV3 (4
    /// bytes of sequence-layer data) and VC-1 (sequence header behind a
    /// length byte); pushed verbatim for the other formats.
    pub extra_header_data: Vec<u8>,
    pub enable_frame_reordering: bool,
    /// Requests semi-planar output for JPEG streams. Non-JPEG streams are
    /// always semi-planar; the detiling engine only handles NV12.
    pub use_semi_planar_color_format: bool,
}

/// Stream-level information negotiated after the decoder has seen enough
/// data.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub color_format: ColorFormat,
    pub decoded_frame_metrics: FramebufferMetrics,
    pub min_num_required_framebuffers: usize,
    /// Size/alignment of buffers destined for the pool (these need MvCol
    /// space and 4096-byte aligned plane addresses for the detiler).
    pub min_fb_pool_framebuffer_size: usize,
    pub fb_pool_framebuffer_alignment: usize,
    /// Size/alignment of caller-owned output buffers (no MvCol space).
    pub min_output_framebuffer_size: usize,
    pub output_framebuffer_alignment: usize,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
    /// H.264 crop rectangle, when the stream declares one.
    pub crop: Option<CropRectangle>,
    pub interlaced: bool,
    pub semi_planar: bool,
}

impl Default for StreamInfo {
    fn default() -> Self {
        Self {
            color_format: ColorFormat::Yuv420SemiPlanar,
            decoded_frame_metrics: Default::default(),
            min_num_required_framebuffers: 0,
            min_fb_pool_framebuffer_size: 0,
            fb_pool_framebuffer_alignment: 0,
            min_output_framebuffer_size: 0,
            output_framebuffer_alignment: 0,
            frame_rate_numerator: 0,
            frame_rate_denominator: 1,
            crop: None,
            interlaced: false,
            semi_planar: true,
        }
    }
}

/// What a pool slot's framebuffer is currently used for.
///
/// Slots cycle Free -> ReservedForDecoding -> ContainsDisplayableFrame ->
/// Free. Only displayable frames reach the outside, via
/// [`Decoder::get_decoded_frame`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum FrameEntryMode {
    #[default]
    Free,
    ReservedForDecoding,
    ContainsDisplayableFrame,
}

/// Bookkeeping for one framebuffer in the pool.
#[derive(Clone)]
struct FramePoolEntry {
    /// Context/pts/dts of the encoded frame being decoded into this slot.
    frame_context: u64,
    pts: u64,
    dts: u64,
    /// Frame types per field, filled once the frame is decoded.
    frame_types: [FrameType; 2],
    interlacing_mode: InterlacingMode,
    mode: FrameEntryMode,
    fb_dma_buffer: Arc<dyn DmaBuffer>,
    fb_context: u64,
}

/// Metadata of the staged encoded frame. The payload itself already sits in
/// the ring buffer; these values wait until the firmware tells us which pool
/// slot it picked.
#[derive(Copy, Clone, Debug, Default)]
struct StagedFrame {
    context: u64,
    pts: u64,
    dts: u64,
    data_size: usize,
}

/// JPEG stream properties shadowed host-side for format-change detection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct JpegShadow {
    width: usize,
    height: usize,
    color_format: ColorFormat,
}

pub struct Decoder {
    core: Arc<dyn VpuCore>,
    handle: Box<dyn DecoderCore>,
    detiler: Box<dyn DetileEngine>,

    stream_buffer: Arc<dyn DmaBuffer>,
    stream_mapping: DmaMapping,
    stream_buffer_physical_address: PhysicalAddress,

    open_params: DecOpenParams,

    jpeg_format_changed: bool,
    jpeg_shadow: Option<JpegShadow>,

    /// Plane offsets of pool framebuffers. These differ from the output
    /// metrics offsets: pool planes are rounded to 8 bytes and followed by
    /// the MvCol region.
    pool_u_offset: usize,
    mvcol_offset: usize,

    total_padded_input_width: usize,
    total_padded_input_height: usize,
    total_padded_output_width: usize,
    total_padded_output_height: usize,

    num_used_framebuffers: usize,
    frame_entries: Vec<FramePoolEntry>,
    num_framebuffers_to_be_added: usize,

    /// Caller-owned buffer the next displayable frame is copied into. For
    /// JPEG, the firmware decodes into it directly via the rotator.
    output_frame_dma_buffer: Option<Arc<dyn DmaBuffer>>,
    output_frame_fb_context: u64,
    output_framebuffer: VpuFramebuffer,

    staged_encoded_frame: Option<StagedFrame>,
    encoded_data_got_pushed: bool,
    main_header_pushed: bool,

    drain_mode_enabled: bool,
    drain_eos_sent_to_vpu: bool,

    initial_info: DecInitialInfo,
    initial_info_available: bool,
    stream_info: StreamInfo,

    dec_output_info: DecOutputInfo,
    /// Pool index of the frame ready for retrieval, or -1.
    available_decoded_frame_idx: i32,

    skipped_frame: Option<SkippedFrameInfo>,

    closed: bool,
}

impl Decoder {
    /// Opens a decoder instance.
    ///
    /// `stream_buffer` must be at least
    /// [`VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE`] bytes; its head is the
    /// ring bitstream buffer, its tail holds the firmware's slice/PS work
    /// areas. It stays mapped until the decoder is closed.
    pub fn open(
        core: Arc<dyn VpuCore>,
        open_params: DecOpenParams,
        stream_buffer: Arc<dyn DmaBuffer>,
        detiler: Box<dyn DetileEngine>,
    ) -> Result<Decoder, DecError> {
        let stream_buffer_size = stream_buffer.size();
        if stream_buffer_size < VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE {
            error!(
                "stream buffer size is {} bytes; need at least {} bytes",
                stream_buffer_size, VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE
            );
            return Err(DecError::InsufficientStreamBufferSize {
                actual: stream_buffer_size,
                required: VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE,
            });
        }

        match open_params.compression_format {
            CompressionFormat::Wmv3 => {
                if open_params.extra_header_data.len() < 4 {
                    error!(
                        "WMV3 input expects 4 bytes of extra header data, got {}",
                        open_params.extra_header_data.len()
                    );
                    return Err(DecError::InvalidExtraHeaderData(
                        "WMV3 needs 4 bytes of sequence layer data",
                    ));
                }
            }
            CompressionFormat::Wvc1 => {
                if open_params.extra_header_data.is_empty() {
                    error!("WVC1 input expects extra header data, but none has been set");
                    return Err(DecError::InvalidExtraHeaderData(
                        "WVC1 needs at least 1 byte of extra header data",
                    ));
                }
            }
            _ => (),
        }

        // The mapping is kept for the lifetime of the instance; manual sync
        // sessions bracket every copy into the ring buffer.
        let stream_mapping =
            map_dma_buffer(&stream_buffer, MapFlags::read_write().with_manual_sync())?;
        let stream_buffer_physical_address = stream_buffer.physical_address();

        let is_jpeg = open_params.compression_format == CompressionFormat::Jpeg;
        let core_params = DecCoreOpenParams {
            bitstream_format: match open_params.compression_format {
                CompressionFormat::H264 => BitstreamStd::Avc,
                CompressionFormat::Mpeg2 => BitstreamStd::Mpeg2,
                CompressionFormat::Mpeg4 => BitstreamStd::Mpeg4 { class: 0 },
                CompressionFormat::H263 => BitstreamStd::H263,
                CompressionFormat::Wmv3 | CompressionFormat::Wvc1 => BitstreamStd::Vc1,
                CompressionFormat::Jpeg => BitstreamStd::Mjpeg,
                CompressionFormat::Vp8 => BitstreamStd::Vp8,
            },
            bitstream_buffer: stream_buffer_physical_address,
            bitstream_buffer_size: VPU_DEC_MAIN_BITSTREAM_BUFFER_SIZE,
            pic_width: open_params.frame_width,
            pic_height: open_params.frame_height,
            chroma_interleave: uses_semi_planar(&open_params),
            reorder_enable: open_params.enable_frame_reordering,
            // Tiled output everywhere except JPEG; the detiler runs later in
            // get_decoded_frame(). JPEG decodes through the rotator into the
            // output buffer, which wants linear frames.
            map_type: if is_jpeg { 0 } else { 1 },
            tiled_to_linear_enable: false,
            bitstream_mode: 1,
            jpeg_line_buffer_mode: is_jpeg,
            ps_save_buffer: stream_buffer_physical_address
                + (VPU_DEC_MAIN_BITSTREAM_BUFFER_SIZE + VPU_MAX_SLICE_BUFFER_SIZE)
                    as PhysicalAddress,
            ps_save_buffer_size: VPU_PS_SAVE_BUFFER_SIZE,
        };

        debug!(
            "opening decoder, frame size: {} x {} pixel",
            open_params.frame_width, open_params.frame_height
        );

        backend::load(core.as_ref()).map_err(|code| {
            error!("loading VPU failed: {}", code);
            DecError::Error
        })?;

        let handle = match core.open_decoder(&core_params) {
            Ok(handle) => handle,
            Err(code) => {
                error!("could not open decoder: {}", code);
                backend::unload(core.as_ref());
                return Err(DecError::Error);
            }
        };

        debug!("successfully opened decoder");

        Ok(Decoder {
            core,
            handle,
            detiler,
            stream_buffer,
            stream_mapping,
            stream_buffer_physical_address,
            open_params,
            jpeg_format_changed: false,
            jpeg_shadow: None,
            pool_u_offset: 0,
            mvcol_offset: 0,
            total_padded_input_width: 0,
            total_padded_input_height: 0,
            total_padded_output_width: 0,
            total_padded_output_height: 0,
            num_used_framebuffers: 0,
            frame_entries: Vec::new(),
            num_framebuffers_to_be_added: 0,
            output_frame_dma_buffer: None,
            output_frame_fb_context: 0,
            output_framebuffer: VpuFramebuffer::default(),
            staged_encoded_frame: None,
            encoded_data_got_pushed: false,
            main_header_pushed: false,
            drain_mode_enabled: false,
            drain_eos_sent_to_vpu: false,
            initial_info: DecInitialInfo::default(),
            initial_info_available: false,
            stream_info: StreamInfo::default(),
            dec_output_info: DecOutputInfo::default(),
            available_decoded_frame_idx: -1,
            skipped_frame: None,
            closed: false,
        })
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.stream_info
    }

    pub fn skipped_frame_info(&self) -> Option<&SkippedFrameInfo> {
        self.skipped_frame.as_ref()
    }

    /// How many pool framebuffers currently hold decoded frames or are
    /// being written into by the firmware.
    pub fn num_used_framebuffers(&self) -> usize {
        self.num_used_framebuffers
    }

    /// Switches to drain mode: no more input will be pushed, and decode
    /// steps emit whatever is still queued until [`DecOutput::Eos`].
    pub fn enable_drain_mode(&mut self) {
        if self.drain_mode_enabled {
            return;
        }

        self.drain_mode_enabled = true;
        // The firmware learns about this during the next decode step, via a
        // zero-byte bitstream update.
        self.drain_eos_sent_to_vpu = false;

        debug!("enabled decoder drain mode");
    }

    pub fn is_drain_mode_enabled(&self) -> bool {
        self.drain_mode_enabled
    }

    /// Registers the caller-owned buffer the next decoded frame is written
    /// into.
    pub fn set_output_frame_dma_buffer(
        &mut self,
        output_frame_dma_buffer: Arc<dyn DmaBuffer>,
        fb_context: u64,
    ) {
        let metrics = &self.stream_info.decoded_frame_metrics;
        let phys_addr = output_frame_dma_buffer.physical_address();

        // Output frames carry no MvCol data; nothing reads motion vectors
        // from them.
        self.output_framebuffer = VpuFramebuffer {
            index: 0,
            y_stride: metrics.y_stride,
            uv_stride: metrics.uv_stride,
            buf_y: phys_addr + metrics.y_offset as PhysicalAddress,
            buf_cb: phys_addr + metrics.u_offset as PhysicalAddress,
            buf_cr: phys_addr + metrics.v_offset as PhysicalAddress,
            buf_mv_col: 0,
        };
        self.output_frame_dma_buffer = Some(output_frame_dma_buffer);
        self.output_frame_fb_context = fb_context;
    }

    /// Stages one encoded frame: runs the per-format preprocessing and
    /// copies the payload into the ring bitstream buffer.
    ///
    /// At most one frame can be staged; decode until the output is no longer
    /// [`DecOutput::MoreInputNeeded`] before pushing the next one.
    pub fn push_encoded_frame(&mut self, encoded_frame: &EncodedFrame) -> Result<(), DecError> {
        if self.drain_mode_enabled {
            error!("tried to push an encoded frame after drain mode was enabled");
            return Err(DecError::InvalidCall);
        }

        if self.staged_encoded_frame.is_some() {
            error!("tried to push an encoded frame before a previous one was decoded");
            return Err(DecError::InvalidCall);
        }

        self.stream_buffer.begin_sync_session();
        let result = self.push_encoded_frame_inner(encoded_frame);
        self.stream_buffer.end_sync_session();
        result?;

        trace!("staged encoded frame");

        self.staged_encoded_frame = Some(StagedFrame {
            context: encoded_frame.context,
            pts: encoded_frame.pts,
            dts: encoded_frame.dts,
            data_size: encoded_frame.data.len(),
        });
        self.encoded_data_got_pushed = true;

        Ok(())
    }

    fn push_encoded_frame_inner(&mut self, encoded_frame: &EncodedFrame) -> Result<(), DecError> {
        self.preprocess_input_data(encoded_frame.data)?;
        self.push_input_data(encoded_frame.data)
    }

    /// Analyzes headers and inserts per-format framing ahead of the main
    /// frame data. The main data itself is only analyzed here, never
    /// written.
    fn preprocess_input_data(&mut self, main_data: &[u8]) -> Result<(), DecError> {
        match self.open_params.compression_format {
            CompressionFormat::Jpeg => {
                // The firmware does not report JPEG size or sampling
                // changes, so the SOF header of every frame is parsed here
                // and compared against the shadow state.
                let info = jpeg::parse_header(main_data).map_err(|err| {
                    error!("encoded frame is not valid JPEG data: {}", err);
                    DecError::Error
                })?;

                let shadow = JpegShadow {
                    width: info.width,
                    height: info.height,
                    color_format: ColorFormat::from_sampling(
                        info.sampling,
                        uses_semi_planar(&self.open_params),
                    ),
                };

                if self.initial_info_available && self.jpeg_shadow != Some(shadow) {
                    self.jpeg_format_changed = true;
                }

                trace!(
                    "JPEG frame information: width: {} height: {} format: {:?} \
                     format changed: {} initial info available: {}",
                    shadow.width,
                    shadow.height,
                    shadow.color_format,
                    self.jpeg_format_changed,
                    self.initial_info_available
                );

                self.jpeg_shadow = Some(shadow);
            }

            CompressionFormat::Wmv3 => {
                // The firmware requires RCV sequence and frame layer
                // headers for WMV3 decoding.
                if self.main_header_pushed {
                    let mut header = [0u8; rcv::FRAME_LAYER_HEADER_SIZE];
                    rcv::write_frame_layer_header(&mut header, main_data.len() as u32);
                    self.push_input_data(&header)?;
                } else {
                    let mut extra = [0u8; 4];
                    extra.copy_from_slice(&self.open_params.extra_header_data[0..4]);
                    let mut header = [0u8; rcv::SEQUENCE_LAYER_HEADER_SIZE];
                    rcv::write_sequence_layer_header(
                        &mut header,
                        self.open_params.frame_width as u32,
                        self.open_params.frame_height as u32,
                        main_data.len() as u32,
                        &extra,
                    );
                    self.push_input_data(&header)?;
                    self.main_header_pushed = true;
                }
            }

            CompressionFormat::Wvc1 => {
                if !self.main_header_pushed {
                    // The extra header data carries the sequence layer
                    // header behind a length byte, which must not reach the
                    // firmware.
                    let extra = self.open_params.extra_header_data[1..].to_vec();
                    trace!("pushing extra header data with {} byte(s)", extra.len());
                    self.push_input_data(&extra)?;
                    self.main_header_pushed = true;
                }

                if let Some(header) = vc1::frame_layer_header(main_data) {
                    trace!("pushing frame layer header with {} byte(s)", header.len());
                    self.push_input_data(&header)?;
                }
            }

            CompressionFormat::Vp8 => {
                // VP8 needs no out-of-band codec data, but the firmware
                // wants the stream framed as IVF.
                if self.main_header_pushed {
                    let mut header = [0u8; ivf::FRAME_HEADER_SIZE];
                    ivf::write_frame_header(&mut header, main_data.len() as u32, 0);
                    trace!("pushing VP8 IVF frame header data with {} byte(s)", header.len());
                    self.push_input_data(&header)?;
                } else {
                    let mut header = [0u8; ivf::SEQUENCE_HEADER_SIZE + ivf::FRAME_HEADER_SIZE];
                    let (sequence, frame) = header.split_at_mut(ivf::SEQUENCE_HEADER_SIZE);
                    ivf::write_sequence_header(
                        sequence.try_into().expect("split size mismatch"),
                        self.open_params.frame_width as u32,
                        self.open_params.frame_height as u32,
                    );
                    ivf::write_frame_header(
                        frame.try_into().expect("split size mismatch"),
                        main_data.len() as u32,
                        0,
                    );
                    trace!(
                        "pushing VP8 IVF main and frame header data with {} byte total",
                        header.len()
                    );
                    self.push_input_data(&header)?;
                    self.main_header_pushed = true;
                }
            }

            _ => {
                if !self.main_header_pushed && !self.open_params.extra_header_data.is_empty() {
                    let extra = self.open_params.extra_header_data.clone();
                    self.push_input_data(&extra)?;
                    self.main_header_pushed = true;
                }
            }
        }

        Ok(())
    }

    /// Writes `data` into the ring bitstream buffer.
    ///
    /// The write position may be near the end of the ring, in which case the
    /// payload is split into two copies, each reported to the firmware
    /// before the next one starts. JPEG uses line-buffer mode instead: the
    /// frame always lands at the start of the buffer and the firmware's ring
    /// pointers are not involved.
    fn push_input_data(&mut self, data: &[u8]) -> Result<(), DecError> {
        // Only the first VPU_DEC_MAIN_BITSTREAM_BUFFER_SIZE bytes form the
        // ring; the bytes beyond are the slice/PS/VP8 work areas.
        let ring_size = VPU_DEC_MAIN_BITSTREAM_BUFFER_SIZE;
        let is_jpeg = self.open_params.compression_format == CompressionFormat::Jpeg;

        let mut write_offset = if is_jpeg {
            0
        } else {
            let status = self.handle.bitstream_status().map_err(|code| {
                error!("could not retrieve bitstream buffer information: {}", code);
                DecError::Error
            })?;
            trace!(
                "bitstream buffer status: read ptr {:#x} write ptr {:#x} num free bytes {}",
                status.read_pointer,
                status.write_pointer,
                status.free_bytes
            );
            (status.write_pointer - self.stream_buffer_physical_address) as usize
        };

        let mut read_offset = 0;
        let mut num_bytes_to_push = (ring_size - write_offset).min(data.len());

        for _ in 0..2 {
            if read_offset >= data.len() {
                break;
            }

            self.stream_mapping.as_mut_slice()[write_offset..write_offset + num_bytes_to_push]
                .copy_from_slice(&data[read_offset..read_offset + num_bytes_to_push]);

            if !is_jpeg {
                self.handle.update_bitstream(num_bytes_to_push).map_err(|code| {
                    error!("could not update bitstream buffer with new data: {}", code);
                    DecError::Error
                })?;
            }

            read_offset += num_bytes_to_push;
            write_offset += num_bytes_to_push;
            num_bytes_to_push = data.len() - read_offset;

            if write_offset >= ring_size {
                write_offset -= ring_size;
            }
        }

        Ok(())
    }

    /// Runs one step of the decoder state machine; the module documentation
    /// describes the overall cycle.
    pub fn decode(&mut self) -> Result<DecOutput, DecError> {
        if self.drain_mode_enabled {
            if self.open_params.compression_format == CompressionFormat::Jpeg {
                // There is nothing to drain for motion JPEG (frames are
                // never queued), but the firmware also never reports an
                // EOS, so produce one manually.
                return Ok(DecOutput::Eos);
            }

            if !self.drain_eos_sent_to_vpu {
                self.drain_eos_sent_to_vpu = true;
                // A zero-byte bitstream update signals end-of-stream.
                self.handle.update_bitstream(0).map_err(|code| {
                    error!("could not signal EOS to the VPU: {}", code);
                    DecError::Error
                })?;
            }
        }

        if self.open_params.compression_format == CompressionFormat::Jpeg
            && self.jpeg_format_changed
        {
            let shadow = self.jpeg_shadow.ok_or(DecError::Error)?;
            let min_num = self.stream_info.min_num_required_framebuffers;
            self.fill_stream_info(
                shadow.width,
                shadow.height,
                shadow.color_format,
                0,
                1,
                min_num,
                false,
            );

            // The old pool no longer fits; a new one must be added before
            // decoding continues.
            self.frame_entries.clear();
            self.num_framebuffers_to_be_added = self.stream_info.min_num_required_framebuffers;
            self.jpeg_format_changed = false;

            return Ok(DecOutput::NewStreamInfoAvailable);
        }

        if !self.initial_info_available && self.encoded_data_got_pushed {
            match self.get_initial_info() {
                Ok(()) => (),
                Err(RetCode::Timeout) => {
                    error!("VPU reported timeout while retrieving initial info");
                    return Err(DecError::Timeout);
                }
                Err(RetCode::WrongCallSequence) | Err(RetCode::CalledBefore) => {
                    return Err(DecError::InvalidCall)
                }
                Err(_) => return Err(DecError::Error),
            }

            self.fill_stream_info_from_initial_info();

            // Framebuffers have to be registered right after the initial
            // info is out.
            self.num_framebuffers_to_be_added = self.stream_info.min_num_required_framebuffers;

            return Ok(DecOutput::NewStreamInfoAvailable);
        }

        if !self.drain_mode_enabled {
            if self.staged_encoded_frame.is_none() {
                trace!("no encoded frame staged");
                return Ok(DecOutput::MoreInputNeeded);
            }

            if self.output_frame_dma_buffer.is_none() {
                error!("no output frame buffer set");
                return Err(DecError::InvalidCall);
            }
        }

        if self.initial_info_available && self.frame_entries.is_empty() {
            error!("no framebuffers have been added to the pool");
            return Err(DecError::InvalidCall);
        }

        let mut params = DecStartParams::default();
        let is_jpeg = self.open_params.compression_format == CompressionFormat::Jpeg;
        if is_jpeg {
            // chunkSize must be nonzero for motion JPEG. The chunk base
            // always points at the start of the stream buffer because of
            // line-buffer mode.
            params.jpeg_chunk_size =
                self.staged_encoded_frame.map(|staged| staged.data_size).unwrap_or(0);
            params.jpeg_chunk_base = self.stream_buffer_physical_address;

            self.handle.set_rotator_output(&self.output_framebuffer).map_err(|code| {
                error!("could not set JPEG rotator output: {}", code);
                DecError::Error
            })?;
        }

        // start_one_frame locks out most firmware calls until output_info
        // is fetched, so the two are paired even on errors.
        match self.handle.start_one_frame(&params) {
            Ok(()) => (),
            Err(RetCode::JpegBitEmpty) => {
                let _ = self.handle.output_info();
                return Ok(DecOutput::MoreInputNeeded);
            }
            Err(RetCode::JpegEos) => {
                // End of JPEG stream; not an error, and there is no output
                // to fetch.
                return Ok(DecOutput::Eos);
            }
            Err(code) => {
                error!("starting frame decoding failed: {}", code);
                let _ = self.handle.output_info();
                return Err(DecError::Error);
            }
        }

        // Sometimes it takes more than one wait to cover the decoding
        // interval.
        trace!("waiting for decoding completion");
        let mut timeout = true;
        for _ in 0..VPU_MAX_TIMEOUT_COUNTS {
            if self.handle.wait_for_interrupt(VPU_WAIT_TIMEOUT_MS) {
                timeout = false;
                break;
            }
            info!("timeout after waiting {} ms for frame completion", VPU_WAIT_TIMEOUT_MS);
        }

        self.dec_output_info = self.handle.output_info().map_err(|code| {
            error!("could not get decoder output info: {}", code);
            DecError::Error
        })?;

        // Only now is it safe to report the timeout; output_info released
        // the firmware lock.
        if timeout {
            return Err(DecError::Timeout);
        }

        trace!(
            "output info: indexFrameDisplay {} indexFrameDecoded {} picType {} idrFlg {} \
             decodingSuccess {:#x} interlacedFrame {}",
            self.dec_output_info.index_frame_display,
            self.dec_output_info.index_frame_decoded,
            self.dec_output_info.pic_type,
            self.dec_output_info.idr_flag,
            self.dec_output_info.decoding_success,
            self.dec_output_info.interlaced_frame,
        );

        let mut output = DecOutput::NoOutputYet;
        let mut skipped_frame_is_internal = false;

        if self.open_params.compression_format == CompressionFormat::Vp8
            && self.dec_output_info.index_frame_decoded >= 0
            && self.dec_output_info.index_frame_display == DISPLAY_IDX_NO_FRAME
        {
            // Internal invisible frames only feed the decoder; make the
            // dropped-frame logic below treat this one as dropped so it
            // never reaches the outside.
            debug!("skip internal invisible frame for VP8");
            self.dec_output_info.index_frame_decoded = DECODE_IDX_FRAME_NOT_DECODED;
            self.dec_output_info.index_frame_display = DISPLAY_IDX_NO_FRAME;
            skipped_frame_is_internal = true;
        }

        if is_jpeg {
            // JPEG decoding uses no real pool; the entry array has exactly
            // one item that tracks the frame in flight.
            self.dec_output_info.index_frame_decoded = 0;
            self.dec_output_info.index_frame_display = 0;
            skipped_frame_is_internal = true;
        }

        if self.dec_output_info.decoding_success & DECODING_SUCCESS_PARAMS_CHANGED_BIT != 0 {
            debug!("video sequence parameters changed");
            return Ok(DecOutput::VideoParametersChanged);
        }

        if self.dec_output_info.index_frame_decoded == DECODE_IDX_ALL_FRAMES_DECODED {
            // Normally prevented by the extra framebuffers registered on
            // top of the reported minimum.
            error!(
                "internal error; not enough output framebuffers were available \
                 even though enough were added prior to decoding"
            );
            return Err(DecError::Error);
        }

        // The staged metadata may be consumed by the skip reporting or the
        // decode-index association below; snapshot it once.
        let staged = self.staged_encoded_frame.unwrap_or_default();

        // Incomplete decoding means incomplete input data; only complete
        // frames are supported, so the frame is dropped.
        if self.dec_output_info.decoding_success & DECODING_SUCCESS_INCOMPLETE_BIT != 0 {
            self.skipped_frame = Some(SkippedFrameInfo {
                reason: SkippedFrameReason::CorruptedFrame,
                context: staged.context,
                pts: staged.pts,
                dts: staged.dts,
            });
            debug!(
                "dropping frame because it is corrupted/incomplete \
                 (context: {:#x} pts {} dts {})",
                staged.context, staged.pts, staged.dts
            );
            output = DecOutput::FrameSkipped;
            self.staged_encoded_frame = None;
        }

        if output != DecOutput::FrameSkipped
            && self.dec_output_info.index_frame_decoded == DECODE_IDX_FRAME_NOT_DECODED
            && (self.dec_output_info.index_frame_display == DISPLAY_IDX_NO_FRAME
                || self.dec_output_info.index_frame_display == DISPLAY_IDX_SKIP_MODE_NO_FRAME)
        {
            self.skipped_frame = Some(SkippedFrameInfo {
                reason: if skipped_frame_is_internal {
                    SkippedFrameReason::InternalFrame
                } else {
                    SkippedFrameReason::CorruptedFrame
                },
                context: staged.context,
                pts: staged.pts,
                dts: staged.dts,
            });
            debug!(
                "frame got skipped/dropped (context: {:#x} pts {} dts {})",
                staged.context, staged.pts, staged.dts
            );
            output = DecOutput::FrameSkipped;
            self.staged_encoded_frame = None;
        }

        // A nonnegative decode index tells us which pool slot the staged
        // frame is being decoded into; that association is what later
        // restores context/pts/dts in presentation order.
        if self.dec_output_info.index_frame_decoded >= 0 {
            let idx_decoded = self.dec_output_info.index_frame_decoded as usize;
            if idx_decoded >= self.frame_entries.len() {
                error!("firmware reported out-of-range decode index {}", idx_decoded);
                return Err(DecError::Error);
            }

            let frame_types = if self.open_params.compression_format == CompressionFormat::H264
                && self.dec_output_info.idr_flag
            {
                [FrameType::Idr; 2]
            } else {
                convert_frame_type(
                    self.open_params.compression_format,
                    self.dec_output_info.pic_type,
                    self.dec_output_info.interlaced_frame,
                )
            };

            let entry = &mut self.frame_entries[idx_decoded];
            entry.frame_context = staged.context;
            entry.pts = staged.pts;
            entry.dts = staged.dts;
            entry.mode = FrameEntryMode::ReservedForDecoding;
            entry.interlacing_mode = convert_interlacing_mode(
                self.open_params.compression_format,
                &self.dec_output_info,
            );
            entry.frame_types = frame_types;

            trace!("staged frame reported as decoded; unstaging");
            self.staged_encoded_frame = None;
            self.num_used_framebuffers += 1;
        }

        if self.dec_output_info.index_frame_display >= 0 {
            let idx_display = self.dec_output_info.index_frame_display as usize;
            if idx_display >= self.frame_entries.len() {
                error!("firmware reported out-of-range display index {}", idx_display);
                return Err(DecError::Error);
            }

            let entry = &mut self.frame_entries[idx_display];
            entry.mode = FrameEntryMode::ContainsDisplayableFrame;

            trace!(
                "decoded and displayable frame available (framebuffer display index: {} \
                 context: {:#x} pts: {} dts: {})",
                idx_display,
                entry.frame_context,
                entry.pts,
                entry.dts
            );

            self.available_decoded_frame_idx = idx_display as i32;
            output = DecOutput::DecodedFrameAvailable;
        } else if self.dec_output_info.index_frame_display == DISPLAY_IDX_ALL_FRAMES_DISPLAYED {
            trace!("EOS reached");
            self.available_decoded_frame_idx = -1;
            self.drain_mode_enabled = false;
            output = DecOutput::Eos;
        } else {
            trace!(
                "nothing yet to display; indexFrameDisplay: {}",
                self.dec_output_info.index_frame_display
            );
        }

        Ok(output)
    }

    /// Retrieves the frame announced by [`DecOutput::DecodedFrameAvailable`].
    ///
    /// For non-JPEG streams the pool frame is detiled into the registered
    /// output buffer here; JPEG frames were already written there by the
    /// firmware. The pool slot returns to the firmware afterwards. Calling
    /// this twice for the same frame fails with [`DecError::InvalidCall`].
    pub fn get_decoded_frame(&mut self) -> Result<RawFrame, DecError> {
        if self.available_decoded_frame_idx < 0 {
            error!("no decoded frame available, or function was already called earlier");
            return Err(DecError::InvalidCall);
        }

        let idx = self.available_decoded_frame_idx as usize;
        debug_assert!(idx < self.frame_entries.len());

        let output_frame_dma_buffer = match &self.output_frame_dma_buffer {
            Some(buffer) => Arc::clone(buffer),
            None => {
                error!("no output frame buffer set");
                return Err(DecError::InvalidCall);
            }
        };

        if self.open_params.compression_format != CompressionFormat::Jpeg {
            let metrics = &self.stream_info.decoded_frame_metrics;
            let job = DetileJob {
                total_padded_input_width: self.total_padded_input_width,
                total_padded_input_height: self.total_padded_input_height,
                total_padded_output_width: self.total_padded_output_width,
                total_padded_output_height: self.total_padded_output_height,
                actual_frame_width: metrics.actual_width,
                actual_frame_height: metrics.actual_height,
                output_color_format: self.stream_info.color_format,
            };
            let source = Arc::clone(&self.frame_entries[idx].fb_dma_buffer);
            if let Err(err) = self.detiler.detile_and_copy(&source, &output_frame_dma_buffer, &job)
            {
                error!("could not detile and copy decoded frame pixels: {:#}", err);
                return Err(DecError::Error);
            }
        }

        let entry = &mut self.frame_entries[idx];
        let raw_frame = RawFrame {
            dma_buffer: output_frame_dma_buffer,
            frame_types: entry.frame_types,
            interlacing_mode: entry.interlacing_mode,
            pts: entry.pts,
            dts: entry.dts,
            context: entry.frame_context,
            fb_context: self.output_frame_fb_context,
        };

        // Erase the context and invalidate the index so no double retrieval
        // can occur.
        entry.frame_context = 0;
        entry.mode = FrameEntryMode::Free;
        self.available_decoded_frame_idx = -1;

        let mut result = Ok(raw_frame);

        // Hand the framebuffer back; the firmware will not pick it again
        // until its display flag is cleared.
        if self.open_params.compression_format != CompressionFormat::Jpeg {
            if let Err(code) = self.handle.clear_display_flag(idx) {
                error!("could not clear display flag: {}", code);
                result = Err(DecError::Error);
            }
        }

        self.num_used_framebuffers -= 1;

        result
    }

    /// Adds framebuffers to the pool. Valid exactly once after each
    /// [`DecOutput::NewStreamInfoAvailable`]; `fb_dma_buffers` must hold at
    /// least [`StreamInfo::min_num_required_framebuffers`] buffers of at
    /// least [`StreamInfo::min_fb_pool_framebuffer_size`] bytes.
    pub fn add_framebuffers_to_pool(
        &mut self,
        fb_dma_buffers: &[Arc<dyn DmaBuffer>],
        fb_contexts: &[u64],
    ) -> Result<(), DecError> {
        if self.num_framebuffers_to_be_added == 0 {
            error!("tried to add framebuffers before it was requested");
            return Err(DecError::InvalidCall);
        }

        if fb_dma_buffers.len() < self.num_framebuffers_to_be_added {
            error!(
                "decoder needs {} framebuffers to be added, got {}",
                self.num_framebuffers_to_be_added,
                fb_dma_buffers.len()
            );
            return Err(DecError::InsufficientFramebuffers);
        }

        debug_assert!(self.frame_entries.is_empty());

        let metrics = &self.stream_info.decoded_frame_metrics;
        let mut internal_framebuffers = Vec::with_capacity(fb_dma_buffers.len());
        let mut frame_entries = Vec::with_capacity(fb_dma_buffers.len());

        for (i, fb_dma_buffer) in fb_dma_buffers.iter().enumerate() {
            let phys_addr = fb_dma_buffer.physical_address();
            if phys_addr == 0 {
                error!(
                    "could not get physical address for DMA buffer {}/{}",
                    i,
                    fb_dma_buffers.len()
                );
                return Err(DecError::DmaMemoryAccessError);
            }

            let y_address = phys_addr;
            let uv_address = phys_addr + self.pool_u_offset as PhysicalAddress;

            // CODA960 packed-pointer layout for tiled framebuffers: the low
            // 12 bits of both plane addresses are guaranteed zero by the
            // 4096-byte alignment requirement, so the firmware reuses them
            // for the upper UV address bits.
            internal_framebuffers.push(VpuFramebuffer {
                index: i,
                y_stride: metrics.y_stride,
                uv_stride: metrics.uv_stride,
                buf_y: (y_address & !0xFFF) | (uv_address >> 20),
                buf_cb: ((uv_address >> 12) & 0xFF) << 24,
                buf_cr: 0,
                buf_mv_col: phys_addr + self.mvcol_offset as PhysicalAddress,
            });

            frame_entries.push(FramePoolEntry {
                frame_context: 0,
                pts: 0,
                dts: 0,
                frame_types: [FrameType::Unknown; 2],
                interlacing_mode: InterlacingMode::NoInterlacing,
                mode: FrameEntryMode::Free,
                fb_dma_buffer: Arc::clone(fb_dma_buffer),
                fb_context: fb_contexts.get(i).copied().unwrap_or(0),
            });
        }

        // The extra work buffers live in the stream buffer tail, after the
        // ring region.
        let aux = DecAuxBuffers {
            slice_buffer: self.stream_buffer_physical_address
                + VPU_DEC_MAIN_BITSTREAM_BUFFER_SIZE as PhysicalAddress,
            slice_buffer_size: VPU_MAX_SLICE_BUFFER_SIZE,
            mb_prediction_buffer: self.stream_buffer_physical_address
                + VPU_DEC_MAIN_BITSTREAM_BUFFER_SIZE as PhysicalAddress,
            mb_prediction_buffer_size: VPU_VP8_MB_PRED_BUFFER_SIZE,
        };

        if self.open_params.compression_format != CompressionFormat::Jpeg {
            self.handle
                .register_framebuffers(&internal_framebuffers, metrics.y_stride, &aux)
                .map_err(|code| {
                    error!("could not register framebuffers: {}", code);
                    DecError::Error
                })?;
        }

        self.frame_entries = frame_entries;
        self.num_framebuffers_to_be_added = 0;

        // JPEG decodes through the rotator; park it on a neutral
        // configuration.
        if self.open_params.compression_format == CompressionFormat::Jpeg {
            if let Err(code) = self.handle.set_rotation_angle(0) {
                error!("could not reset rotation angle: {}", code);
            }
            if let Err(code) = self.handle.set_mirror(0) {
                error!("could not reset mirror direction: {}", code);
            }
            if let Err(code) = self.handle.set_rotator_stride(metrics.y_stride) {
                error!("could not set rotator stride: {}", code);
            }
        }

        Ok(())
    }

    /// Resets the stream: pool slots reserved for decoding are released,
    /// the bit buffer is flushed, and staged/drain state is cleared. The
    /// pool itself stays registered.
    pub fn flush(&mut self) {
        if self.frame_entries.is_empty() {
            debug!("attempted to flush, but there are no framebuffers in the pool; ignoring call");
            return;
        }

        // The firmware needs no flushing for RCV data and reacts badly to
        // it.
        if self.open_params.compression_format == CompressionFormat::Wmv3 {
            debug!("WMV3 requires no flushing to be done");
            return;
        }

        debug!("flushing decoder");

        for i in 0..self.frame_entries.len() {
            if self.frame_entries[i].mode == FrameEntryMode::ReservedForDecoding {
                if let Err(code) = self.handle.clear_display_flag(i) {
                    error!("could not clear display flag while flushing: {}", code);
                }
                self.frame_entries[i].mode = FrameEntryMode::Free;
            }
        }

        if let Err(code) = self.handle.flush_bit_buffer() {
            error!("could not flush bit buffer: {}", code);
        }

        for entry in &mut self.frame_entries {
            entry.frame_context = 0;
        }

        self.jpeg_format_changed = false;
        self.num_used_framebuffers = 0;
        self.staged_encoded_frame = None;
        self.drain_mode_enabled = false;
        self.drain_eos_sent_to_vpu = false;

        debug!("flushed decoder");
    }

    /// Closes the decoder. Queued data is abandoned; EOS is signalled to the
    /// firmware best-effort before teardown.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        debug!("closing decoder");

        // Flushing without registered framebuffers produces a pointless
        // "wrong call sequence" error, and JPEG needs no flushing at all.
        if self.open_params.compression_format != CompressionFormat::Jpeg
            && !self.frame_entries.is_empty()
        {
            if let Err(code) = self.handle.flush_bit_buffer() {
                error!("could not flush decoder: {}", code);
            }
        }

        if let Err(code) = self.handle.update_bitstream(0) {
            error!("could not signal EOS to the decoder: {}", code);
        }

        if let Err(code) = self.handle.close() {
            error!("could not close decoder: {}", code);
        }

        backend::unload(self.core.as_ref());
    }

    fn get_initial_info(&mut self) -> Result<(), RetCode> {
        self.initial_info_available = false;

        // The force-escape flag makes retrieval tolerate insufficient data
        // instead of blocking; it is cleared right after, as the firmware
        // documentation recommends.
        self.handle.set_force_escape(true).map_err(|code| {
            error!("could not set force escape flag: {}", code);
            RetCode::Failure
        })?;

        let result = self.handle.initial_info();

        let _ = self.handle.set_force_escape(false);

        match result {
            Ok(info) => {
                self.initial_info = info;
                self.initial_info_available = true;
                Ok(())
            }
            Err(code) => {
                error!("retrieving initial info failed: {}", code);
                Err(code)
            }
        }
    }

    fn fill_stream_info_from_initial_info(&mut self) {
        let initial_info = self.initial_info;
        let semi_planar = uses_semi_planar(&self.open_params);

        let mut frame_width = initial_info.pic_width;
        let mut frame_height = initial_info.pic_height;

        let color_format = if self.open_params.compression_format == CompressionFormat::Jpeg {
            // The firmware occasionally reports zero dimensions for JPEG;
            // the host-side SOF parse fills the gap.
            if let Some(shadow) = self.jpeg_shadow {
                if frame_width == 0 {
                    frame_width = shadow.width;
                }
                if frame_height == 0 {
                    frame_height = shadow.height;
                }
            }
            ColorFormat::from_sampling(initial_info.jpeg_sampling, semi_planar)
        } else {
            // The initial-info sizes can contain padding; prefer the actual
            // sizes from the open params when available.
            if self.open_params.frame_width > 0 {
                frame_width = self.open_params.frame_width;
            }
            if self.open_params.frame_height > 0 {
                frame_height = self.open_params.frame_height;
            }
            ColorFormat::from_sampling(crate::ChromaSampling::S420, semi_planar)
        };

        // See NUM_EXTRA_FRAMEBUFFERS_REQUIRED; JPEG has no pool, so no
        // extras either.
        let min_num_required_framebuffers = initial_info.min_frame_buffer_count
            + if self.open_params.compression_format == CompressionFormat::Jpeg {
                0
            } else {
                NUM_EXTRA_FRAMEBUFFERS_REQUIRED
            };

        self.fill_stream_info(
            frame_width,
            frame_height,
            color_format,
            initial_info.frame_rate_numerator,
            initial_info.frame_rate_denominator,
            min_num_required_framebuffers,
            initial_info.interlace,
        );

        if self.open_params.compression_format == CompressionFormat::H264 {
            let crop = &initial_info.crop;
            if crop.left < crop.right && crop.top < crop.bottom {
                self.stream_info.crop = Some(CropRectangle {
                    left: crop.left,
                    top: crop.top,
                    width: crop.right - crop.left,
                    height: crop.bottom - crop.top,
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_stream_info(
        &mut self,
        actual_frame_width: usize,
        actual_frame_height: usize,
        color_format: ColorFormat,
        frame_rate_numerator: u32,
        frame_rate_denominator: u32,
        min_num_required_framebuffers: usize,
        interlaced: bool,
    ) {
        let semi_planar = uses_semi_planar(&self.open_params);
        let metrics = compute_framebuffer_metrics(
            color_format,
            actual_frame_width,
            actual_frame_height,
            0,
            interlaced,
        );

        // Pool framebuffers keep their planes on 8-byte boundaries and
        // append the MvCol region; output framebuffers are dense and have
        // neither.
        self.pool_u_offset = align_up(metrics.y_size, 8);
        self.mvcol_offset = align_up(
            (if semi_planar { metrics.u_offset } else { metrics.v_offset }) + metrics.uv_size,
            8,
        );

        let grayscale = color_format == ColorFormat::Yuv400;
        self.total_padded_input_width = metrics.y_stride;
        self.total_padded_input_height = if grayscale {
            metrics.aligned_height
        } else {
            (metrics.u_offset - metrics.y_offset) / metrics.y_stride
        };
        self.total_padded_output_width = metrics.y_stride;
        self.total_padded_output_height = if grayscale {
            metrics.aligned_height
        } else {
            self.pool_u_offset / metrics.y_stride
        };

        self.stream_info = StreamInfo {
            color_format,
            decoded_frame_metrics: metrics,
            min_num_required_framebuffers: min_num_required_framebuffers.max(1),
            min_fb_pool_framebuffer_size: self.mvcol_offset + metrics.uv_size,
            fb_pool_framebuffer_alignment: FRAME_PHYSADDR_ALIGNMENT,
            min_output_framebuffer_size: (if semi_planar {
                metrics.u_offset
            } else {
                metrics.v_offset
            }) + metrics.uv_size,
            output_framebuffer_alignment: FRAME_PHYSADDR_ALIGNMENT,
            frame_rate_numerator,
            frame_rate_denominator,
            crop: None,
            interlaced,
            semi_planar,
        };
    }

}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn uses_semi_planar(open_params: &DecOpenParams) -> bool {
    // Non-JPEG output is always semi-planar: the detiling engine cannot
    // handle anything but NV12.
    open_params.compression_format != CompressionFormat::Jpeg
        || open_params.use_semi_planar_color_format
}

/// Maps the firmware's numeric picture type to frame types, one per field.
pub(crate) fn convert_frame_type(
    compression_format: CompressionFormat,
    pic_type: u32,
    interlaced: bool,
) -> [FrameType; 2] {
    fn vc1_type(bits: u32) -> FrameType {
        match bits {
            0 => FrameType::I,
            1 => FrameType::P,
            2 => FrameType::BI,
            3 => FrameType::B,
            4 => FrameType::Skip,
            _ => FrameType::Unknown,
        }
    }

    match compression_format {
        // WMV3 interlacing was never documented and got superseded by
        // VC-1, so both fields carry the same type.
        CompressionFormat::Wmv3 => [vc1_type(pic_type & 0x07); 2],

        CompressionFormat::Wvc1 => {
            if interlaced {
                [vc1_type(pic_type & 0x07), vc1_type((pic_type >> 3) & 0x07)]
            } else {
                [vc1_type(pic_type & 0x07); 2]
            }
        }

        _ => {
            let frame_type = match pic_type {
                0 => FrameType::I,
                1 => FrameType::P,
                2 | 3 => FrameType::B,
                _ => FrameType::Unknown,
            };
            [frame_type; 2]
        }
    }
}

fn convert_interlacing_mode(
    compression_format: CompressionFormat,
    dec_output_info: &DecOutputInfo,
) -> InterlacingMode {
    if !dec_output_info.interlaced_frame {
        return InterlacingMode::NoInterlacing;
    }

    let mut result = if dec_output_info.top_field_first {
        InterlacingMode::TopFieldFirst
    } else {
        InterlacingMode::BottomFieldFirst
    };

    if compression_format == CompressionFormat::H264 {
        match dec_output_info.h264_npf {
            1 => result = InterlacingMode::BottomFieldOnly,
            2 => result = InterlacingMode::TopFieldOnly,
            _ => (),
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_mapping_default_formats() {
        assert_eq!(
            convert_frame_type(CompressionFormat::H264, 0, false),
            [FrameType::I, FrameType::I]
        );
        assert_eq!(
            convert_frame_type(CompressionFormat::Mpeg2, 1, false),
            [FrameType::P, FrameType::P]
        );
        assert_eq!(
            convert_frame_type(CompressionFormat::H264, 2, false),
            [FrameType::B, FrameType::B]
        );
        assert_eq!(
            convert_frame_type(CompressionFormat::H264, 3, false),
            [FrameType::B, FrameType::B]
        );
        assert_eq!(
            convert_frame_type(CompressionFormat::H264, 7, false),
            [FrameType::Unknown, FrameType::Unknown]
        );
    }

    #[test]
    fn frame_type_mapping_wmv3() {
        assert_eq!(
            convert_frame_type(CompressionFormat::Wmv3, 2, false),
            [FrameType::BI, FrameType::BI]
        );
        assert_eq!(
            convert_frame_type(CompressionFormat::Wmv3, 4, false),
            [FrameType::Skip, FrameType::Skip]
        );
        // Only the low 3 bits matter.
        assert_eq!(
            convert_frame_type(CompressionFormat::Wmv3, 8 | 1, false),
            [FrameType::P, FrameType::P]
        );
    }

    #[test]
    fn frame_type_mapping_vc1_interlaced_fields() {
        // Field 0 is P, field 1 is B.
        let pic_type = 1 | (3 << 3);
        assert_eq!(
            convert_frame_type(CompressionFormat::Wvc1, pic_type, true),
            [FrameType::P, FrameType::B]
        );
        assert_eq!(
            convert_frame_type(CompressionFormat::Wvc1, pic_type, false),
            [FrameType::P, FrameType::P]
        );
    }

    #[test]
    fn interlacing_mode_mapping() {
        let mut info = DecOutputInfo { interlaced_frame: false, ..Default::default() };
        assert_eq!(
            convert_interlacing_mode(CompressionFormat::H264, &info),
            InterlacingMode::NoInterlacing
        );

        info.interlaced_frame = true;
        info.top_field_first = true;
        assert_eq!(
            convert_interlacing_mode(CompressionFormat::Mpeg2, &info),
            InterlacingMode::TopFieldFirst
        );

        info.top_field_first = false;
        assert_eq!(
            convert_interlacing_mode(CompressionFormat::Mpeg2, &info),
            InterlacingMode::BottomFieldFirst
        );

        // H.264 non-paired fields override the field order.
        info.h264_npf = 2;
        assert_eq!(
            convert_interlacing_mode(CompressionFormat::H264, &info),
            InterlacingMode::TopFieldOnly
        );
        assert_eq!(
            convert_interlacing_mode(CompressionFormat::Mpeg2, &info),
            InterlacingMode::BottomFieldFirst
        );
    }
}
