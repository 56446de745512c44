// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the VPU firmware shim.
//!
//! The decoder and encoder state machines never talk to hardware directly;
//! they drive implementations of [`DecoderCore`] and [`EncoderCore`]
//! obtained from a [`VpuCore`]. A production build wires these traits to the
//! vendor firmware library; tests wire them to a scriptable mock.
//!
//! The types in this module mirror the firmware's own vocabulary (raw
//! picture type words, signed framebuffer indices, packed frame rate words).
//! Translating them into the crate's public types is the job of the state
//! machines, not of the shim.

use std::fmt;
use std::sync::Mutex;

use crate::dmabuf::PhysicalAddress;
use crate::ChromaSampling;

/// Return codes of the firmware shim.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetCode {
    Success,
    Failure,
    InvalidHandle,
    InvalidParam,
    InvalidCommand,
    RotatorOutputNotSet,
    RotatorStrideNotSet,
    FrameNotComplete,
    InvalidFrameBuffer,
    InsufficientFrameBuffers,
    InvalidStride,
    WrongCallSequence,
    CalledBefore,
    NotInitialized,
    DeblockingOutputNotSet,
    NotSupported,
    ReportBufNotSet,
    Timeout,
    MemoryAccessViolation,
    /// End of a JPEG stream. Not an error.
    JpegEos,
    /// The JPEG bit buffer ran empty before a header could be parsed.
    JpegBitEmpty,
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetCode::Success => "success",
            RetCode::Failure => "failure",
            RetCode::InvalidHandle => "invalid handle",
            RetCode::InvalidParam => "invalid parameters",
            RetCode::InvalidCommand => "invalid command",
            RetCode::RotatorOutputNotSet => {
                "rotation enabled but rotator output buffer not set"
            }
            RetCode::RotatorStrideNotSet => "rotation enabled but rotator stride not set",
            RetCode::FrameNotComplete => "frame processing operation not complete",
            RetCode::InvalidFrameBuffer => "frame buffers are invalid",
            RetCode::InsufficientFrameBuffers => "not enough frame buffers specified",
            RetCode::InvalidStride => "invalid stride",
            RetCode::WrongCallSequence => "wrong call sequence",
            RetCode::CalledBefore => "already called before",
            RetCode::NotInitialized => "VPU is not initialized",
            RetCode::DeblockingOutputNotSet => {
                "deblocking activated but deblocking information not available"
            }
            RetCode::NotSupported => "feature not supported",
            RetCode::ReportBufNotSet => "data report buffer address not set",
            RetCode::Timeout => "timeout",
            RetCode::MemoryAccessViolation => "memory access violation",
            RetCode::JpegEos => "JPEG end-of-stream reached",
            RetCode::JpegBitEmpty => "JPEG bit buffer empty - cannot parse header",
        };
        f.write_str(s)
    }
}

/// Bitstream standards as the firmware enumerates them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BitstreamStd {
    Avc,
    Mpeg2,
    Mpeg4 { class: u32 },
    H263,
    Vc1,
    Mjpeg,
    Vp8,
}

/// Alignment the physical address of every framebuffer must have. The
/// packed-pointer framebuffer layout (and the detiling engine) rely on it.
pub const FRAME_PHYSADDR_ALIGNMENT: usize = 4096;

/// `indexFrameDisplay`: all queued frames have been displayed (EOS).
pub const DISPLAY_IDX_ALL_FRAMES_DISPLAYED: i32 = -1;
/// `indexFrameDisplay`: frame skip mode produced no frame to display.
pub const DISPLAY_IDX_SKIP_MODE_NO_FRAME: i32 = -2;
/// `indexFrameDisplay`: no frame to display (yet).
pub const DISPLAY_IDX_NO_FRAME: i32 = -3;

/// `indexFrameDecoded`: all frames have been decoded.
pub const DECODE_IDX_ALL_FRAMES_DECODED: i32 = -1;
/// `indexFrameDecoded`: no frame was decoded in this cycle.
pub const DECODE_IDX_FRAME_NOT_DECODED: i32 = -2;

/// Bit of the `decoding_success` word reporting that the video sequence
/// parameters changed mid-stream.
pub const DECODING_SUCCESS_PARAMS_CHANGED_BIT: u32 = 1 << 20;
/// Bit of the `decoding_success` word reporting incomplete/corrupted frame
/// data.
pub const DECODING_SUCCESS_INCOMPLETE_BIT: u32 = 1 << 4;

/// One framebuffer descriptor as the firmware consumes it. All addresses are
/// physical.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VpuFramebuffer {
    pub index: usize,
    pub y_stride: usize,
    pub uv_stride: usize,
    pub buf_y: PhysicalAddress,
    pub buf_cb: PhysicalAddress,
    pub buf_cr: PhysicalAddress,
    pub buf_mv_col: PhysicalAddress,
}

/// Parameters for opening a firmware decoder instance.
#[derive(Clone, Debug)]
pub struct DecCoreOpenParams {
    pub bitstream_format: BitstreamStd,
    pub bitstream_buffer: PhysicalAddress,
    pub bitstream_buffer_size: usize,
    pub pic_width: usize,
    pub pic_height: usize,
    pub chroma_interleave: bool,
    pub reorder_enable: bool,
    /// 0 = linear, 1 = frame-tiled, 2 = field-tiled output.
    pub map_type: u32,
    pub tiled_to_linear_enable: bool,
    pub bitstream_mode: u32,
    pub jpeg_line_buffer_mode: bool,
    pub ps_save_buffer: PhysicalAddress,
    pub ps_save_buffer_size: usize,
}

/// H.264 crop rectangle as edge coordinates, the way the firmware reports
/// it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CropRect {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
}

/// Stream-level information produced by the firmware once it has seen enough
/// encoded data.
#[derive(Copy, Clone, Debug, Default)]
pub struct DecInitialInfo {
    pub pic_width: usize,
    pub pic_height: usize,
    pub frame_rate_numerator: u32,
    pub frame_rate_denominator: u32,
    pub min_frame_buffer_count: usize,
    pub interlace: bool,
    /// Chroma sampling of the stream; meaningful for JPEG only.
    pub jpeg_sampling: ChromaSampling,
    pub crop: CropRect,
}

/// Read/write positions of the ring bitstream buffer, as physical addresses.
#[derive(Copy, Clone, Debug, Default)]
pub struct BitstreamStatus {
    pub read_pointer: PhysicalAddress,
    pub write_pointer: PhysicalAddress,
    pub free_bytes: usize,
}

/// Auxiliary work buffers registered together with the framebuffer pool.
/// Both live in the tail of the caller's stream buffer.
#[derive(Copy, Clone, Debug, Default)]
pub struct DecAuxBuffers {
    pub slice_buffer: PhysicalAddress,
    pub slice_buffer_size: usize,
    pub mb_prediction_buffer: PhysicalAddress,
    pub mb_prediction_buffer_size: usize,
}

/// Per-cycle decode parameters. Only JPEG uses any of these.
#[derive(Copy, Clone, Debug, Default)]
pub struct DecStartParams {
    pub jpeg_chunk_size: usize,
    pub jpeg_chunk_base: PhysicalAddress,
}

/// Result record of one decode cycle.
#[derive(Copy, Clone, Debug)]
pub struct DecOutputInfo {
    pub index_frame_decoded: i32,
    pub index_frame_display: i32,
    pub pic_type: u32,
    pub idr_flag: bool,
    pub decoding_success: u32,
    pub interlaced_frame: bool,
    pub top_field_first: bool,
    /// H.264 non-paired-field indicator.
    pub h264_npf: u32,
}

impl Default for DecOutputInfo {
    fn default() -> Self {
        Self {
            index_frame_decoded: DECODE_IDX_FRAME_NOT_DECODED,
            index_frame_display: DISPLAY_IDX_NO_FRAME,
            pic_type: 0,
            idr_flag: false,
            decoding_success: 0,
            interlaced_frame: false,
            top_field_first: false,
            h264_npf: 0,
        }
    }
}

/// A firmware decoder instance.
///
/// `start_one_frame` locks the firmware against most other calls until
/// `output_info` is fetched; the state machine honors that by always pairing
/// the two, even on errors and timeouts.
pub trait DecoderCore {
    fn bitstream_status(&mut self) -> Result<BitstreamStatus, RetCode>;

    /// Reports `len` newly written bytes to the firmware. A length of 0
    /// signals end-of-stream.
    fn update_bitstream(&mut self, len: usize) -> Result<(), RetCode>;

    /// Sets the force-escape flag that makes initial info retrieval tolerate
    /// insufficient data instead of blocking.
    fn set_force_escape(&mut self, enable: bool) -> Result<(), RetCode>;

    fn initial_info(&mut self) -> Result<DecInitialInfo, RetCode>;

    fn register_framebuffers(
        &mut self,
        framebuffers: &[VpuFramebuffer],
        stride: usize,
        aux: &DecAuxBuffers,
    ) -> Result<(), RetCode>;

    fn start_one_frame(&mut self, params: &DecStartParams) -> Result<(), RetCode>;

    /// Waits for the frame-complete interrupt. Returns false on timeout.
    fn wait_for_interrupt(&mut self, timeout_ms: u32) -> bool;

    fn output_info(&mut self) -> Result<DecOutputInfo, RetCode>;

    /// Returns a pool framebuffer to the firmware after its frame has been
    /// displayed.
    fn clear_display_flag(&mut self, index: usize) -> Result<(), RetCode>;

    fn flush_bit_buffer(&mut self) -> Result<(), RetCode>;

    fn set_rotation_angle(&mut self, angle: u32) -> Result<(), RetCode>;
    fn set_mirror(&mut self, mirror: u32) -> Result<(), RetCode>;
    fn set_rotator_stride(&mut self, stride: usize) -> Result<(), RetCode>;
    /// Sets the buffer the JPEG rotator decodes into.
    fn set_rotator_output(&mut self, framebuffer: &VpuFramebuffer) -> Result<(), RetCode>;

    fn close(&mut self) -> Result<(), RetCode>;
}

/// The JPEG Huffman and quantization tables handed to the firmware at
/// encoder open time, plus the component info rows it copies into SOF
/// headers.
#[derive(Clone)]
pub struct JpegEncTables {
    pub huffman_bits_luma_dc: [u8; 16],
    pub huffman_bits_luma_ac: [u8; 16],
    pub huffman_bits_chroma_dc: [u8; 16],
    pub huffman_bits_chroma_ac: [u8; 16],
    pub huffman_values_luma_dc: [u8; 12],
    pub huffman_values_luma_ac: [u8; 162],
    pub huffman_values_chroma_dc: [u8; 12],
    pub huffman_values_chroma_ac: [u8; 162],
    /// Zigzag-ordered quantization tables for Y, Cb and Cr.
    pub quant_luma: [u8; 64],
    pub quant_cb: [u8; 64],
    pub quant_cr: [u8; 64],
    /// 4 component rows of 6 bytes each, JPEG spec section B.2.2.
    pub component_info: [[u8; 6]; 4],
}

/// Per-standard parameters of a firmware encoder instance.
#[derive(Clone)]
pub enum EncStdParams {
    Mpeg4 {
        data_partitioning: bool,
        reversible_vlc: bool,
        intra_dc_vlc_thr: u32,
        hec_enable: bool,
        version_id: u32,
    },
    H263 {
        annex_i: bool,
        annex_j: bool,
        annex_k: bool,
        annex_t: bool,
    },
    H264 {
        constrained_intra_pred: bool,
        disable_deblocking: bool,
        deblock_filter_offset_alpha: i32,
        deblock_filter_offset_beta: i32,
        chroma_qp_offset: i32,
        /// Firmware-side AUD generation; the library inserts AUDs itself to
        /// get the AUD-SPS-PPS-VCL order right, so this stays off.
        aud_enable: bool,
        frame_cropping: bool,
        frame_crop_right: usize,
        frame_crop_bottom: usize,
    },
    Jpeg {
        source_sampling: ChromaSampling,
        restart_interval: u32,
        tables: Box<JpegEncTables>,
    },
}

/// Parameters for opening a firmware encoder instance.
#[derive(Clone)]
pub struct EncCoreOpenParams {
    pub bitstream_buffer: PhysicalAddress,
    pub bitstream_buffer_size: usize,
    pub pic_width: usize,
    pub pic_height: usize,
    /// `numerator | ((denominator - 1) << 16)`.
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
    pub gop_size: u32,
    pub chroma_interleave: bool,
    pub initial_delay: u32,
    pub vbv_buffer_size: u32,
    pub intra_refresh_mb_count: u32,
    pub rc_intra_qp: i32,
    pub user_gamma: u32,
    pub me_search_range: u32,
    pub intra_cost_weight: u32,
    pub ring_buffer_enable: bool,
    pub linear_to_tiled_enable: bool,
    pub map_type: u32,
    pub std_params: EncStdParams,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct EncInitialInfo {
    pub min_frame_buffer_count: usize,
}

/// Header blobs the firmware can generate on demand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncHeaderKind {
    H264SpsRbsp,
    H264PpsRbsp,
    Mpeg4VosHeader,
    Mpeg4VisHeader,
    Mpeg4VolHeader,
}

/// Request for one header blob.
#[derive(Copy, Clone, Debug)]
pub struct EncHeaderRequest {
    pub kind: EncHeaderKind,
    /// MPEG-4 user profile/level indication, when one is to be written into
    /// the VOS header.
    pub mpeg4_user_profile_level: Option<u32>,
}

/// The MPEG-4 scratch buffer, carved out of the caller's stream buffer.
#[derive(Copy, Clone, Debug, Default)]
pub struct ScratchBuffer {
    pub base: PhysicalAddress,
    pub size: usize,
}

/// Per-cycle encode parameters.
#[derive(Copy, Clone, Debug)]
pub struct EncStartParams {
    /// Descriptor addressing the caller's raw frame.
    pub source: VpuFramebuffer,
    pub force_i_picture: bool,
    pub quant_param: u32,
}

/// Result record of one encode cycle.
#[derive(Copy, Clone, Debug, Default)]
pub struct EncOutputInfo {
    /// Physical address of the encoded payload inside the stream buffer, or
    /// 0 if no payload was produced.
    pub bitstream_buffer: PhysicalAddress,
    pub bitstream_size: usize,
    pub pic_type: u32,
}

/// A firmware encoder instance.
pub trait EncoderCore {
    fn initial_info(&mut self) -> Result<EncInitialInfo, RetCode>;

    /// Registers the reference framebuffer pool. JPEG passes an empty slice
    /// and only the stride matters. The two subsample buffer addresses are 0
    /// for JPEG as well.
    fn register_framebuffers(
        &mut self,
        framebuffers: &[VpuFramebuffer],
        stride: usize,
        subsample_buffer_a: PhysicalAddress,
        subsample_buffer_b: PhysicalAddress,
        scratch: &ScratchBuffer,
    ) -> Result<(), RetCode>;

    /// Generates one header blob (SPS/PPS for H.264, VOS/VIS/VOL for
    /// MPEG-4).
    fn generate_header(&mut self, request: &EncHeaderRequest) -> Result<Vec<u8>, RetCode>;

    /// Produces the JPEG header (starting with the SOI marker) for the frame
    /// about to be encoded. `max_size` bounds the blob.
    fn jpeg_header(&mut self, max_size: usize) -> Result<Vec<u8>, RetCode>;

    fn start_one_frame(&mut self, params: &EncStartParams) -> Result<(), RetCode>;

    /// Waits for the frame-complete interrupt. Returns false on timeout.
    fn wait_for_interrupt(&mut self, timeout_ms: u32) -> bool;

    fn output_info(&mut self) -> Result<EncOutputInfo, RetCode>;

    fn set_bitrate(&mut self, bitrate_kbps: u32) -> Result<(), RetCode>;

    /// Sets the frame rate as the packed `num | ((den - 1) << 16)` word.
    fn set_frame_rate(&mut self, packed_frame_rate: u32) -> Result<(), RetCode>;

    fn set_rotation_angle(&mut self, angle: u32) -> Result<(), RetCode>;
    fn set_mirror(&mut self, mirror: u32) -> Result<(), RetCode>;

    /// Resets the firmware instance. Used when a close is refused because a
    /// frame is partially encoded.
    fn software_reset(&mut self) -> Result<(), RetCode>;

    fn close(&mut self) -> Result<(), RetCode>;
}

/// Process-wide firmware entry point.
pub trait VpuCore {
    /// Initializes the firmware. Called on the first [`load`].
    fn init(&self) -> Result<(), RetCode>;

    /// Deinitializes the firmware. Called on the last [`unload`].
    fn deinit(&self);

    fn open_decoder(
        &self,
        params: &DecCoreOpenParams,
    ) -> Result<Box<dyn DecoderCore>, RetCode>;

    fn open_encoder(
        &self,
        params: &EncCoreOpenParams,
    ) -> Result<Box<dyn EncoderCore>, RetCode>;
}

/// Packs a frame rate ratio into the firmware's register layout.
pub fn pack_frame_rate(numerator: u32, denominator: u32) -> u32 {
    (numerator & 0xffff) | ((denominator.wrapping_sub(1) & 0xffff) << 16)
}

static VPU_INIT_INSTANCE_COUNTER: Mutex<usize> = Mutex::new(0);

/// Loads the firmware, initializing it on the first call.
///
/// Codec instances call this once per open and pair it with [`unload`] at
/// close time. The counter is process-wide.
pub fn load(core: &dyn VpuCore) -> Result<(), RetCode> {
    let mut counter = VPU_INIT_INSTANCE_COUNTER.lock().unwrap();

    log::trace!("VPU init instance counter: {}", *counter);

    if *counter == 0 {
        core.init()?;
        log::debug!("loaded VPU");
    }
    *counter += 1;

    Ok(())
}

/// Unloads the firmware, deinitializing it when the last user is gone. An
/// unbalanced call is a no-op.
pub fn unload(core: &dyn VpuCore) {
    let mut counter = VPU_INIT_INSTANCE_COUNTER.lock().unwrap();

    log::trace!("VPU init instance counter: {}", *counter);

    if *counter == 0 {
        return;
    }

    *counter -= 1;
    if *counter == 0 {
        core.deinit();
        log::debug!("unloaded VPU");
    }
}
