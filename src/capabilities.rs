// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Static capability information: what the hardware can decode and encode,
//! within which bounds, and sensible default open parameters.

use crate::decoder::VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE;
use crate::encoder::EncFormatParams;
use crate::encoder::EncOpenParams;
use crate::encoder::H263EncParams;
use crate::encoder::H264EncParams;
use crate::encoder::Mpeg4EncParams;
use crate::ColorFormat;
use crate::CompressionFormat;

/// Alignment the stream buffer's physical address must have.
pub const STREAM_BUFFER_PHYSADDR_ALIGNMENT: usize = 512;
/// Alignment the stream buffer's size must have.
pub const STREAM_BUFFER_SIZE_ALIGNMENT: usize = 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HardwareType {
    Coda960,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum H264Profile {
    ConstrainedBaseline,
    Baseline,
    Main,
    High,
    High10,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum H264Level {
    L1,
    L1b,
    L1_1,
    L1_2,
    L1_3,
    L2,
    L2_1,
    L2_2,
    L3,
    L3_1,
    L3_2,
    L4,
    L4_1,
    L4_2,
    L5,
    L5_1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Vp8Profile {
    P0,
    P1,
    P2,
    P3,
}

/// Global properties of one codec direction (decode or encode).
#[derive(Clone, Debug)]
pub struct GlobalInfo {
    pub hardware_type: HardwareType,
    pub min_required_stream_buffer_size: usize,
    pub required_stream_buffer_physaddr_alignment: usize,
    pub required_stream_buffer_size_alignment: usize,
    pub supported_compression_formats: &'static [CompressionFormat],
    pub semi_planar_frames_supported: bool,
    pub fully_planar_frames_supported: bool,
}

/// Size and quantization bounds for one compression format.
#[derive(Clone, Debug)]
pub struct CompressionFormatSupportDetails {
    pub min_width: usize,
    pub max_width: usize,
    pub min_height: usize,
    pub max_height: usize,
    pub supported_color_formats: &'static [ColorFormat],
    pub min_quantization: u32,
    pub max_quantization: u32,
    /// Maximum supported level per H.264 profile; `None` for unsupported
    /// profiles. Only filled for H.264.
    pub h264_max_levels: Option<H264ProfileLevels>,
    /// Supported VP8 profiles. Only filled for VP8.
    pub vp8_supported_profiles: Option<&'static [Vp8Profile]>,
    /// Whether streams must be framed as complete access units.
    pub h264_access_units_required: bool,
}

#[derive(Copy, Clone, Debug)]
pub struct H264ProfileLevels {
    pub constrained_baseline: Option<H264Level>,
    pub baseline: Option<H264Level>,
    pub main: Option<H264Level>,
    pub high: Option<H264Level>,
    pub high10: Option<H264Level>,
}

const DEC_SUPPORTED_COMPRESSION_FORMATS: [CompressionFormat; 8] = [
    CompressionFormat::Mpeg2,
    CompressionFormat::Mpeg4,
    CompressionFormat::H263,
    CompressionFormat::H264,
    CompressionFormat::Wmv3,
    CompressionFormat::Wvc1,
    CompressionFormat::Jpeg,
    CompressionFormat::Vp8,
];

const ENC_SUPPORTED_COMPRESSION_FORMATS: [CompressionFormat; 4] = [
    CompressionFormat::Mpeg4,
    CompressionFormat::H263,
    CompressionFormat::H264,
    CompressionFormat::Jpeg,
];

/// Global information of the decoder side.
pub fn dec_global_info() -> GlobalInfo {
    GlobalInfo {
        hardware_type: HardwareType::Coda960,
        min_required_stream_buffer_size: VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE,
        required_stream_buffer_physaddr_alignment: STREAM_BUFFER_PHYSADDR_ALIGNMENT,
        required_stream_buffer_size_alignment: STREAM_BUFFER_SIZE_ALIGNMENT,
        supported_compression_formats: &DEC_SUPPORTED_COMPRESSION_FORMATS,
        semi_planar_frames_supported: true,
        fully_planar_frames_supported: true,
    }
}

/// Global information of the encoder side.
pub fn enc_global_info() -> GlobalInfo {
    GlobalInfo {
        hardware_type: HardwareType::Coda960,
        min_required_stream_buffer_size: crate::encoder::VPU_ENC_MIN_REQUIRED_STREAM_BUFFER_SIZE,
        required_stream_buffer_physaddr_alignment: STREAM_BUFFER_PHYSADDR_ALIGNMENT,
        required_stream_buffer_size_alignment: STREAM_BUFFER_SIZE_ALIGNMENT,
        supported_compression_formats: &ENC_SUPPORTED_COMPRESSION_FORMATS,
        semi_planar_frames_supported: true,
        fully_planar_frames_supported: true,
    }
}

// Only semi-planar output is supported for the non-JPEG decode path,
// because the detiling engine cannot handle anything but NV12.
const DEC_SUPPORTED_BASIC_COLOR_FORMATS: [ColorFormat; 1] = [ColorFormat::Yuv420SemiPlanar];

const DEC_SUPPORTED_JPEG_COLOR_FORMATS: [ColorFormat; 9] = [
    ColorFormat::Yuv420Planar,
    ColorFormat::Yuv422HPlanar,
    ColorFormat::Yuv422VPlanar,
    ColorFormat::Yuv444Planar,
    ColorFormat::Yuv420SemiPlanar,
    ColorFormat::Yuv422HSemiPlanar,
    ColorFormat::Yuv422VSemiPlanar,
    ColorFormat::Yuv444SemiPlanar,
    ColorFormat::Yuv400,
];

const ENC_SUPPORTED_BASIC_COLOR_FORMATS: [ColorFormat; 2] =
    [ColorFormat::Yuv420SemiPlanar, ColorFormat::Yuv420Planar];

const ENC_SUPPORTED_JPEG_COLOR_FORMATS: [ColorFormat; 9] = [
    ColorFormat::Yuv420SemiPlanar,
    ColorFormat::Yuv422HSemiPlanar,
    ColorFormat::Yuv422VSemiPlanar,
    ColorFormat::Yuv444SemiPlanar,
    ColorFormat::Yuv420Planar,
    ColorFormat::Yuv422HPlanar,
    ColorFormat::Yuv422VPlanar,
    ColorFormat::Yuv444Planar,
    ColorFormat::Yuv400,
];

const VP8_ALL_PROFILES: [Vp8Profile; 4] =
    [Vp8Profile::P0, Vp8Profile::P1, Vp8Profile::P2, Vp8Profile::P3];

/// Per-format bounds of the decoder.
pub fn dec_compression_format_support_details(
    compression_format: CompressionFormat,
) -> CompressionFormatSupportDetails {
    match compression_format {
        CompressionFormat::Jpeg => CompressionFormatSupportDetails {
            min_width: 8,
            max_width: 8192,
            min_height: 8,
            max_height: 8192,
            supported_color_formats: &DEC_SUPPORTED_JPEG_COLOR_FORMATS,
            min_quantization: 0,
            max_quantization: 0,
            h264_max_levels: None,
            vp8_supported_profiles: None,
            h264_access_units_required: false,
        },

        CompressionFormat::H264 => CompressionFormatSupportDetails {
            min_width: 8,
            max_width: 1920,
            min_height: 8,
            max_height: 1088,
            supported_color_formats: &DEC_SUPPORTED_BASIC_COLOR_FORMATS,
            min_quantization: 0,
            max_quantization: 0,
            h264_max_levels: Some(H264ProfileLevels {
                constrained_baseline: Some(H264Level::L4_1),
                baseline: Some(H264Level::L4_1),
                main: Some(H264Level::L4_1),
                high: Some(H264Level::L4_1),
                high10: None,
            }),
            vp8_supported_profiles: None,
            h264_access_units_required: true,
        },

        CompressionFormat::Vp8 => CompressionFormatSupportDetails {
            min_width: 8,
            max_width: 1920,
            min_height: 8,
            max_height: 1088,
            supported_color_formats: &DEC_SUPPORTED_BASIC_COLOR_FORMATS,
            min_quantization: 0,
            max_quantization: 0,
            h264_max_levels: None,
            vp8_supported_profiles: Some(&VP8_ALL_PROFILES),
            h264_access_units_required: false,
        },

        _ => CompressionFormatSupportDetails {
            min_width: 8,
            max_width: 1920,
            min_height: 8,
            max_height: 1088,
            supported_color_formats: &DEC_SUPPORTED_BASIC_COLOR_FORMATS,
            min_quantization: 0,
            max_quantization: 0,
            h264_max_levels: None,
            vp8_supported_profiles: None,
            h264_access_units_required: false,
        },
    }
}

/// Per-format bounds of the encoder.
pub fn enc_compression_format_support_details(
    compression_format: CompressionFormat,
) -> CompressionFormatSupportDetails {
    match compression_format {
        CompressionFormat::H264 => CompressionFormatSupportDetails {
            min_width: 8,
            max_width: 1920,
            min_height: 8,
            max_height: 1088,
            supported_color_formats: &ENC_SUPPORTED_BASIC_COLOR_FORMATS,
            min_quantization: 0,
            max_quantization: 51,
            h264_max_levels: Some(H264ProfileLevels {
                constrained_baseline: Some(H264Level::L4),
                baseline: Some(H264Level::L4),
                main: None,
                high: None,
                high10: None,
            }),
            vp8_supported_profiles: None,
            h264_access_units_required: false,
        },

        CompressionFormat::Jpeg => CompressionFormatSupportDetails {
            min_width: 48,
            max_width: 1920,
            min_height: 32,
            max_height: 1088,
            supported_color_formats: &ENC_SUPPORTED_JPEG_COLOR_FORMATS,
            min_quantization: 0,
            max_quantization: 99,
            h264_max_levels: None,
            vp8_supported_profiles: None,
            h264_access_units_required: false,
        },

        _ => CompressionFormatSupportDetails {
            min_width: 48,
            max_width: 1920,
            min_height: 32,
            max_height: 1088,
            supported_color_formats: &ENC_SUPPORTED_BASIC_COLOR_FORMATS,
            min_quantization: 1,
            max_quantization: 31,
            h264_max_levels: None,
            vp8_supported_profiles: None,
            h264_access_units_required: false,
        },
    }
}

/// Fills encoder open params with defaults for the given format and frame
/// size: 256 kbps, GOP of 16, 25 fps, and the per-format parameters the
/// firmware documentation recommends.
pub fn set_default_open_params(
    compression_format: CompressionFormat,
    color_format: ColorFormat,
    frame_width: usize,
    frame_height: usize,
) -> EncOpenParams {
    EncOpenParams {
        compression_format,
        color_format,
        frame_width,
        frame_height,
        bitrate_kbps: 256,
        quantization: 0,
        gop_size: 16,
        min_intra_refresh_mb_count: 0,
        closed_gop_interval: 0,
        frame_rate_numerator: 25,
        frame_rate_denominator: 1,
        format_params: match compression_format {
            CompressionFormat::Mpeg4 => EncFormatParams::Mpeg4(Mpeg4EncParams {
                enable_data_partitioning: false,
                enable_reversible_vlc: false,
                intra_dc_vlc_thr: 0,
                enable_hec: false,
                version_id: 2,
            }),

            CompressionFormat::H263 => EncFormatParams::H263(H263EncParams {
                enable_annex_i: false,
                enable_annex_j: true,
                enable_annex_k: false,
                enable_annex_t: false,
            }),

            CompressionFormat::H264 => EncFormatParams::H264(H264EncParams {
                profile: H264Profile::ConstrainedBaseline,
                level: None,
                enable_access_unit_delimiters: true,
            }),

            _ => EncFormatParams::Jpeg,
        },
    }
}
