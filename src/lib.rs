// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate drives a CODA960-class Video Processing Unit to decode and
//! encode compressed video (H.264, MPEG-2/4, H.263, VC-1/WMV3, VP8 and JPEG).
//!
//! The [backend] module defines the interface to the VPU firmware shim. The
//! crate itself never talks to hardware directly; everything goes through
//! those traits, which also makes the state machines testable against a mock
//! firmware.
//!
//! The [decoder] and [encoder] modules contain the two state machines that
//! make up the bulk of the crate. The caller allocates a DMA stream buffer,
//! opens an instance with a format descriptor, pushes one frame per cycle,
//! drives the state machine one step, and pulls the result when the state
//! machine reports one available.
//!
//! The [codec] module contains the small amount of per-format bitstream
//! knowledge the decode path needs: container header synthesis for
//! WMV3/VC-1/VP8 and JPEG SOF parsing.
//!
//! The [jpeg] module is a single-call facade over the decoder and encoder
//! for applications that only deal in JPEG images.

pub mod backend;
pub mod capabilities;
pub mod codec;
pub mod decoder;
pub mod detile;
pub mod dmabuf;
pub mod encoder;
pub mod geometry;
pub mod jpeg;
pub mod utils;

use std::str::FromStr;
use std::sync::Arc;

use crate::dmabuf::DmaBuffer;

/// Rounds `value` up to the next multiple of `alignment`.
///
/// An `alignment` of 0 or 1 leaves the value unchanged.
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        (value + alignment - 1) / alignment * alignment
    }
}

/// A frame resolution in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// Compression formats the VPU understands.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CompressionFormat {
    Mpeg2,
    Mpeg4,
    H263,
    H264,
    Wmv3,
    Wvc1,
    Vp8,
    Jpeg,
}

impl FromStr for CompressionFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpeg2" | "MPEG2" => Ok(CompressionFormat::Mpeg2),
            "mpeg4" | "MPEG4" => Ok(CompressionFormat::Mpeg4),
            "h263" | "H263" => Ok(CompressionFormat::H263),
            "h264" | "H264" => Ok(CompressionFormat::H264),
            "wmv3" | "WMV3" => Ok(CompressionFormat::Wmv3),
            "wvc1" | "WVC1" | "vc1" => Ok(CompressionFormat::Wvc1),
            "vp8" | "VP8" => Ok(CompressionFormat::Vp8),
            "jpeg" | "JPEG" | "mjpeg" => Ok(CompressionFormat::Jpeg),
            _ => Err("unrecognized compression format. Valid values: \
                mpeg2, mpeg4, h263, h264, wmv3, wvc1, vp8, jpeg"),
        }
    }
}

/// Chroma sampling patterns of the 8-bit YUV frames the VPU produces and
/// consumes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ChromaSampling {
    #[default]
    S420,
    /// 4:2:2 with horizontally subsampled chroma.
    S422H,
    /// 4:2:2 with vertically subsampled chroma.
    S422V,
    S444,
    /// Grayscale, no chroma planes.
    S400,
}

/// Layout of a decoded or raw frame in memory.
///
/// "Planar" formats keep Y, U and V in three separate planes; "semi-planar"
/// formats keep one Y plane and one interleaved CbCr plane.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    Yuv420Planar,
    Yuv420SemiPlanar,
    Yuv422HPlanar,
    Yuv422HSemiPlanar,
    Yuv422VPlanar,
    Yuv422VSemiPlanar,
    Yuv444Planar,
    Yuv444SemiPlanar,
    Yuv400,
}

impl ColorFormat {
    pub fn is_semi_planar(&self) -> bool {
        matches!(
            self,
            ColorFormat::Yuv420SemiPlanar
                | ColorFormat::Yuv422HSemiPlanar
                | ColorFormat::Yuv422VSemiPlanar
                | ColorFormat::Yuv444SemiPlanar
        )
    }

    pub fn sampling(&self) -> ChromaSampling {
        match self {
            ColorFormat::Yuv420Planar | ColorFormat::Yuv420SemiPlanar => ChromaSampling::S420,
            ColorFormat::Yuv422HPlanar | ColorFormat::Yuv422HSemiPlanar => ChromaSampling::S422H,
            ColorFormat::Yuv422VPlanar | ColorFormat::Yuv422VSemiPlanar => ChromaSampling::S422V,
            ColorFormat::Yuv444Planar | ColorFormat::Yuv444SemiPlanar => ChromaSampling::S444,
            ColorFormat::Yuv400 => ChromaSampling::S400,
        }
    }

    /// The frame layout for a given sampling pattern and plane arrangement.
    /// Grayscale frames have a single arrangement.
    pub fn from_sampling(sampling: ChromaSampling, semi_planar: bool) -> ColorFormat {
        match (sampling, semi_planar) {
            (ChromaSampling::S420, false) => ColorFormat::Yuv420Planar,
            (ChromaSampling::S420, true) => ColorFormat::Yuv420SemiPlanar,
            (ChromaSampling::S422H, false) => ColorFormat::Yuv422HPlanar,
            (ChromaSampling::S422H, true) => ColorFormat::Yuv422HSemiPlanar,
            (ChromaSampling::S422V, false) => ColorFormat::Yuv422VPlanar,
            (ChromaSampling::S422V, true) => ColorFormat::Yuv422VSemiPlanar,
            (ChromaSampling::S444, false) => ColorFormat::Yuv444Planar,
            (ChromaSampling::S444, true) => ColorFormat::Yuv444SemiPlanar,
            (ChromaSampling::S400, _) => ColorFormat::Yuv400,
        }
    }
}

/// Frame types, as reported by the firmware after decoding or encoding.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameType {
    #[default]
    Unknown,
    I,
    P,
    B,
    /// VC-1 BI frame (intra-coded B frame).
    BI,
    Skip,
    Idr,
}

impl FrameType {
    /// Whether a frame of this type requests intra coding from the encoder.
    pub fn is_intra_request(&self) -> bool {
        matches!(self, FrameType::I | FrameType::Idr)
    }
}

/// How the fields of an interlaced frame are arranged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum InterlacingMode {
    #[default]
    NoInterlacing,
    TopFieldFirst,
    BottomFieldFirst,
    TopFieldOnly,
    BottomFieldOnly,
}

/// One frame of encoded data, as fed into the decoder.
///
/// `context`, `pts` and `dts` are opaque tokens; the codec passes them
/// through unchanged and hands them back with the frame they belong to.
#[derive(Clone, Copy)]
pub struct EncodedFrame<'a> {
    pub data: &'a [u8],
    pub pts: u64,
    pub dts: u64,
    pub context: u64,
}

/// One raw (unencoded) frame, backed by a DMA buffer.
///
/// Used both as encoder input and as decoder output. `frame_types` carries
/// one type per field for interlaced content; progressive frames repeat the
/// same type twice.
#[derive(Clone)]
pub struct RawFrame {
    pub dma_buffer: Arc<dyn DmaBuffer>,
    pub frame_types: [FrameType; 2],
    pub interlacing_mode: InterlacingMode,
    pub pts: u64,
    pub dts: u64,
    pub context: u64,
    /// Context of the framebuffer itself, as opposed to the frame. For
    /// decoded frames this is the token registered alongside the output
    /// buffer.
    pub fb_context: u64,
}

impl std::fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFrame")
            .field("frame_types", &self.frame_types)
            .field("interlacing_mode", &self.interlacing_mode)
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("context", &self.context)
            .field("fb_context", &self.fb_context)
            .finish()
    }
}
