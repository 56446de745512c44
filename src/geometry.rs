// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Framebuffer geometry.
//!
//! Pure functions computing plane strides, sizes and offsets for the frame
//! layouts the VPU works with. Nothing in here talks to hardware; the
//! decoder and encoder feed these numbers into framebuffer descriptors and
//! the capability surface reports them to callers sizing their allocations.

use crate::align_up;
use crate::ChromaSampling;
use crate::ColorFormat;

/// Complete layout description of one framebuffer.
///
/// Invariants: `u_offset == y_size` (aligned); for fully-planar layouts
/// `v_offset == u_offset + uv_size`, for semi-planar layouts
/// `v_offset == u_offset` and `uv_stride` covers the interleaved CbCr plane.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FramebufferMetrics {
    /// Frame size as requested by the user, in pixels.
    pub actual_width: usize,
    pub actual_height: usize,
    /// Frame size padded to the hardware alignment rules.
    pub aligned_width: usize,
    pub aligned_height: usize,
    pub y_stride: usize,
    pub uv_stride: usize,
    pub y_size: usize,
    pub uv_size: usize,
    pub y_offset: usize,
    pub u_offset: usize,
    pub v_offset: usize,
    /// Offset of the co-located motion vector region the decoder keeps after
    /// the chroma planes. Unused by output frames.
    pub mvcol_offset: usize,
    pub mvcol_size: usize,
    /// Minimum size of a DMA buffer holding this layout, including MvCol
    /// space and alignment slack.
    pub total_size: usize,
}

fn compute_with_frame_alignment(
    format: ColorFormat,
    width: usize,
    height: usize,
    width_alignment: usize,
    height_alignment: usize,
    framebuffer_alignment: usize,
) -> FramebufferMetrics {
    let mut metrics = FramebufferMetrics {
        actual_width: width,
        actual_height: height,
        aligned_width: align_up(width, width_alignment),
        aligned_height: align_up(height, height_alignment),
        ..Default::default()
    };

    metrics.y_stride = metrics.aligned_width;
    metrics.y_size = metrics.y_stride * metrics.aligned_height;

    let (uv_stride, uv_size) = match format.sampling() {
        ChromaSampling::S420 => (metrics.y_stride / 2, metrics.y_size / 4),
        ChromaSampling::S422H | ChromaSampling::S422V => (metrics.y_stride / 2, metrics.y_size / 2),
        ChromaSampling::S444 => (metrics.y_stride, metrics.y_size),
        ChromaSampling::S400 => (0, 0),
    };
    metrics.uv_stride = uv_stride;
    metrics.uv_size = uv_size;
    // The decoder's motion vector scratch is sized like one non-interleaved
    // chroma plane.
    metrics.mvcol_size = uv_size;

    // A combined CbCr plane replaces the two separate chroma planes.
    if format.is_semi_planar() {
        metrics.uv_stride *= 2;
        metrics.uv_size *= 2;
    }

    let alignment = framebuffer_alignment;
    if alignment > 1 {
        metrics.y_size = align_up(metrics.y_size, alignment);
        metrics.uv_size = align_up(metrics.uv_size, alignment);
        metrics.mvcol_size = align_up(metrics.mvcol_size, alignment);
    }

    metrics.y_offset = 0;
    metrics.u_offset = metrics.y_size;
    metrics.v_offset = if format.is_semi_planar() {
        metrics.u_offset
    } else {
        metrics.u_offset + metrics.uv_size
    };
    metrics.mvcol_offset = if format.is_semi_planar() {
        metrics.u_offset + metrics.uv_size
    } else {
        metrics.v_offset + metrics.uv_size
    };

    metrics.total_size =
        metrics.mvcol_offset + metrics.mvcol_size + if alignment > 1 { alignment } else { 0 };

    metrics
}

/// Computes the layout of a decoded frame.
///
/// The decoder needs the width padded to 16 pixels and the height to 16, or
/// 32 when the stream is interlaced (fields are stored stacked).
pub fn compute_framebuffer_metrics(
    format: ColorFormat,
    width: usize,
    height: usize,
    framebuffer_alignment: usize,
    uses_interlacing: bool,
) -> FramebufferMetrics {
    compute_with_frame_alignment(
        format,
        width,
        height,
        16,
        if uses_interlacing { 32 } else { 16 },
        framebuffer_alignment,
    )
}

/// Computes the layout of a raw frame submitted to the encoder.
///
/// The encoder accepts any width that is a multiple of 8 and any even
/// height; feeding it less aligned data produces corrupted frames.
pub fn compute_frame_encoding_metrics(
    format: ColorFormat,
    width: usize,
    height: usize,
) -> FramebufferMetrics {
    compute_with_frame_alignment(format, width, height, 8, 2, 0)
}

/// Computes the layout of the encoder's internal reference framebuffers,
/// which need both dimensions padded to 16.
pub fn compute_internal_encoding_metrics(
    format: ColorFormat,
    width: usize,
    height: usize,
) -> FramebufferMetrics {
    compute_with_frame_alignment(format, width, height, 16, 16, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420_planar_layout() {
        let m = compute_framebuffer_metrics(ColorFormat::Yuv420Planar, 640, 480, 0, false);
        assert_eq!(m.aligned_width, 640);
        assert_eq!(m.aligned_height, 480);
        assert_eq!(m.y_stride, 640);
        assert_eq!(m.y_size, 640 * 480);
        assert_eq!(m.uv_stride, 320);
        assert_eq!(m.uv_size, 640 * 480 / 4);
        assert_eq!(m.u_offset, m.y_size);
        assert_eq!(m.v_offset, m.u_offset + m.uv_size);
        assert_eq!(m.mvcol_offset, m.v_offset + m.uv_size);
        assert_eq!(m.total_size, m.y_size + 2 * m.uv_size + m.mvcol_size);
    }

    #[test]
    fn yuv420_semi_planar_layout() {
        let m = compute_framebuffer_metrics(ColorFormat::Yuv420SemiPlanar, 640, 480, 0, false);
        // One interleaved CbCr plane twice the base stride and size.
        assert_eq!(m.uv_stride, 640);
        assert_eq!(m.uv_size, 640 * 480 / 2);
        assert_eq!(m.v_offset, m.u_offset);
        assert_eq!(m.mvcol_offset, m.u_offset + m.uv_size);
        // MvCol space stays sized like one non-interleaved chroma plane.
        assert_eq!(m.mvcol_size, 640 * 480 / 4);
    }

    #[test]
    fn odd_sizes_pad_to_macroblocks() {
        let m = compute_framebuffer_metrics(ColorFormat::Yuv420SemiPlanar, 1920, 1080, 0, false);
        assert_eq!(m.aligned_width, 1920);
        assert_eq!(m.aligned_height, 1088);

        let m = compute_framebuffer_metrics(ColorFormat::Yuv420SemiPlanar, 854, 480, 0, false);
        assert_eq!(m.aligned_width, 864);
    }

    #[test]
    fn interlacing_pads_height_to_32() {
        let m = compute_framebuffer_metrics(ColorFormat::Yuv420SemiPlanar, 720, 576, 0, true);
        assert_eq!(m.aligned_height, 576);
        let m = compute_framebuffer_metrics(ColorFormat::Yuv420SemiPlanar, 720, 560, 0, true);
        assert_eq!(m.aligned_height, 576);
    }

    #[test]
    fn yuv400_has_no_chroma() {
        let m = compute_framebuffer_metrics(ColorFormat::Yuv400, 640, 480, 0, false);
        assert_eq!(m.uv_stride, 0);
        assert_eq!(m.uv_size, 0);
        assert_eq!(m.mvcol_size, 0);
        assert_eq!(m.total_size, m.y_size);
    }

    #[test]
    fn framebuffer_alignment_pads_planes() {
        let m = compute_framebuffer_metrics(ColorFormat::Yuv420Planar, 100, 100, 4096, false);
        assert_eq!(m.y_size % 4096, 0);
        assert_eq!(m.uv_size % 4096, 0);
        assert_eq!(m.mvcol_size % 4096, 0);
        assert_eq!(m.total_size, m.y_size + 2 * m.uv_size + m.mvcol_size + 4096);
    }

    #[test]
    fn geometry_is_idempotent() {
        // Recomputing from the aligned sizes changes nothing.
        for (w, h) in [(1920, 1080), (640, 480), (123, 45)] {
            let first = compute_framebuffer_metrics(ColorFormat::Yuv420SemiPlanar, w, h, 0, false);
            let second = compute_framebuffer_metrics(
                ColorFormat::Yuv420SemiPlanar,
                first.aligned_width,
                first.aligned_height,
                0,
                false,
            );
            assert_eq!(first.aligned_width, second.aligned_width);
            assert_eq!(first.aligned_height, second.aligned_height);
            assert_eq!(first.y_size, second.y_size);
            assert_eq!(first.uv_size, second.uv_size);
            assert_eq!(first.total_size, second.total_size);
        }
    }

    #[test]
    fn encoder_input_alignment_is_relaxed() {
        let m = compute_frame_encoding_metrics(ColorFormat::Yuv420SemiPlanar, 1000, 562);
        assert_eq!(m.aligned_width, 1000);
        assert_eq!(m.aligned_height, 562);

        let internal = compute_internal_encoding_metrics(ColorFormat::Yuv420SemiPlanar, 1000, 562);
        assert_eq!(internal.aligned_width, 1008);
        assert_eq!(internal.aligned_height, 576);
    }
}
