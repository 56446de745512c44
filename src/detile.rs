// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the external detiling engine.
//!
//! The VPU writes decoded frames in its native tiled layout. Instead of
//! having the VPU detile in place, the decoder hands finished pool frames to
//! an external engine (the IPU VDOA on i.MX6 hardware) that detiles into a
//! caller-owned linear buffer. This module only defines the one operation
//! the decoder needs; any engine with equivalent semantics can implement it.

use std::sync::Arc;

use crate::dmabuf::DmaBuffer;
use crate::ColorFormat;

/// Geometry of one detile-and-copy operation.
#[derive(Copy, Clone, Debug)]
pub struct DetileJob {
    /// Padded size of the tiled source frame, in pixels.
    pub total_padded_input_width: usize,
    pub total_padded_input_height: usize,
    /// Padded size of the linear destination frame, in pixels.
    pub total_padded_output_width: usize,
    pub total_padded_output_height: usize,
    /// Actual (crop) frame size.
    pub actual_frame_width: usize,
    pub actual_frame_height: usize,
    /// Layout of the destination frame.
    pub output_color_format: ColorFormat,
}

/// Engine that can move a tiled decoder frame into a linear buffer.
pub trait DetileEngine {
    /// Detiles `source` into `dest` according to `job`.
    fn detile_and_copy(
        &mut self,
        source: &Arc<dyn DmaBuffer>,
        dest: &Arc<dyn DmaBuffer>,
        job: &DetileJob,
    ) -> anyhow::Result<()>;
}

/// Software stand-in that copies bytes without detiling.
///
/// Useful for tests and for firmware configured for linear output, where the
/// "tiled" source is already linear.
pub struct CopyDetiler;

impl DetileEngine for CopyDetiler {
    fn detile_and_copy(
        &mut self,
        source: &Arc<dyn DmaBuffer>,
        dest: &Arc<dyn DmaBuffer>,
        _job: &DetileJob,
    ) -> anyhow::Result<()> {
        let source_mapping = crate::dmabuf::map_dma_buffer(
            source,
            crate::dmabuf::MapFlags { read: true, write: false, manual_sync: false },
        )?;
        let mut dest_mapping = crate::dmabuf::map_dma_buffer(
            dest,
            crate::dmabuf::MapFlags { read: false, write: true, manual_sync: false },
        )?;

        let len = source_mapping.len().min(dest_mapping.len());
        dest_mapping.as_mut_slice()[..len].copy_from_slice(&source_mapping.as_slice()[..len]);

        Ok(())
    }
}
