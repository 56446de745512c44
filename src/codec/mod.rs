// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-format bitstream knowledge.
//!
//! The CODA firmware wants some formats framed in minimal containers it can
//! parse: VP8 inside IVF, WMV3 inside RCV, VC-1 behind NAL start codes. JPEG
//! needs its SOF header parsed host-side because the firmware does not
//! report JPEG format changes on its own. These modules are the only
//! format-specific code on the decode path.

pub mod ivf;
pub mod jpeg;
pub mod rcv;
pub mod vc1;
