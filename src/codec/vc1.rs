// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VC-1 (WVC1, advanced profile) frame start codes.
//!
//! Advanced profile data is NAL-structured. Frames that do not already start
//! with a start code get the frame start code prepended so the firmware can
//! find the frame boundary.

/// The VC-1 frame start code (0x0000010D stored little-endian).
pub const FRAME_START_CODE: [u8; 4] = [0x00, 0x00, 0x01, 0x0D];

/// Whether `main_data` already starts with the VC-1 NAL start code prefix.
pub fn starts_with_nal_start_code(main_data: &[u8]) -> bool {
    main_data.len() >= 3 && main_data[0] == 0x00 && main_data[1] == 0x00 && main_data[2] == 0x01
}

/// Returns the frame layer header to prepend to `main_data`, if any.
pub fn frame_layer_header(main_data: &[u8]) -> Option<[u8; 4]> {
    if starts_with_nal_start_code(main_data) {
        None
    } else {
        Some(FRAME_START_CODE)
    }
}
