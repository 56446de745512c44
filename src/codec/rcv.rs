// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! RCV container synthesis for WMV3.
//!
//! RCV is the thin framing layer from the VC-1 specification (Annex J and
//! L) that makes WMV3 data independent of ASF. The firmware requires it, so
//! the decoder fabricates the sequence layer header for the first frame and
//! a frame layer header for every frame after that.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

pub const SEQUENCE_LAYER_HEADER_SIZE: usize = 24;
pub const FRAME_LAYER_HEADER_SIZE: usize = 4;

/// Writes the 24-byte RCV sequence layer header (VC-1 spec, Annex L.2).
///
/// `extra_header` carries the 4 bytes of STRUCT_C codec data from the
/// container.
pub fn write_sequence_layer_header(
    header: &mut [u8; SEQUENCE_LAYER_HEADER_SIZE],
    width: u32,
    height: u32,
    main_data_size: u32,
    extra_header: &[u8; 4],
) {
    // 0xFFFFFF frames means an endless sequence; the actual count is
    // unknown here. 0xC5 is the constant Annex L prescribes.
    let struct_c_values: u32 = (0xC5 << 24) | 0xFFFFFF;
    let ext_header_length: u32 = 4;

    LittleEndian::write_u32(&mut header[0..4], struct_c_values);
    LittleEndian::write_u32(&mut header[4..8], ext_header_length);
    header[8..12].copy_from_slice(extra_header);
    LittleEndian::write_u32(&mut header[12..16], width);
    LittleEndian::write_u32(&mut header[16..20], height);
    LittleEndian::write_u32(&mut header[20..24], main_data_size);
}

/// Writes the 4-byte RCV frame layer header (VC-1 spec, Annex L.3).
pub fn write_frame_layer_header(header: &mut [u8; FRAME_LAYER_HEADER_SIZE], main_data_size: u32) {
    LittleEndian::write_u32(header, main_data_size);
}
