// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! JPEG header parsing.
//!
//! The firmware does not report JPEG size or sampling changes on its own, so
//! the decoder parses the SOF segment of every frame before submission and
//! compares the result against its shadow state.

use byteorder::BigEndian;
use byteorder::ByteOrder;
use thiserror::Error;

use crate::ChromaSampling;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JpegParseError {
    #[error("data does not start with a JPEG SOI marker")]
    NotJpeg,
    #[error("JPEG data ends in the middle of a segment")]
    Truncated,
    #[error("no SOF segment found before end of data")]
    MissingSofSegment,
    #[error("unsupported number of components: {0}")]
    UnsupportedComponentCount(u8),
    #[error("unsupported luma sampling factors {horizontal}x{vertical}")]
    UnsupportedSampling { horizontal: u8, vertical: u8 },
}

/// Frame properties extracted from a JPEG SOF segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JpegHeaderInfo {
    pub width: usize,
    pub height: usize,
    pub sampling: ChromaSampling,
}

/// Scans the JPEG markers in `data` until an SOF segment is found and
/// returns the frame properties from it.
pub fn parse_header(data: &[u8]) -> Result<JpegHeaderInfo, JpegParseError> {
    if data.len() < 2 || data[0] != 0xFF || data[1] != 0xD8 {
        return Err(JpegParseError::NotJpeg);
    }

    let mut pos = 2;
    loop {
        if pos + 2 > data.len() {
            return Err(JpegParseError::MissingSofSegment);
        }
        if data[pos] != 0xFF {
            // Not at a marker; entropy-coded data before EOI never reaches
            // this parser since we stop at the SOF.
            return Err(JpegParseError::MissingSofSegment);
        }
        // Skip fill bytes preceding the marker code.
        while pos < data.len() && data[pos] == 0xFF {
            pos += 1;
        }
        if pos >= data.len() {
            return Err(JpegParseError::Truncated);
        }

        let marker = data[pos];
        pos += 1;

        match marker {
            // Standalone markers without a length field.
            0x01 | 0xD0..=0xD8 => continue,
            // EOI: no SOF seen.
            0xD9 => return Err(JpegParseError::MissingSofSegment),
            // Baseline, extended sequential and progressive SOF.
            0xC0 | 0xC1 | 0xC2 => return parse_sof(&data[pos..]),
            _ => {
                if pos + 2 > data.len() {
                    return Err(JpegParseError::Truncated);
                }
                let length = BigEndian::read_u16(&data[pos..pos + 2]) as usize;
                if length < 2 || pos + length > data.len() {
                    return Err(JpegParseError::Truncated);
                }
                pos += length;
            }
        }
    }
}

fn parse_sof(segment: &[u8]) -> Result<JpegHeaderInfo, JpegParseError> {
    // Length (2) + precision (1) + height (2) + width (2) + component
    // count (1).
    if segment.len() < 8 {
        return Err(JpegParseError::Truncated);
    }

    let length = BigEndian::read_u16(&segment[0..2]) as usize;
    if length > segment.len() {
        return Err(JpegParseError::Truncated);
    }

    let height = BigEndian::read_u16(&segment[3..5]) as usize;
    let width = BigEndian::read_u16(&segment[5..7]) as usize;
    let num_components = segment[7];

    let sampling = match num_components {
        1 => ChromaSampling::S400,
        3 => {
            if segment.len() < 8 + 3 * 3 {
                return Err(JpegParseError::Truncated);
            }
            // The luma component's sampling factors decide the pattern;
            // chroma components always use 1x1.
            let factors = segment[9];
            let horizontal = factors >> 4;
            let vertical = factors & 0x0F;
            match (horizontal, vertical) {
                (2, 2) => ChromaSampling::S420,
                (2, 1) => ChromaSampling::S422H,
                (1, 2) => ChromaSampling::S422V,
                (1, 1) => ChromaSampling::S444,
                _ => return Err(JpegParseError::UnsupportedSampling { horizontal, vertical }),
            }
        }
        n => return Err(JpegParseError::UnsupportedComponentCount(n)),
    };

    Ok(JpegHeaderInfo { width, height, sampling })
}
