// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Tests of the one-call JPEG facade against the mock firmware.

mod common;

use std::sync::Arc;

use coda_codecs::backend::DecInitialInfo;
use coda_codecs::backend::DecOutputInfo;
use coda_codecs::dmabuf::DmaBufferAllocator;
use coda_codecs::jpeg::JpegDecoder;
use coda_codecs::jpeg::JpegEncParams;
use coda_codecs::jpeg::JpegEncoder;
use coda_codecs::ChromaSampling;
use coda_codecs::ColorFormat;

use common::DecScriptEntry;
use common::FakeDmaAllocator;
use common::MockVpuCore;

/// Minimal baseline JPEG header bytes (SOI, DQT stub, SOF0, stand-in scan).
fn synthesize_jpeg(width: u16, height: u16) -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8];
    data.extend_from_slice(&[0xFF, 0xDB, 0x00, 0x04, 0x00, 0x08]);
    data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
    data.extend_from_slice(&height.to_be_bytes());
    data.extend_from_slice(&width.to_be_bytes());
    data.push(3);
    data.extend_from_slice(&[0x01, 0x22, 0x00]);
    data.extend_from_slice(&[0x02, 0x11, 0x01]);
    data.extend_from_slice(&[0x03, 0x11, 0x01]);
    data.extend_from_slice(&[0x12, 0x34, 0xFF, 0xD9]);
    data
}

#[test]
fn facade_decodes_one_jpeg() {
    common::init_logging();

    let allocator = FakeDmaAllocator::new();
    let core = MockVpuCore::new(&allocator);

    core.dec_state.lock().unwrap().initial_info = Some(DecInitialInfo {
        pic_width: 640,
        pic_height: 480,
        frame_rate_numerator: 0,
        frame_rate_denominator: 1,
        min_frame_buffer_count: 1,
        interlace: false,
        jpeg_sampling: ChromaSampling::S420,
        crop: Default::default(),
    });
    core.dec_state
        .lock()
        .unwrap()
        .script
        .push_back(DecScriptEntry::ok(DecOutputInfo::default()));

    let mut decoder = JpegDecoder::open(
        Arc::clone(&core) as Arc<dyn coda_codecs::backend::VpuCore>,
        Arc::clone(&allocator) as Arc<dyn coda_codecs::dmabuf::DmaBufferAllocator>,
        true,
        0,
    )
    .unwrap();

    let info = decoder.decode(&synthesize_jpeg(640, 480)).unwrap().expect("no frame produced");
    assert_eq!(info.metrics.actual_width, 640);
    assert_eq!(info.metrics.actual_height, 480);
    assert_eq!(info.color_format, ColorFormat::Yuv420SemiPlanar);
    // The frame buffer is sized for the decoded layout.
    assert!(info.framebuffer.size() >= info.metrics.y_size + info.metrics.uv_size);

    decoder.close();
}

#[test]
fn facade_encoder_reopens_on_parameter_change() {
    common::init_logging();

    let allocator = FakeDmaAllocator::new();
    let core = MockVpuCore::new(&allocator);
    core.enc_state.lock().unwrap().jpeg_header = vec![0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x02];

    let mut encoder = JpegEncoder::open(
        Arc::clone(&core) as Arc<dyn coda_codecs::backend::VpuCore>,
        Arc::clone(&allocator) as Arc<dyn coda_codecs::dmabuf::DmaBufferAllocator>,
    )
    .unwrap();

    let frame = allocator
        .allocate(64 * 64 * 2, 4096, coda_codecs::dmabuf::CachingMode::Cached)
        .unwrap();

    let params = JpegEncParams {
        frame_width: 64,
        frame_height: 64,
        quality_factor: 50,
        color_format: ColorFormat::Yuv420SemiPlanar,
    };

    for _ in 0..2 {
        core.enc_state.lock().unwrap().script.push_back(common::EncScriptEntry {
            start_result: Ok(()),
            payload: vec![0xAB, 0xFF, 0xD9],
            pic_type: 0,
        });
    }

    let data = encoder.encode(&frame, &params).unwrap();
    assert_eq!(&data[0..2], &[0xFF, 0xD8]);
    assert_eq!(&data[data.len() - 2..], &[0xFF, 0xD9]);

    // Same parameters: the internal encoder is reused.
    encoder.encode(&frame, &params).unwrap();
    assert_eq!(core.enc_state.lock().unwrap().register_calls, 1);

    // A quality change closes and reopens the internal encoder.
    core.enc_state.lock().unwrap().script.push_back(common::EncScriptEntry {
        start_result: Ok(()),
        payload: vec![0xCD, 0xFF, 0xD9],
        pic_type: 0,
    });
    let changed = JpegEncParams { quality_factor: 80, ..params };
    encoder.encode(&frame, &changed).unwrap();
    assert_eq!(core.enc_state.lock().unwrap().register_calls, 2);

    encoder.close();
}
