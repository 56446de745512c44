// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end decoder tests against the mock firmware.

mod common;

use std::sync::Arc;

use coda_codecs::backend::DecInitialInfo;
use coda_codecs::backend::DecOutputInfo;
use coda_codecs::backend::DECODE_IDX_FRAME_NOT_DECODED;
use coda_codecs::backend::DECODING_SUCCESS_INCOMPLETE_BIT;
use coda_codecs::backend::DECODING_SUCCESS_PARAMS_CHANGED_BIT;
use coda_codecs::backend::DISPLAY_IDX_ALL_FRAMES_DISPLAYED;
use coda_codecs::backend::DISPLAY_IDX_NO_FRAME;
use coda_codecs::decoder::DecError;
use coda_codecs::decoder::DecOpenParams;
use coda_codecs::decoder::DecOutput;
use coda_codecs::decoder::Decoder;
use coda_codecs::decoder::SkippedFrameReason;
use coda_codecs::decoder::VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE;
use coda_codecs::detile::CopyDetiler;
use coda_codecs::dmabuf::CachingMode;
use coda_codecs::dmabuf::DmaBuffer;
use coda_codecs::dmabuf::DmaBufferAllocator;
use coda_codecs::ChromaSampling;
use coda_codecs::ColorFormat;
use coda_codecs::CompressionFormat;
use coda_codecs::EncodedFrame;
use coda_codecs::FrameType;

use common::DecScriptEntry;
use common::FakeDmaAllocator;
use common::MockVpuCore;

/// Builds the header part of a baseline JPEG: SOI, a DQT stub, and an SOF0
/// segment carrying the given dimensions with 4:2:0 sampling.
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
    // Entropy data stand-in plus EOI.
    data.extend_from_slice(&[0x12, 0x34, 0x56, 0xFF, 0xD9]);
    data
}

struct DecoderHarness {
    allocator: Arc<FakeDmaAllocator>,
    core: Arc<MockVpuCore>,
    decoder: Decoder,
    stream_buffer: Arc<dyn DmaBuffer>,
    pool: Vec<Arc<dyn DmaBuffer>>,
    output_buffer: Option<Arc<dyn DmaBuffer>>,
}

impl DecoderHarness {
    fn open(format: CompressionFormat, open_tweak: impl FnOnce(&mut DecOpenParams)) -> Self {
        common::init_logging();

        let allocator = FakeDmaAllocator::new();
        let core = MockVpuCore::new(&allocator);

        let stream_buffer = allocator
            .allocate(VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE, 512, CachingMode::Cached)
            .unwrap();

        let mut open_params = DecOpenParams {
            compression_format: format,
            frame_width: 1280,
            frame_height: 720,
            extra_header_data: Vec::new(),
            enable_frame_reordering: false,
            use_semi_planar_color_format: true,
        };
        open_tweak(&mut open_params);

        let decoder = Decoder::open(
            Arc::clone(&core) as Arc<dyn coda_codecs::backend::VpuCore>,
            open_params,
            Arc::clone(&stream_buffer),
            Box::new(CopyDetiler),
        )
        .unwrap();

        Self { allocator, core, decoder, stream_buffer, pool: Vec::new(), output_buffer: None }
    }

    fn set_initial_info(&self, info: DecInitialInfo) {
        self.core.dec_state.lock().unwrap().initial_info = Some(info);
    }

    fn push_script(&self, entry: DecScriptEntry) {
        self.core.dec_state.lock().unwrap().script.push_back(entry);
    }

    fn push_frame(&mut self, data: &[u8], context: u64, pts: u64, dts: u64) {
        self.decoder
            .push_encoded_frame(&EncodedFrame { data, pts, dts, context })
            .unwrap();
    }

    /// Pushes data, expects stream info negotiation, and sets up the pool
    /// and output buffer.
    fn negotiate(&mut self, data: &[u8]) {
        self.push_frame(data, 1, 0, 0);
        assert_eq!(self.decoder.decode().unwrap(), DecOutput::NewStreamInfoAvailable);
        self.add_pool_and_output();
    }

    fn add_pool_and_output(&mut self) {
        let stream_info = self.decoder.stream_info().clone();

        self.pool.clear();
        for _ in 0..stream_info.min_num_required_framebuffers {
            self.pool.push(
                self.allocator
                    .allocate(
                        stream_info.min_fb_pool_framebuffer_size,
                        stream_info.fb_pool_framebuffer_alignment,
                        CachingMode::Cached,
                    )
                    .unwrap(),
            );
        }
        self.decoder.add_framebuffers_to_pool(&self.pool, &[]).unwrap();

        let output_buffer = self
            .allocator
            .allocate(
                stream_info.min_output_framebuffer_size,
                stream_info.output_framebuffer_alignment,
                CachingMode::Cached,
            )
            .unwrap();
        self.decoder.set_output_frame_dma_buffer(Arc::clone(&output_buffer), 55);
        self.output_buffer = Some(output_buffer);
    }
}

fn h264_initial_info() -> DecInitialInfo {
    DecInitialInfo {
        pic_width: 1280,
        pic_height: 720,
        frame_rate_numerator: 25,
        frame_rate_denominator: 1,
        min_frame_buffer_count: 2,
        interlace: false,
        jpeg_sampling: ChromaSampling::S420,
        crop: Default::default(),
    }
}

#[test]
fn stream_buffer_below_minimum_is_rejected() {
    let allocator = FakeDmaAllocator::new();
    let core = MockVpuCore::new(&allocator);

    let stream_buffer = allocator
        .allocate(VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE - 1, 512, CachingMode::Cached)
        .unwrap();

    let result = Decoder::open(
        core as Arc<dyn coda_codecs::backend::VpuCore>,
        DecOpenParams {
            compression_format: CompressionFormat::H264,
            frame_width: 1280,
            frame_height: 720,
            extra_header_data: Vec::new(),
            enable_frame_reordering: false,
            use_semi_planar_color_format: true,
        },
        stream_buffer,
        Box::new(CopyDetiler),
    );

    assert!(matches!(
        result,
        Err(DecError::InsufficientStreamBufferSize { required, .. })
            if required == VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE
    ));
}

#[test]
fn wmv3_without_codec_data_is_rejected() {
    let allocator = FakeDmaAllocator::new();
    let core = MockVpuCore::new(&allocator);
    let stream_buffer = allocator
        .allocate(VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE, 512, CachingMode::Cached)
        .unwrap();

    let result = Decoder::open(
        core as Arc<dyn coda_codecs::backend::VpuCore>,
        DecOpenParams {
            compression_format: CompressionFormat::Wmv3,
            frame_width: 1280,
            frame_height: 720,
            extra_header_data: vec![0xAA, 0xBB],
            enable_frame_reordering: false,
            use_semi_planar_color_format: true,
        },
        stream_buffer,
        Box::new(CopyDetiler),
    );

    assert!(matches!(result, Err(DecError::InvalidExtraHeaderData(_))));
}

#[test]
fn only_one_frame_can_be_staged() {
    let mut harness = DecoderHarness::open(CompressionFormat::H264, |_| ());
    harness.push_frame(&[0x01], 1, 0, 0);
    assert_eq!(
        harness.decoder.push_encoded_frame(&EncodedFrame {
            data: &[0x02],
            pts: 1,
            dts: 1,
            context: 2
        }),
        Err(DecError::InvalidCall)
    );
}

#[test]
fn decode_without_input_needs_more_input() {
    let mut harness = DecoderHarness::open(CompressionFormat::H264, |_| ());
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::MoreInputNeeded);
}

#[test]
fn jpeg_single_frame_decode() {
    let mut harness = DecoderHarness::open(CompressionFormat::Jpeg, |params| {
        params.frame_width = 1920;
        params.frame_height = 1088;
    });
    harness.set_initial_info(DecInitialInfo {
        pic_width: 640,
        pic_height: 480,
        frame_rate_numerator: 0,
        frame_rate_denominator: 1,
        min_frame_buffer_count: 1,
        interlace: false,
        jpeg_sampling: ChromaSampling::S420,
        crop: Default::default(),
    });

    let jpeg = synthesize_jpeg(640, 480);
    harness.decoder.push_encoded_frame(&EncodedFrame {
        data: &jpeg,
        pts: 11,
        dts: 22,
        context: 0x1234,
    }).unwrap();

    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::NewStreamInfoAvailable);

    let stream_info = harness.decoder.stream_info().clone();
    assert_eq!(stream_info.color_format, ColorFormat::Yuv420SemiPlanar);
    assert_eq!(stream_info.min_num_required_framebuffers, 1);
    assert_eq!(stream_info.decoded_frame_metrics.actual_width, 640);
    assert_eq!(stream_info.decoded_frame_metrics.actual_height, 480);

    harness.add_pool_and_output();

    harness.push_script(DecScriptEntry::ok(DecOutputInfo::default()));
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::DecodedFrameAvailable);

    let frame = harness.decoder.get_decoded_frame().unwrap();
    assert_eq!(frame.context, 0x1234);
    assert_eq!(frame.pts, 11);
    assert_eq!(frame.dts, 22);
    assert_eq!(frame.fb_context, 55);

    // The JPEG rotator was pointed at the output buffer; no display flag
    // handling happens for JPEG.
    let state = harness.core.dec_state.lock().unwrap();
    let rotator = state.rotator_output.expect("rotator output not set");
    assert_eq!(
        rotator.buf_y,
        harness.output_buffer.as_ref().unwrap().physical_address()
    );
    assert!(state.cleared_display_flags.is_empty());
    drop(state);

    // A second retrieval of the same frame is a call sequence error.
    assert_eq!(harness.decoder.get_decoded_frame().unwrap_err(), DecError::InvalidCall);
}

#[test]
fn jpeg_format_change_renegotiates() {
    let mut harness = DecoderHarness::open(CompressionFormat::Jpeg, |_| ());
    harness.set_initial_info(DecInitialInfo {
        pic_width: 640,
        pic_height: 480,
        min_frame_buffer_count: 1,
        jpeg_sampling: ChromaSampling::S420,
        ..h264_initial_info()
    });

    harness.negotiate(&synthesize_jpeg(640, 480));
    harness.push_script(DecScriptEntry::ok(DecOutputInfo::default()));
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::DecodedFrameAvailable);
    harness.decoder.get_decoded_frame().unwrap();

    // A frame with different dimensions must renegotiate before any
    // firmware call.
    harness.push_frame(&synthesize_jpeg(320, 240), 2, 0, 0);
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::NewStreamInfoAvailable);
    assert_eq!(harness.decoder.stream_info().decoded_frame_metrics.actual_width, 320);
    assert_eq!(harness.decoder.stream_info().decoded_frame_metrics.actual_height, 240);

    // The pool has to be re-added, then decoding proceeds.
    harness.add_pool_and_output();
    harness.push_script(DecScriptEntry::ok(DecOutputInfo::default()));
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::DecodedFrameAvailable);
}

#[test]
fn wmv3_first_frame_gets_sequence_layer_header() {
    let mut harness = DecoderHarness::open(CompressionFormat::Wmv3, |params| {
        params.extra_header_data = vec![0xAA, 0xBB, 0xCC, 0xDD];
    });
    harness.set_initial_info(h264_initial_info());

    let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
    harness.push_frame(&payload, 7, 0, 0);

    // The first bytes written into the stream buffer must be the 24-byte
    // sequence layer header, followed by the main data.
    let written = common::read_buffer(&harness.stream_buffer, 24 + 300);
    #[rustfmt::skip]
    let expected_header: [u8; 24] = [
        0xFF, 0xFF, 0xFF, 0xC5,
        0x04, 0x00, 0x00, 0x00,
        0xAA, 0xBB, 0xCC, 0xDD,
        0x00, 0x05, 0x00, 0x00, // width 1280
        0xD0, 0x02, 0x00, 0x00, // height 720
        0x2C, 0x01, 0x00, 0x00, // main data size 300
    ];
    assert_eq!(&written[..24], &expected_header);
    assert_eq!(&written[24..], &payload[..]);

    // Negotiate and consume the staged frame so a second one can be pushed.
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::NewStreamInfoAvailable);
    harness.add_pool_and_output();
    harness.push_script(DecScriptEntry::ok(DecOutputInfo {
        index_frame_decoded: 0,
        ..Default::default()
    }));
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::NoOutputYet);

    // Every further frame gets a 4-byte frame layer header.
    let second: Vec<u8> = vec![0x42; 200];
    harness.push_frame(&second, 8, 0, 0);
    let written = common::read_buffer(&harness.stream_buffer, 24 + 300 + 4 + 200);
    assert_eq!(&written[324..328], &[200, 0, 0, 0]);
    assert_eq!(&written[328..], &second[..]);
}

#[test]
fn h264_drain_surfaces_frames_in_presentation_order() {
    let mut harness = DecoderHarness::open(CompressionFormat::H264, |params| {
        params.enable_frame_reordering = true;
    });
    harness.set_initial_info(h264_initial_info());

    harness.negotiate(&[0x00, 0x00, 0x00, 0x01, 0x67]);
    // The extra framebuffers compensate for firmware underreporting.
    assert_eq!(harness.decoder.stream_info().min_num_required_framebuffers, 6);

    // 5 frames with a 2-frame reordering delay: slot i decodes pts i,
    // display starts lagging at slot 0.
    let mut displayed = Vec::new();
    for i in 0..5u64 {
        if i > 0 {
            harness.push_frame(&[i as u8; 16], 1000 + i, i, i);
        } else {
            // Frame 0 was pushed during negotiation with context 1.
        }

        harness.push_script(DecScriptEntry::ok(DecOutputInfo {
            index_frame_decoded: i as i32,
            index_frame_display: if i >= 2 { (i - 2) as i32 } else { DISPLAY_IDX_NO_FRAME },
            pic_type: if i == 0 { 0 } else { 1 },
            idr_flag: i == 0,
            ..Default::default()
        }));

        match harness.decoder.decode().unwrap() {
            DecOutput::DecodedFrameAvailable => {
                displayed.push(harness.decoder.get_decoded_frame().unwrap());
            }
            DecOutput::NoOutputYet => (),
            other => panic!("unexpected decode output {:?}", other),
        }
    }

    // No more input: drain the two queued frames, then EOS.
    harness.decoder.enable_drain_mode();
    assert!(harness.decoder.is_drain_mode_enabled());
    assert_eq!(
        harness.decoder.push_encoded_frame(&EncodedFrame {
            data: &[0u8; 4],
            pts: 0,
            dts: 0,
            context: 0
        }),
        Err(DecError::InvalidCall)
    );

    for slot in [3, 4] {
        harness.push_script(DecScriptEntry::ok(DecOutputInfo {
            index_frame_decoded: DECODE_IDX_FRAME_NOT_DECODED,
            index_frame_display: slot,
            ..Default::default()
        }));
        assert_eq!(harness.decoder.decode().unwrap(), DecOutput::DecodedFrameAvailable);
        displayed.push(harness.decoder.get_decoded_frame().unwrap());
    }

    harness.push_script(DecScriptEntry::ok(DecOutputInfo {
        index_frame_decoded: DECODE_IDX_FRAME_NOT_DECODED,
        index_frame_display: DISPLAY_IDX_ALL_FRAMES_DISPLAYED,
        ..Default::default()
    }));
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::Eos);
    assert!(!harness.decoder.is_drain_mode_enabled());

    // All 5 frames surfaced, in presentation order, with their contexts.
    assert_eq!(displayed.len(), 5);
    for (i, frame) in displayed.iter().enumerate() {
        assert_eq!(frame.pts, i as u64);
        if i == 0 {
            // Pushed by negotiate() with context 1.
            assert_eq!(frame.context, 1);
            assert_eq!(frame.frame_types, [FrameType::Idr; 2]);
        } else {
            assert_eq!(frame.context, 1000 + i as u64);
            assert_eq!(frame.frame_types, [FrameType::P; 2]);
        }
    }

    // Every displayed slot went back to the firmware, the EOS was
    // signalled, and the pool is idle again.
    let state = harness.core.dec_state.lock().unwrap();
    assert!(state.eos_signalled);
    assert_eq!(state.cleared_display_flags, vec![0, 1, 2, 3, 4]);
    drop(state);
    assert_eq!(harness.decoder.num_used_framebuffers(), 0);
}

#[test]
fn video_parameter_change_is_reported() {
    let mut harness = DecoderHarness::open(CompressionFormat::H264, |_| ());
    harness.set_initial_info(h264_initial_info());
    harness.negotiate(&[0x00, 0x00, 0x00, 0x01, 0x67]);

    harness.push_script(DecScriptEntry::ok(DecOutputInfo {
        index_frame_decoded: 0,
        ..Default::default()
    }));
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::NoOutputYet);

    // An SPS with a new resolution makes the firmware raise the
    // parameters-changed bit; the caller must drain, close and reopen.
    harness.push_frame(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x64], 2, 1, 1);
    harness.push_script(DecScriptEntry::ok(DecOutputInfo {
        decoding_success: DECODING_SUCCESS_PARAMS_CHANGED_BIT,
        ..Default::default()
    }));
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::VideoParametersChanged);
}

#[test]
fn corrupted_frame_is_skipped_with_its_metadata() {
    let mut harness = DecoderHarness::open(CompressionFormat::H264, |_| ());
    harness.set_initial_info(h264_initial_info());
    harness.negotiate(&[0x00, 0x00, 0x00, 0x01, 0x67]);

    harness.push_script(DecScriptEntry::ok(DecOutputInfo {
        index_frame_decoded: 0,
        ..Default::default()
    }));
    harness.decoder.decode().unwrap();

    harness.push_frame(&[0xBA, 0xD0], 0xBAD, 77, 78);
    harness.push_script(DecScriptEntry::ok(DecOutputInfo {
        decoding_success: DECODING_SUCCESS_INCOMPLETE_BIT,
        ..Default::default()
    }));
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::FrameSkipped);

    let skipped = harness.decoder.skipped_frame_info().unwrap();
    assert_eq!(skipped.reason, SkippedFrameReason::CorruptedFrame);
    assert_eq!(skipped.context, 0xBAD);
    assert_eq!(skipped.pts, 77);
    assert_eq!(skipped.dts, 78);

    // The staged frame was consumed; new input is accepted.
    harness.push_frame(&[0x00], 3, 0, 0);
}

#[test]
fn vp8_invisible_frame_is_dropped_as_internal() {
    let mut harness = DecoderHarness::open(CompressionFormat::Vp8, |_| ());
    harness.set_initial_info(h264_initial_info());
    harness.negotiate(&[0x9D, 0x01, 0x2A]);

    harness.push_frame(&[0x10, 0x20], 9, 5, 5);
    harness.push_script(DecScriptEntry::ok(DecOutputInfo {
        index_frame_decoded: 1,
        index_frame_display: DISPLAY_IDX_NO_FRAME,
        ..Default::default()
    }));

    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::FrameSkipped);
    let skipped = harness.decoder.skipped_frame_info().unwrap();
    assert_eq!(skipped.reason, SkippedFrameReason::InternalFrame);
    assert_eq!(skipped.context, 9);
}

#[test]
fn vp8_stream_is_wrapped_in_ivf() {
    let mut harness = DecoderHarness::open(CompressionFormat::Vp8, |params| {
        params.frame_width = 640;
        params.frame_height = 360;
    });
    harness.set_initial_info(h264_initial_info());

    let payload = [0xAB; 10];
    harness.push_frame(&payload, 1, 0, 0);

    let written = common::read_buffer(&harness.stream_buffer, 32 + 12 + 10);
    assert_eq!(&written[0..4], b"DKIF");
    assert_eq!(&written[8..12], b"VP80");
    // Width/height little-endian.
    assert_eq!(&written[12..16], &[0x80, 0x02, 0x68, 0x01]);
    // Frame header: size 10, timestamp 0.
    assert_eq!(&written[32..36], &[10, 0, 0, 0]);
    assert_eq!(&written[36..44], &[0; 8]);
    assert_eq!(&written[44..54], &payload);
}

#[test]
fn pool_registration_packs_coda_pointers() {
    let mut harness = DecoderHarness::open(CompressionFormat::H264, |_| ());
    harness.set_initial_info(h264_initial_info());
    harness.negotiate(&[0x00, 0x00, 0x00, 0x01, 0x67]);

    let metrics = harness.decoder.stream_info().decoded_frame_metrics;
    let state = harness.core.dec_state.lock().unwrap();
    assert_eq!(state.registered_framebuffers.len(), 6);
    assert_eq!(state.registered_stride, metrics.y_stride);

    // Semi-planar 1280x720: pool UV plane right after the Y plane, MvCol
    // after the chroma plane.
    let y_size = metrics.y_stride * metrics.aligned_height;
    let uv_size = y_size / 2;
    for (i, fb) in state.registered_framebuffers.iter().enumerate() {
        let phys = harness.pool[i].physical_address();
        let uv_address = phys + y_size as u64;
        assert_eq!(fb.buf_y, (phys & !0xFFF) | (uv_address >> 20));
        assert_eq!(fb.buf_cb, ((uv_address >> 12) & 0xFF) << 24);
        assert_eq!(fb.buf_cr, 0);
        assert_eq!(fb.buf_mv_col, phys + (y_size + uv_size) as u64);
    }

    // The slice and VP8 prediction buffers live in the stream buffer tail.
    let aux = state.aux_buffers.unwrap();
    assert_eq!(
        aux.slice_buffer,
        harness.stream_buffer.physical_address() + (3 * 1024 * 1024) as u64
    );
    assert_eq!(aux.mb_prediction_buffer, aux.slice_buffer);
}

#[test]
fn adding_framebuffers_twice_is_rejected() {
    let mut harness = DecoderHarness::open(CompressionFormat::H264, |_| ());
    harness.set_initial_info(h264_initial_info());
    harness.negotiate(&[0x00, 0x00, 0x00, 0x01, 0x67]);

    let extra = harness.pool.clone();
    assert_eq!(
        harness.decoder.add_framebuffers_to_pool(&extra, &[]),
        Err(DecError::InvalidCall)
    );
}

#[test]
fn flush_releases_reserved_slots() {
    let mut harness = DecoderHarness::open(CompressionFormat::H264, |_| ());
    harness.set_initial_info(h264_initial_info());
    harness.negotiate(&[0x00, 0x00, 0x00, 0x01, 0x67]);

    // Reserve slot 2 without displaying it.
    harness.push_script(DecScriptEntry::ok(DecOutputInfo {
        index_frame_decoded: 2,
        ..Default::default()
    }));
    assert_eq!(harness.decoder.decode().unwrap(), DecOutput::NoOutputYet);
    assert_eq!(harness.decoder.num_used_framebuffers(), 1);

    harness.decoder.flush();
    assert_eq!(harness.decoder.num_used_framebuffers(), 0);

    let state = harness.core.dec_state.lock().unwrap();
    assert_eq!(state.cleared_display_flags, vec![2]);
    assert_eq!(state.flush_count, 1);
    drop(state);

    // Flushing cleared drain and staged state; input flows again.
    harness.push_frame(&[0x00], 4, 0, 0);
}

#[test]
fn wmv3_flush_is_a_no_op() {
    let mut harness = DecoderHarness::open(CompressionFormat::Wmv3, |params| {
        params.extra_header_data = vec![0xAA, 0xBB, 0xCC, 0xDD];
    });
    harness.set_initial_info(h264_initial_info());
    harness.negotiate(&[0x11; 32]);

    harness.decoder.flush();
    assert_eq!(harness.core.dec_state.lock().unwrap().flush_count, 0);
}

#[test]
fn close_signals_eos_to_the_firmware() {
    let harness = DecoderHarness::open(CompressionFormat::H264, |_| ());
    harness.set_initial_info(h264_initial_info());

    let state_handle = Arc::clone(&harness.core.dec_state);
    harness.decoder.close();

    let state = state_handle.lock().unwrap();
    assert!(state.closed);
    assert!(state.eos_signalled);
}
