// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Simplified one-call JPEG encoding and decoding.
//!
//! The full decoder/encoder surface is built for streaming video and makes
//! the caller manage stream buffers, framebuffer pools and state machine
//! steps. For plain JPEG images none of that is interesting, so this module
//! wraps it all: internal instances are opened on first use (and reopened
//! when parameters change), pools are allocated from the caller's DMA
//! allocator, and one call runs exactly one decode or encode cycle.

use std::sync::Arc;

use log::debug;

use crate::backend::VpuCore;
use crate::capabilities::set_default_open_params;
use crate::decoder::DecError;
use crate::decoder::DecOpenParams;
use crate::decoder::DecOutput;
use crate::decoder::Decoder;
use crate::decoder::VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE;
use crate::detile::CopyDetiler;
use crate::dmabuf::CachingMode;
use crate::dmabuf::DmaBuffer;
use crate::dmabuf::DmaBufferAllocator;
use crate::encoder::EncError;
use crate::encoder::EncOutput;
use crate::encoder::Encoder;
use crate::encoder::VPU_ENC_MIN_REQUIRED_STREAM_BUFFER_SIZE;
use crate::geometry::FramebufferMetrics;
use crate::capabilities::STREAM_BUFFER_PHYSADDR_ALIGNMENT;
use crate::ColorFormat;
use crate::CompressionFormat;
use crate::RawFrame;

/// Properties of a decoded JPEG frame.
#[derive(Clone)]
pub struct JpegDecInfo {
    pub metrics: FramebufferMetrics,
    pub color_format: ColorFormat,
    /// Buffer holding the decoded pixels, laid out per `metrics`.
    pub framebuffer: Arc<dyn DmaBuffer>,
}

/// One-call JPEG decoder.
pub struct JpegDecoder {
    allocator: Arc<dyn DmaBufferAllocator>,
    decoder: Decoder,
    framebuffers: Vec<Arc<dyn DmaBuffer>>,
    num_extra_framebuffers: usize,
}

impl JpegDecoder {
    /// Opens a JPEG decoder. The stream buffer is allocated from
    /// `allocator`; `num_extra_framebuffers` adds pool slots on top of the
    /// negotiated minimum.
    pub fn open(
        core: Arc<dyn VpuCore>,
        allocator: Arc<dyn DmaBufferAllocator>,
        use_semi_planar_color_format: bool,
        num_extra_framebuffers: usize,
    ) -> Result<JpegDecoder, DecError> {
        let stream_buffer = allocator.allocate(
            VPU_DEC_MIN_REQUIRED_STREAM_BUFFER_SIZE,
            STREAM_BUFFER_PHYSADDR_ALIGNMENT,
            CachingMode::Cached,
        )?;

        let open_params = DecOpenParams {
            compression_format: CompressionFormat::Jpeg,
            frame_width: 0,
            frame_height: 0,
            extra_header_data: Vec::new(),
            enable_frame_reordering: false,
            use_semi_planar_color_format,
        };

        let decoder = Decoder::open(core, open_params, stream_buffer, Box::new(CopyDetiler))?;

        Ok(JpegDecoder { allocator, decoder, framebuffers: Vec::new(), num_extra_framebuffers })
    }

    /// Decodes one complete JPEG image.
    ///
    /// Returns `None` when the data produced no frame (which for well-formed
    /// input does not happen).
    pub fn decode(&mut self, jpeg_data: &[u8]) -> Result<Option<JpegDecInfo>, DecError> {
        self.decoder.push_encoded_frame(&crate::EncodedFrame {
            data: jpeg_data,
            pts: 0,
            dts: 0,
            context: 0,
        })?;

        // One decode step announces new stream info on format changes, a
        // second one then decodes; bound the loop accordingly.
        for _ in 0..3 {
            match self.decoder.decode()? {
                DecOutput::NewStreamInfoAvailable => {
                    self.reallocate_framebuffers()?;
                }
                DecOutput::DecodedFrameAvailable => {
                    let raw_frame = self.decoder.get_decoded_frame()?;
                    let stream_info = self.decoder.stream_info();
                    return Ok(Some(JpegDecInfo {
                        metrics: stream_info.decoded_frame_metrics,
                        color_format: stream_info.color_format,
                        framebuffer: raw_frame.dma_buffer,
                    }));
                }
                DecOutput::MoreInputNeeded | DecOutput::Eos => return Ok(None),
                _ => (),
            }
        }

        Ok(None)
    }

    fn reallocate_framebuffers(&mut self) -> Result<(), DecError> {
        let stream_info = self.decoder.stream_info().clone();

        debug!(
            "(re)allocating JPEG framebuffer pool: {} framebuffers of {} byte",
            stream_info.min_num_required_framebuffers + self.num_extra_framebuffers,
            stream_info.min_fb_pool_framebuffer_size,
        );

        self.framebuffers.clear();
        let num = stream_info.min_num_required_framebuffers + self.num_extra_framebuffers;
        for _ in 0..num {
            self.framebuffers.push(self.allocator.allocate(
                stream_info.min_fb_pool_framebuffer_size,
                stream_info.fb_pool_framebuffer_alignment,
                CachingMode::Cached,
            )?);
        }
        self.decoder.add_framebuffers_to_pool(&self.framebuffers, &[])?;

        // The decoder keeps its own reference to the output buffer; the
        // decoded-frame info hands it back to the caller.
        let output_buffer = self.allocator.allocate(
            stream_info.min_output_framebuffer_size,
            stream_info.output_framebuffer_alignment,
            CachingMode::Cached,
        )?;
        self.decoder.set_output_frame_dma_buffer(output_buffer, 0);

        Ok(())
    }

    pub fn close(self) {
        self.decoder.close();
    }
}

/// Per-image parameters of [`JpegEncoder::encode`]. A change against the
/// previous call reopens the internal encoder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JpegEncParams {
    pub frame_width: usize,
    pub frame_height: usize,
    /// IJG-style quality factor, 1..100.
    pub quality_factor: u32,
    pub color_format: ColorFormat,
}

/// One-call JPEG encoder.
pub struct JpegEncoder {
    core: Arc<dyn VpuCore>,
    stream_buffer: Arc<dyn DmaBuffer>,
    encoder: Option<Encoder>,
    current_params: Option<JpegEncParams>,
}

impl JpegEncoder {
    /// Opens a JPEG encoder. The underlying firmware encoder is opened
    /// lazily on the first [`JpegEncoder::encode`] call, where width,
    /// height, quality and color format are known.
    pub fn open(
        core: Arc<dyn VpuCore>,
        allocator: Arc<dyn DmaBufferAllocator>,
    ) -> Result<JpegEncoder, EncError> {
        let stream_buffer = allocator.allocate(
            VPU_ENC_MIN_REQUIRED_STREAM_BUFFER_SIZE,
            STREAM_BUFFER_PHYSADDR_ALIGNMENT,
            CachingMode::Cached,
        )?;

        Ok(JpegEncoder { core, stream_buffer, encoder: None, current_params: None })
    }

    /// Encodes one raw frame and returns the JPEG bytes.
    pub fn encode(
        &mut self,
        frame: &Arc<dyn DmaBuffer>,
        params: &JpegEncParams,
    ) -> Result<Vec<u8>, EncError> {
        if self.current_params != Some(*params) {
            // Parameters changed (or first use); reopen the encoder.
            if let Some(encoder) = self.encoder.take() {
                encoder.close();
            }

            let mut open_params = set_default_open_params(
                CompressionFormat::Jpeg,
                params.color_format,
                params.frame_width,
                params.frame_height,
            );
            open_params.quantization = 100 - params.quality_factor.clamp(1, 100);

            self.encoder = Some(Encoder::open(
                Arc::clone(&self.core),
                open_params,
                Arc::clone(&self.stream_buffer),
            )?);
            self.current_params = Some(*params);
        }

        let encoder = self.encoder.as_mut().ok_or(EncError::InvalidCall)?;

        encoder.push_raw_frame(RawFrame {
            dma_buffer: Arc::clone(frame),
            frame_types: Default::default(),
            interlacing_mode: Default::default(),
            pts: 0,
            dts: 0,
            context: 0,
            fb_context: 0,
        })?;

        match encoder.encode()? {
            EncOutput::EncodedFrameAvailable { encoded_frame_size } => {
                let mut data = vec![0u8; encoded_frame_size];
                encoder.get_encoded_frame(&mut data)?;
                Ok(data)
            }
            EncOutput::MoreInputDataNeeded => Err(EncError::Error),
        }
    }

    pub fn close(self) {
        if let Some(encoder) = self.encoder {
            encoder.close();
        }
    }
}
