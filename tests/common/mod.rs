// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared test infrastructure: a fake DMA allocator handing out
//! heap-backed buffers with synthetic physical addresses, and a scriptable
//! mock firmware implementing the backend traits.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;

use coda_codecs::backend::BitstreamStatus;
use coda_codecs::backend::DecAuxBuffers;
use coda_codecs::backend::DecCoreOpenParams;
use coda_codecs::backend::DecInitialInfo;
use coda_codecs::backend::DecOutputInfo;
use coda_codecs::backend::DecStartParams;
use coda_codecs::backend::DecoderCore;
use coda_codecs::backend::EncCoreOpenParams;
use coda_codecs::backend::EncHeaderKind;
use coda_codecs::backend::EncHeaderRequest;
use coda_codecs::backend::EncInitialInfo;
use coda_codecs::backend::EncOutputInfo;
use coda_codecs::backend::EncStartParams;
use coda_codecs::backend::EncoderCore;
use coda_codecs::backend::RetCode;
use coda_codecs::backend::ScratchBuffer;
use coda_codecs::backend::VpuCore;
use coda_codecs::backend::VpuFramebuffer;
use coda_codecs::dmabuf::CachingMode;
use coda_codecs::dmabuf::DmaBuffer;
use coda_codecs::dmabuf::DmaBufferAllocator;
use coda_codecs::dmabuf::DmaBufferError;
use coda_codecs::dmabuf::MapFlags;
use coda_codecs::dmabuf::PhysicalAddress;

/// Routes crate logs to the test output. Safe to call from every test.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A heap-backed "DMA" buffer with a synthetic physical address.
pub struct FakeDmaBuffer {
    data: Box<[std::cell::UnsafeCell<u8>]>,
    physical_address: PhysicalAddress,
}

// The tests drive each codec instance from a single thread; the cells are
// only ever touched through the mapping guard.
unsafe impl Send for FakeDmaBuffer {}
unsafe impl Sync for FakeDmaBuffer {}

impl FakeDmaBuffer {
    fn new(size: usize, physical_address: PhysicalAddress) -> Self {
        let data = (0..size).map(|_| std::cell::UnsafeCell::new(0u8)).collect();
        Self { data, physical_address }
    }
}

impl DmaBuffer for FakeDmaBuffer {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn physical_address(&self) -> PhysicalAddress {
        self.physical_address
    }

    fn map_raw(&self, _flags: MapFlags) -> Result<NonNull<u8>, DmaBufferError> {
        NonNull::new(self.data.as_ptr() as *mut u8)
            .ok_or_else(|| DmaBufferError::Mapping(anyhow::anyhow!("empty fake buffer")))
    }

    fn unmap_raw(&self) {}
}

/// Allocator handing out [`FakeDmaBuffer`]s at increasing, 4096-aligned
/// synthetic physical addresses, and remembering them so the mock firmware
/// can "DMA" into buffers by physical address.
pub struct FakeDmaAllocator {
    state: Mutex<FakeAllocatorState>,
}

#[derive(Default)]
struct FakeAllocatorState {
    next_physical_address: PhysicalAddress,
    buffers: Vec<Arc<FakeDmaBuffer>>,
}

impl FakeDmaAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeAllocatorState {
                next_physical_address: 0x1000_0000,
                buffers: Vec::new(),
            }),
        })
    }

    /// Writes `data` at the given synthetic physical address, like the
    /// hardware would.
    pub fn bus_write(&self, physical_address: PhysicalAddress, data: &[u8]) {
        let state = self.state.lock().unwrap();
        for buffer in &state.buffers {
            let start = buffer.physical_address;
            let end = start + buffer.size() as PhysicalAddress;
            if physical_address >= start && physical_address + data.len() as u64 <= end {
                let offset = (physical_address - start) as usize;
                for (i, byte) in data.iter().enumerate() {
                    // SAFETY: in-bounds cell of a live buffer; tests are
                    // single-threaded per instance.
                    unsafe { *buffer.data[offset + i].get() = *byte };
                }
                return;
            }
        }
        panic!("bus write to unmapped physical address {:#x}", physical_address);
    }

    /// Reads `len` bytes from the given synthetic physical address.
    pub fn bus_read(&self, physical_address: PhysicalAddress, len: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        for buffer in &state.buffers {
            let start = buffer.physical_address;
            let end = start + buffer.size() as PhysicalAddress;
            if physical_address >= start && physical_address + len as u64 <= end {
                let offset = (physical_address - start) as usize;
                return (0..len)
                    // SAFETY: see bus_write.
                    .map(|i| unsafe { *buffer.data[offset + i].get() })
                    .collect();
            }
        }
        panic!("bus read from unmapped physical address {:#x}", physical_address);
    }
}

impl DmaBufferAllocator for FakeDmaAllocator {
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        _caching: CachingMode,
    ) -> Result<Arc<dyn DmaBuffer>, DmaBufferError> {
        let mut state = self.state.lock().unwrap();

        let alignment = alignment.max(4096) as PhysicalAddress;
        let physical_address =
            (state.next_physical_address + alignment - 1) / alignment * alignment;
        state.next_physical_address = physical_address + size as PhysicalAddress;

        let buffer = Arc::new(FakeDmaBuffer::new(size, physical_address));
        state.buffers.push(Arc::clone(&buffer));
        Ok(buffer)
    }
}

/// One scripted decode cycle of the mock firmware.
#[derive(Clone)]
pub struct DecScriptEntry {
    pub start_result: Result<(), RetCode>,
    pub output_info: DecOutputInfo,
}

impl DecScriptEntry {
    pub fn ok(output_info: DecOutputInfo) -> Self {
        Self { start_result: Ok(()), output_info }
    }
}

#[derive(Default)]
pub struct MockDecState {
    pub open_params: Option<DecCoreOpenParams>,
    pub initial_info: Option<DecInitialInfo>,
    pub script: VecDeque<DecScriptEntry>,

    pub bitstream_base: PhysicalAddress,
    pub bitstream_size: usize,
    pub write_pointer: PhysicalAddress,
    pub bytes_pushed: usize,
    pub eos_signalled: bool,

    pub registered_framebuffers: Vec<VpuFramebuffer>,
    pub registered_stride: usize,
    pub aux_buffers: Option<DecAuxBuffers>,
    pub cleared_display_flags: Vec<usize>,
    pub flush_count: usize,
    pub rotator_output: Option<VpuFramebuffer>,
    pub rotator_stride: Option<usize>,
    pub force_escape_calls: Vec<bool>,
    pub closed: bool,

    pending_output: Option<DecOutputInfo>,
}

/// One scripted encode cycle of the mock firmware.
#[derive(Clone)]
pub struct EncScriptEntry {
    pub start_result: Result<(), RetCode>,
    /// Payload the "hardware" writes into the stream buffer.
    pub payload: Vec<u8>,
    /// Raw picture type reported back (0 = I, 1 = P).
    pub pic_type: u32,
}

#[derive(Default)]
pub struct MockEncState {
    pub open_params: Option<EncCoreOpenParams>,
    pub initial_info: EncInitialInfo,
    pub script: VecDeque<EncScriptEntry>,

    /// Header blobs returned per kind.
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub vos: Vec<u8>,
    pub vis: Vec<u8>,
    pub vol: Vec<u8>,
    pub jpeg_header: Vec<u8>,
    pub mpeg4_profile_levels_seen: Vec<Option<u32>>,

    pub registered_framebuffers: Vec<VpuFramebuffer>,
    pub registered_stride: usize,
    pub subsample_buffers: Option<(PhysicalAddress, PhysicalAddress)>,
    pub scratch: Option<ScratchBuffer>,
    pub register_calls: usize,

    /// force_i_picture flag of every start_one_frame call, in order.
    pub forced_i_pictures: Vec<bool>,
    pub bitrate_updates: Vec<u32>,
    pub frame_rate_updates: Vec<u32>,
    pub software_resets: usize,
    pub closed: bool,
    /// When set, the next close fails with FrameNotComplete once.
    pub refuse_next_close: bool,

    pending_output: Option<EncOutputInfo>,
}

/// The mock firmware entry point. Holds the shared state handles the tests
/// use for scripting and assertions.
pub struct MockVpuCore {
    pub allocator: Arc<FakeDmaAllocator>,
    pub dec_state: Arc<Mutex<MockDecState>>,
    pub enc_state: Arc<Mutex<MockEncState>>,
}

impl MockVpuCore {
    pub fn new(allocator: &Arc<FakeDmaAllocator>) -> Arc<Self> {
        Arc::new(Self {
            allocator: Arc::clone(allocator),
            dec_state: Arc::new(Mutex::new(MockDecState::default())),
            enc_state: Arc::new(Mutex::new(MockEncState::default())),
        })
    }
}

impl VpuCore for MockVpuCore {
    fn init(&self) -> Result<(), RetCode> {
        Ok(())
    }

    fn deinit(&self) {}

    fn open_decoder(&self, params: &DecCoreOpenParams) -> Result<Box<dyn DecoderCore>, RetCode> {
        let mut state = self.dec_state.lock().unwrap();
        state.open_params = Some(params.clone());
        state.bitstream_base = params.bitstream_buffer;
        state.bitstream_size = params.bitstream_buffer_size;
        state.write_pointer = params.bitstream_buffer;
        drop(state);

        Ok(Box::new(MockDecoderCore { state: Arc::clone(&self.dec_state) }))
    }

    fn open_encoder(&self, params: &EncCoreOpenParams) -> Result<Box<dyn EncoderCore>, RetCode> {
        let mut state = self.enc_state.lock().unwrap();
        state.open_params = Some(params.clone());
        drop(state);

        Ok(Box::new(MockEncoderCore {
            state: Arc::clone(&self.enc_state),
            allocator: Arc::clone(&self.allocator),
        }))
    }
}

struct MockDecoderCore {
    state: Arc<Mutex<MockDecState>>,
}

impl DecoderCore for MockDecoderCore {
    fn bitstream_status(&mut self) -> Result<BitstreamStatus, RetCode> {
        let state = self.state.lock().unwrap();
        Ok(BitstreamStatus {
            read_pointer: state.bitstream_base,
            write_pointer: state.write_pointer,
            free_bytes: state.bitstream_size.saturating_sub(state.bytes_pushed),
        })
    }

    fn update_bitstream(&mut self, len: usize) -> Result<(), RetCode> {
        let mut state = self.state.lock().unwrap();
        if len == 0 {
            state.eos_signalled = true;
            return Ok(());
        }

        state.bytes_pushed += len;
        let offset =
            (state.write_pointer - state.bitstream_base) as usize + len;
        state.write_pointer = state.bitstream_base + (offset % state.bitstream_size) as u64;
        Ok(())
    }

    fn set_force_escape(&mut self, enable: bool) -> Result<(), RetCode> {
        self.state.lock().unwrap().force_escape_calls.push(enable);
        Ok(())
    }

    fn initial_info(&mut self) -> Result<DecInitialInfo, RetCode> {
        self.state.lock().unwrap().initial_info.ok_or(RetCode::Failure)
    }

    fn register_framebuffers(
        &mut self,
        framebuffers: &[VpuFramebuffer],
        stride: usize,
        aux: &DecAuxBuffers,
    ) -> Result<(), RetCode> {
        let mut state = self.state.lock().unwrap();
        state.registered_framebuffers = framebuffers.to_vec();
        state.registered_stride = stride;
        state.aux_buffers = Some(*aux);
        Ok(())
    }

    fn start_one_frame(&mut self, _params: &DecStartParams) -> Result<(), RetCode> {
        let mut state = self.state.lock().unwrap();
        let entry = state.script.pop_front().expect("mock decoder script ran dry");
        state.pending_output = Some(entry.output_info);
        entry.start_result
    }

    fn wait_for_interrupt(&mut self, _timeout_ms: u32) -> bool {
        true
    }

    fn output_info(&mut self) -> Result<DecOutputInfo, RetCode> {
        let mut state = self.state.lock().unwrap();
        state.pending_output.take().ok_or(RetCode::WrongCallSequence)
    }

    fn clear_display_flag(&mut self, index: usize) -> Result<(), RetCode> {
        self.state.lock().unwrap().cleared_display_flags.push(index);
        Ok(())
    }

    fn flush_bit_buffer(&mut self) -> Result<(), RetCode> {
        self.state.lock().unwrap().flush_count += 1;
        Ok(())
    }

    fn set_rotation_angle(&mut self, _angle: u32) -> Result<(), RetCode> {
        Ok(())
    }

    fn set_mirror(&mut self, _mirror: u32) -> Result<(), RetCode> {
        Ok(())
    }

    fn set_rotator_stride(&mut self, stride: usize) -> Result<(), RetCode> {
        self.state.lock().unwrap().rotator_stride = Some(stride);
        Ok(())
    }

    fn set_rotator_output(&mut self, framebuffer: &VpuFramebuffer) -> Result<(), RetCode> {
        self.state.lock().unwrap().rotator_output = Some(*framebuffer);
        Ok(())
    }

    fn close(&mut self) -> Result<(), RetCode> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

struct MockEncoderCore {
    state: Arc<Mutex<MockEncState>>,
    allocator: Arc<FakeDmaAllocator>,
}

impl EncoderCore for MockEncoderCore {
    fn initial_info(&mut self) -> Result<EncInitialInfo, RetCode> {
        Ok(self.state.lock().unwrap().initial_info)
    }

    fn register_framebuffers(
        &mut self,
        framebuffers: &[VpuFramebuffer],
        stride: usize,
        subsample_buffer_a: PhysicalAddress,
        subsample_buffer_b: PhysicalAddress,
        scratch: &ScratchBuffer,
    ) -> Result<(), RetCode> {
        let mut state = self.state.lock().unwrap();
        state.registered_framebuffers = framebuffers.to_vec();
        state.registered_stride = stride;
        state.subsample_buffers = Some((subsample_buffer_a, subsample_buffer_b));
        state.scratch = Some(*scratch);
        state.register_calls += 1;
        Ok(())
    }

    fn generate_header(&mut self, request: &EncHeaderRequest) -> Result<Vec<u8>, RetCode> {
        let mut state = self.state.lock().unwrap();
        state.mpeg4_profile_levels_seen.push(request.mpeg4_user_profile_level);
        Ok(match request.kind {
            EncHeaderKind::H264SpsRbsp => state.sps.clone(),
            EncHeaderKind::H264PpsRbsp => state.pps.clone(),
            EncHeaderKind::Mpeg4VosHeader => state.vos.clone(),
            EncHeaderKind::Mpeg4VisHeader => state.vis.clone(),
            EncHeaderKind::Mpeg4VolHeader => state.vol.clone(),
        })
    }

    fn jpeg_header(&mut self, max_size: usize) -> Result<Vec<u8>, RetCode> {
        let header = self.state.lock().unwrap().jpeg_header.clone();
        assert!(header.len() <= max_size);
        Ok(header)
    }

    fn start_one_frame(&mut self, params: &EncStartParams) -> Result<(), RetCode> {
        let mut state = self.state.lock().unwrap();
        state.forced_i_pictures.push(params.force_i_picture);

        let entry = state.script.pop_front().expect("mock encoder script ran dry");
        if let Err(code) = entry.start_result {
            state.pending_output = None;
            return Err(code);
        }

        // Write the payload into the stream buffer like the hardware
        // would.
        let base = state.open_params.as_ref().unwrap().bitstream_buffer;
        let payload_address = base + 0x100;
        self.allocator.bus_write(payload_address, &entry.payload);

        state.pending_output = Some(EncOutputInfo {
            bitstream_buffer: payload_address,
            bitstream_size: entry.payload.len(),
            pic_type: entry.pic_type,
        });
        Ok(())
    }

    fn wait_for_interrupt(&mut self, _timeout_ms: u32) -> bool {
        true
    }

    fn output_info(&mut self) -> Result<EncOutputInfo, RetCode> {
        let mut state = self.state.lock().unwrap();
        state.pending_output.take().ok_or(RetCode::WrongCallSequence)
    }

    fn set_bitrate(&mut self, bitrate_kbps: u32) -> Result<(), RetCode> {
        self.state.lock().unwrap().bitrate_updates.push(bitrate_kbps);
        Ok(())
    }

    fn set_frame_rate(&mut self, packed_frame_rate: u32) -> Result<(), RetCode> {
        self.state.lock().unwrap().frame_rate_updates.push(packed_frame_rate);
        Ok(())
    }

    fn set_rotation_angle(&mut self, _angle: u32) -> Result<(), RetCode> {
        Ok(())
    }

    fn set_mirror(&mut self, _mirror: u32) -> Result<(), RetCode> {
        Ok(())
    }

    fn software_reset(&mut self) -> Result<(), RetCode> {
        self.state.lock().unwrap().software_resets += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), RetCode> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_next_close {
            state.refuse_next_close = false;
            return Err(RetCode::FrameNotComplete);
        }
        state.closed = true;
        Ok(())
    }
}

/// Reads the first `len` bytes of a fake DMA buffer.
pub fn read_buffer(buffer: &Arc<dyn DmaBuffer>, len: usize) -> Vec<u8> {
    let mapping = coda_codecs::dmabuf::map_dma_buffer(
        buffer,
        MapFlags { read: true, write: false, manual_sync: false },
    )
    .unwrap();
    mapping.as_slice()[..len].to_vec()
}
