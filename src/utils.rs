// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility code that didn't fit any other module.
//!
//! [`MemfdDmaBufferAllocator`] is a software implementation of the DMA
//! buffer contract, backed by anonymous memfd memory. It cannot provide
//! physical addresses (it reports 0, as the contract allows), so it won't
//! feed real hardware; it exists for tests and for pipelines whose frames
//! never leave the CPU.

use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;

use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::sys::mman;
use nix::sys::mman::ProtFlags;
use nix::unistd::ftruncate;

use crate::dmabuf::CachingMode;
use crate::dmabuf::DmaBuffer;
use crate::dmabuf::DmaBufferAllocator;
use crate::dmabuf::DmaBufferError;
use crate::dmabuf::MapFlags;
use crate::dmabuf::PhysicalAddress;

#[derive(Default)]
struct MappingState {
    /// Address of the current mapping; stored as usize so the state stays
    /// Send.
    ptr: usize,
    refs: usize,
}

struct MemfdDmaBuffer {
    fd: OwnedFd,
    size: usize,
    state: Mutex<MappingState>,
}

impl DmaBuffer for MemfdDmaBuffer {
    fn size(&self) -> usize {
        self.size
    }

    fn physical_address(&self) -> PhysicalAddress {
        // memfd memory is not physically contiguous.
        0
    }

    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn map_raw(&self, flags: MapFlags) -> Result<NonNull<u8>, DmaBufferError> {
        let mut state = self.state.lock().unwrap();

        if state.refs == 0 {
            let mut prot = ProtFlags::empty();
            if flags.read {
                prot |= ProtFlags::PROT_READ;
            }
            if flags.write {
                prot |= ProtFlags::PROT_WRITE;
            }
            if prot.is_empty() {
                prot = ProtFlags::PROT_READ;
            }

            let len = NonZeroUsize::new(self.size).ok_or_else(|| {
                DmaBufferError::Mapping(anyhow::anyhow!("cannot map an empty buffer"))
            })?;

            // SAFETY: mapping a fresh region chosen by the kernel over our
            // own fd.
            let ptr = unsafe {
                mman::mmap(None, len, prot, mman::MapFlags::MAP_SHARED, &self.fd, 0)
            }
            .map_err(|errno| DmaBufferError::Mapping(anyhow::anyhow!("mmap failed: {}", errno)))?;

            state.ptr = ptr.as_ptr() as usize;
        }
        state.refs += 1;

        NonNull::new(state.ptr as *mut u8)
            .ok_or_else(|| DmaBufferError::Mapping(anyhow::anyhow!("mmap returned null")))
    }

    fn unmap_raw(&self) {
        let mut state = self.state.lock().unwrap();
        if state.refs == 0 {
            return;
        }

        state.refs -= 1;
        if state.refs == 0 {
            if let Some(ptr) = NonNull::new(state.ptr as *mut std::ffi::c_void) {
                // SAFETY: `ptr`/`size` describe the mapping established in
                // map_raw, and no guard references it anymore.
                if let Err(errno) = unsafe { mman::munmap(ptr, self.size) } {
                    log::error!("munmap failed: {}", errno);
                }
            }
            state.ptr = 0;
        }
    }
}

/// Software allocator backed by memfd memory.
///
/// The alignment argument only holds up to page granularity, which is all
/// memfd can promise; the caching mode is ignored (CPU memory is always
/// cached).
pub struct MemfdDmaBufferAllocator;

impl DmaBufferAllocator for MemfdDmaBufferAllocator {
    fn allocate(
        &self,
        size: usize,
        _alignment: usize,
        _caching: CachingMode,
    ) -> Result<Arc<dyn DmaBuffer>, DmaBufferError> {
        let fd = memfd_create(c"coda-codecs-dma", MemFdCreateFlag::empty()).map_err(|errno| {
            DmaBufferError::Allocation {
                size,
                source: anyhow::anyhow!("memfd_create failed: {}", errno),
            }
        })?;

        ftruncate(&fd, size as i64).map_err(|errno| DmaBufferError::Allocation {
            size,
            source: anyhow::anyhow!("ftruncate failed: {}", errno),
        })?;

        Ok(Arc::new(MemfdDmaBuffer { fd, size, state: Mutex::new(MappingState::default()) }))
    }
}
