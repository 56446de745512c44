// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Abstraction over physically contiguous (DMA) memory.
//!
//! The VPU reads and writes physically contiguous buffers only. Where those
//! buffers come from (CMA, dma-heap, ION, carveout) is none of this crate's
//! business; allocators implement [`DmaBufferAllocator`] and hand out objects
//! implementing [`DmaBuffer`]. The codec state machines hold buffers as
//! `Arc<dyn DmaBuffer>` and reference them towards the firmware by physical
//! address only.
//!
//! Deallocation is `Drop`: a buffer is released by whoever allocated it when
//! the last `Arc` goes away. Memory imported from elsewhere participates via
//! [`WrappedDmaBuffer`], whose `Drop` releases nothing.

use std::os::fd::RawFd;
use std::ptr::NonNull;
use std::sync::Arc;

use thiserror::Error;

/// Address of a buffer as seen by the VPU. 0 means the back-end cannot
/// provide one.
pub type PhysicalAddress = u64;

#[derive(Debug, Error)]
pub enum DmaBufferError {
    #[error("could not allocate {size} bytes of DMA memory")]
    Allocation {
        size: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not map DMA buffer into the CPU address space")]
    Mapping(#[source] anyhow::Error),
}

/// CPU caching behavior requested at allocation time.
///
/// Write-combining and uncached mappings are mutually exclusive, which the
/// enum encodes directly.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CachingMode {
    #[default]
    Cached,
    WriteCombine,
    Uncached,
}

/// Access intent of a CPU mapping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MapFlags {
    pub read: bool,
    pub write: bool,
    /// When set, the mapper does not synchronize CPU caches on map/unmap;
    /// the caller brackets accesses with
    /// [`DmaBuffer::begin_sync_session`] / [`DmaBuffer::end_sync_session`].
    pub manual_sync: bool,
}

impl MapFlags {
    pub fn read_write() -> Self {
        Self { read: true, write: true, manual_sync: false }
    }

    pub fn with_manual_sync(mut self) -> Self {
        self.manual_sync = true;
        self
    }
}

/// A physically contiguous memory region.
///
/// Implementations are expected to be internally synchronized for the
/// map/unmap pair; the codec instances themselves are single-threaded.
pub trait DmaBuffer {
    /// Size of the buffer in bytes.
    fn size(&self) -> usize;

    /// Physical address of the buffer, or 0 if the back-end cannot expose
    /// one.
    fn physical_address(&self) -> PhysicalAddress;

    /// File descriptor backing the buffer, or -1 if the back-end cannot
    /// expose one.
    fn fd(&self) -> RawFd {
        -1
    }

    /// Maps the buffer into the CPU address space. The returned pointer
    /// stays valid until [`DmaBuffer::unmap_raw`]. Prefer
    /// [`map_dma_buffer`], which wraps the pointer in a guard.
    fn map_raw(&self, flags: MapFlags) -> Result<NonNull<u8>, DmaBufferError>;

    /// Releases the mapping established by [`DmaBuffer::map_raw`].
    fn unmap_raw(&self);

    /// Starts a manual cache sync session. No-op for coherent back-ends.
    fn begin_sync_session(&self) {}

    /// Ends a manual cache sync session.
    fn end_sync_session(&self) {}
}

/// Allocator back-end for [`DmaBuffer`]s.
pub trait DmaBufferAllocator {
    /// Allocates a buffer of `size` bytes whose physical address is a
    /// multiple of `alignment` (0 and 1 mean unaligned).
    fn allocate(
        &self,
        size: usize,
        alignment: usize,
        caching: CachingMode,
    ) -> Result<Arc<dyn DmaBuffer>, DmaBufferError>;
}

/// CPU mapping of a [`DmaBuffer`], unmapped on drop.
pub struct DmaMapping {
    buffer: Arc<dyn DmaBuffer>,
    ptr: NonNull<u8>,
    len: usize,
}

/// Maps `buffer` and returns a guard for the mapping.
pub fn map_dma_buffer(
    buffer: &Arc<dyn DmaBuffer>,
    flags: MapFlags,
) -> Result<DmaMapping, DmaBufferError> {
    let ptr = buffer.map_raw(flags)?;
    Ok(DmaMapping { buffer: Arc::clone(buffer), ptr, len: buffer.size() })
}

impl DmaMapping {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` points to a live mapping of `len` bytes, kept alive
        // by the `Arc` we hold; `map_raw` contract.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access
        // through this guard.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buffer(&self) -> &Arc<dyn DmaBuffer> {
        &self.buffer
    }
}

impl Drop for DmaMapping {
    fn drop(&mut self) {
        self.buffer.unmap_raw();
    }
}

/// A DMA buffer imported from another component.
///
/// The importer stays responsible for the memory; dropping the wrapper
/// releases nothing. The CPU mapping, if one exists, must outlive the
/// wrapper.
pub struct WrappedDmaBuffer {
    size: usize,
    physical_address: PhysicalAddress,
    fd: RawFd,
    mapping: Option<NonNull<u8>>,
}

impl WrappedDmaBuffer {
    /// Wraps an externally owned region.
    ///
    /// # Safety
    ///
    /// `mapping`, if provided, must point to at least `size` readable and
    /// writable bytes that stay valid for the lifetime of the wrapper.
    pub unsafe fn new(
        size: usize,
        physical_address: PhysicalAddress,
        fd: RawFd,
        mapping: Option<NonNull<u8>>,
    ) -> Self {
        Self { size, physical_address, fd, mapping }
    }
}

impl DmaBuffer for WrappedDmaBuffer {
    fn size(&self) -> usize {
        self.size
    }

    fn physical_address(&self) -> PhysicalAddress {
        self.physical_address
    }

    fn fd(&self) -> RawFd {
        self.fd
    }

    fn map_raw(&self, _flags: MapFlags) -> Result<NonNull<u8>, DmaBufferError> {
        self.mapping.ok_or_else(|| {
            DmaBufferError::Mapping(anyhow::anyhow!("wrapped buffer has no CPU mapping"))
        })
    }

    fn unmap_raw(&self) {}
}
