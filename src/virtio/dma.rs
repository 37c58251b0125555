//! DMA memory for rings and transfer buffers.
//!
//! The device reads and writes these regions by guest-physical address,
//! so each region carries both its local pointer and the address handed
//! to the device.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;

use crate::error::{Error, Result};

/// A zeroed, physically contiguous memory region shared with a device.
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: u64,
    layout: Layout,
    release: unsafe fn(NonNull<u8>, Layout),
}

// Safety: the region is exclusively owned; the device side accesses it
// only through the ring protocol.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// # Safety
    ///
    /// `virt` must point to `layout.size()` zeroed bytes that the device can
    /// reach at `phys`, and `release` must be the matching deallocator.
    pub unsafe fn from_raw_parts(
        virt: NonNull<u8>,
        phys: u64,
        layout: Layout,
        release: unsafe fn(NonNull<u8>, Layout),
    ) -> Self {
        Self { virt, phys, layout, release }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Device-visible address of byte `offset`.
    pub fn phys_at(&self, offset: usize) -> u64 {
        self.phys + offset as u64
    }

    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        unsafe { (self.release)(self.virt, self.layout) }
    }
}

/// Source of DMA memory.
pub trait DmaAllocator {
    fn alloc(&self, size: usize, align: usize) -> Result<DmaRegion>;
}

/// Heap-backed DMA memory for identity-mapped platforms (PA == VA).
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapDma;

unsafe fn heap_release(ptr: NonNull<u8>, layout: Layout) {
    dealloc(ptr.as_ptr(), layout)
}

impl DmaAllocator for HeapDma {
    fn alloc(&self, size: usize, align: usize) -> Result<DmaRegion> {
        let layout = Layout::from_size_align(size.max(1), align).map_err(|_| Error::OutOfMemory)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let virt = NonNull::new(ptr).ok_or(Error::OutOfMemory)?;
        Ok(unsafe { DmaRegion::from_raw_parts(virt, ptr as u64, layout, heap_release) })
    }
}
