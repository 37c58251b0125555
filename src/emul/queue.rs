//! Split virtqueue, device side.
//!
//! The driver allocates the descriptor table, available ring and used ring
//! and hands their addresses over through the queue registers. Memory is
//! identity mapped, so the emulated device reads and writes these
//! structures through volatile pointers.
//!
//! Everything that dereferences a driver-supplied address is `unsafe`: the
//! caller vouches that the queue was programmed by a driver whose ring and
//! buffer memory is still alive.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};

use crate::virtio::queue::{VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use crate::virtio::QueueDescription;

/// Longest descriptor chain the emulator follows.
pub const MAX_CHAIN: usize = 4;

/// A single descriptor as laid out in the table.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VirtqDesc {
    pub fn is_write(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqUsedElem {
    id: u32,
    len: u32,
}

/// A descriptor chain: the head index plus the descriptors themselves.
#[derive(Debug, Clone, Copy)]
pub struct DescChain {
    pub head: u16,
    pub descs: [VirtqDesc; MAX_CHAIN],
    pub count: usize,
}

impl DescChain {
    pub fn iter(&self) -> impl Iterator<Item = &VirtqDesc> {
        self.descs[..self.count].iter()
    }

    /// Total capacity of the device-writable descriptors.
    pub fn writable_len(&self) -> usize {
        self.iter().filter(|d| d.is_write()).map(|d| d.len as usize).sum()
    }

    /// Copy out every device-readable buffer in chain order.
    ///
    /// # Safety
    ///
    /// Every descriptor's `addr` must point to `len` readable bytes.
    pub unsafe fn read_all(&self, out: &mut alloc::vec::Vec<u8>) {
        for desc in self.iter().filter(|d| !d.is_write()) {
            let src = unsafe { core::slice::from_raw_parts(desc.addr as *const u8, desc.len as usize) };
            out.extend_from_slice(src);
        }
    }

    /// Fill the device-writable buffers with `data`; returns bytes written.
    ///
    /// # Safety
    ///
    /// Every device-writable descriptor's `addr` must point to `len` bytes
    /// nothing else is accessing.
    pub unsafe fn write_all(&self, data: &[u8]) -> usize {
        let mut written = 0;
        for desc in self.iter().filter(|d| d.is_write()) {
            if written == data.len() {
                break;
            }
            let n = (data.len() - written).min(desc.len as usize);
            unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr().add(written), desc.addr as *mut u8, n)
            };
            written += n;
        }
        written
    }
}

/// Device-side view of one queue, filled in by the driver's register writes.
#[derive(Debug, Clone, Default)]
pub struct DeviceQueue {
    desc: [u32; 2],
    avail: [u32; 2],
    used: [u32; 2],
    /// Queue size selected by the driver.
    pub num: u16,
    last_avail_idx: u16,
    pub ready: bool,
}

fn join(pair: [u32; 2]) -> u64 {
    (pair[0] as u64) | ((pair[1] as u64) << 32)
}

impl DeviceQueue {
    pub const fn new() -> Self {
        Self {
            desc: [0; 2],
            avail: [0; 2],
            used: [0; 2],
            num: 0,
            last_avail_idx: 0,
            ready: false,
        }
    }

    pub fn set_desc_half(&mut self, high: bool, value: u32) {
        self.desc[high as usize] = value;
    }

    pub fn set_avail_half(&mut self, high: bool, value: u32) {
        self.avail[high as usize] = value;
    }

    pub fn set_used_half(&mut self, high: bool, value: u32) {
        self.used[high as usize] = value;
    }

    /// Addresses and size as last programmed by the driver.
    pub fn description(&self) -> QueueDescription {
        QueueDescription {
            desc: join(self.desc),
            avail: join(self.avail),
            used: join(self.used),
            size: self.num,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Ready with every ring address and the size programmed.
    pub fn is_configured(&self) -> bool {
        self.ready
            && self.num != 0
            && join(self.desc) != 0
            && join(self.avail) != 0
            && join(self.used) != 0
    }

    unsafe fn avail_idx(&self) -> u16 {
        let avail = join(self.avail);
        unsafe { read_volatile((avail + 2) as *const u16) }
    }

    /// Check if there are new available descriptors to process.
    ///
    /// # Safety
    ///
    /// The programmed available ring must still be mapped.
    pub unsafe fn has_avail(&self) -> bool {
        if !self.is_configured() {
            return false;
        }
        let idx = unsafe { self.avail_idx() };
        fence(Ordering::Acquire);
        idx != self.last_avail_idx
    }

    /// Get the next available descriptor chain from the driver.
    ///
    /// # Safety
    ///
    /// The programmed descriptor table and available ring, `num` entries
    /// each, must still be mapped.
    pub unsafe fn get_avail_desc(&mut self) -> Option<DescChain> {
        if !unsafe { self.has_avail() } {
            return None;
        }

        // The ring array starts right after the {flags, idx} header.
        let ring_base = (join(self.avail) + 4) as *const u16;
        let slot = (self.last_avail_idx % self.num) as usize;
        let head = unsafe { read_volatile(ring_base.add(slot)) };
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);

        let desc_base = join(self.desc) as *const VirtqDesc;
        let mut chain = DescChain {
            head,
            descs: [VirtqDesc::default(); MAX_CHAIN],
            count: 0,
        };

        let mut idx = head;
        for _ in 0..MAX_CHAIN {
            if idx >= self.num {
                break;
            }
            let desc = unsafe { read_volatile(desc_base.add(idx as usize)) };
            chain.descs[chain.count] = desc;
            chain.count += 1;

            if desc.flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            idx = desc.next;
        }

        Some(chain)
    }

    /// Put a finished chain into the used ring.
    ///
    /// `len` is the number of bytes written to the device-writable buffers.
    ///
    /// # Safety
    ///
    /// The programmed used ring, `num` entries, must still be mapped.
    pub unsafe fn put_used(&mut self, head: u16, len: u32) {
        if !self.is_configured() {
            return;
        }
        let used = join(self.used);

        let idx_ptr = (used + 2) as *mut u16;
        let used_idx = unsafe { read_volatile(idx_ptr) };
        let slot = (used_idx % self.num) as usize;

        let elem_base = (used + 4) as *mut VirtqUsedElem;
        unsafe {
            write_volatile(elem_base.add(slot), VirtqUsedElem { id: head as u32, len });
            fence(Ordering::Release);
            write_volatile(idx_ptr, used_idx.wrapping_add(1));
        }
    }

    /// Used index currently published to the driver.
    ///
    /// # Safety
    ///
    /// The programmed used ring must still be mapped.
    pub unsafe fn used_idx(&self) -> u16 {
        let used = join(self.used);
        if used == 0 {
            return 0;
        }
        unsafe { read_volatile((used + 2) as *const u16) }
    }
}
