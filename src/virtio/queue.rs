//! Split virtqueue, driver side.
//!
//! The ring triple lives in one DMA region:
//!
//! ```text
//! +0                 descriptor table   N x {addr u64, len u32, flags u16, next u16}
//! +16N               available ring     {flags u16, idx u16, ring[N] u16, used_event u16}
//! +align4(...)       used ring          {flags u16, idx u16, ring[N] {id u32, len u32}, avail_event u16}
//! ```
//!
//! Each descriptor owns a fixed slot of `buffer_size` bytes in a second DMA
//! region. Descriptor bookkeeping (free list, reply links, pending
//! completions) is kept driver-private so that a misbehaving device can
//! only ever hand back an index, never redirect our memory.

use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};

use crate::completion::{completion, Completion, Promise};
use crate::error::{Error, Result};
use super::dma::{DmaAllocator, DmaRegion};
use super::endpoint::DeviceEndpoint;
use super::irq::RingConsumer;
use super::regs::RegisterIo;
use super::QueueDescription;

/// Descriptor flags
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

const DESC_SIZE: usize = 16;
const RING_HEADER: usize = 4;
const USED_ELEM_SIZE: usize = 8;
const RING_ALIGN: usize = 4096;

/// Target of the "buffers available" doorbell for one queue.
pub trait QueueNotify {
    fn notify(&mut self, queue_index: u16);
}

/// Types that can be copied byte-for-byte into and out of ring buffers.
///
/// # Safety
///
/// Implementors must have no padding bytes and every bit pattern must be
/// a valid value (device-written bytes are reinterpreted as `Self`).
pub unsafe trait WireFormat: Copy {}

unsafe impl WireFormat for u8 {}
unsafe impl WireFormat for u16 {}
unsafe impl WireFormat for u32 {}
unsafe impl WireFormat for u64 {}
unsafe impl WireFormat for i16 {}
unsafe impl WireFormat for i32 {}
unsafe impl<T: WireFormat, const N: usize> WireFormat for [T; N] {}

/// Compile-time description of how a queue's buffers flow.
pub trait QueueTraits {
    /// Every buffer is posted device-writable up front (event queues).
    const DEVICE_WRITE_ONLY: bool;
    /// Each transfer carries a reply payload back to a waiting requester.
    const HAS_DATA_PAYLOAD: bool;
}

/// Device-to-driver event queue; buffers are recycled after every read.
#[derive(Debug)]
pub struct EventQueue;

impl QueueTraits for EventQueue {
    const DEVICE_WRITE_ONLY: bool = true;
    const HAS_DATA_PAYLOAD: bool = false;
}

/// Driver-to-device queue whose completions carry no meaning.
#[derive(Debug)]
pub struct StatusQueue;

impl QueueTraits for StatusQueue {
    const DEVICE_WRITE_ONLY: bool = false;
    const HAS_DATA_PAYLOAD: bool = false;
}

/// Request/response queue; each request gets a device-writable reply buffer.
#[derive(Debug)]
pub struct RequestQueue;

impl QueueTraits for RequestQueue {
    const DEVICE_WRITE_ONLY: bool = false;
    const HAS_DATA_PAYLOAD: bool = true;
}

/// Agree on a ring size for queue `index`.
///
/// The result is `min(requested, device_max)` as a power of two. Notify-only
/// queues round up when the device allows it; everything else rounds down.
pub fn negotiate_queue_size<Q: QueueTraits>(
    index: u16,
    requested: u16,
    device_max: u16,
) -> Result<u16> {
    let size = requested.min(device_max);
    if size == 0 {
        return Err(Error::QueueSizeZero { index });
    }
    if size.is_power_of_two() {
        return Ok(size);
    }
    let notify_only = Q::DEVICE_WRITE_ONLY && !Q::HAS_DATA_PAYLOAD;
    if notify_only {
        if let Some(up) = size.checked_next_power_of_two() {
            if up <= device_max {
                return Ok(up);
            }
        }
    }
    Ok(1 << (15 - size.leading_zeros()))
}

/// Byte offsets of the three rings inside the ring region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub avail: usize,
    pub used: usize,
    pub total: usize,
}

impl RingLayout {
    pub const fn new(size: u16) -> Self {
        let n = size as usize;
        let avail = DESC_SIZE * n;
        let avail_end = avail + RING_HEADER + 2 * n + 2;
        let used = (avail_end + 3) & !3;
        let total = used + RING_HEADER + USED_ELEM_SIZE * n + 2;
        Self { avail, used, total }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct UsedElem {
    id: u32,
    len: u32,
}

/// Driver-side split virtqueue carrying `H`-typed buffers.
pub struct Virtqueue<H: WireFormat, Q: QueueTraits> {
    index: u16,
    size: u16,
    buffer_size: usize,
    layout: RingLayout,
    ring: DmaRegion,
    buffers: DmaRegion,
    free: Vec<u16>,
    /// Heads published to the device and not yet returned through the used ring.
    in_flight: Vec<bool>,
    in_flight_count: u16,
    reply_of: Vec<Option<u16>>,
    pending: Vec<Option<Promise<Vec<u8>>>>,
    inbox: VecDeque<H>,
    avail_idx: u16,
    last_seen_used: u16,
    active: bool,
    _traits: PhantomData<Q>,
}

impl<H: WireFormat, Q: QueueTraits> Virtqueue<H, Q> {
    /// Allocate rings and buffers for a queue of exactly `size` entries.
    ///
    /// Device-write-only queues get every descriptor posted immediately.
    pub fn new<A: DmaAllocator + ?Sized>(
        index: u16,
        size: u16,
        buffer_size: usize,
        dma: &A,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::QueueSizeZero { index });
        }
        if buffer_size < size_of::<H>() {
            return Err(Error::BufferTooSmall);
        }

        let layout = RingLayout::new(size);
        let ring = dma.alloc(layout.total, RING_ALIGN)?;
        let buffers = dma.alloc(buffer_size * size as usize, 16)?;

        let mut queue = Self {
            index,
            size,
            buffer_size,
            layout,
            ring,
            buffers,
            free: (0..size).rev().collect(),
            in_flight: vec![false; size as usize],
            in_flight_count: 0,
            reply_of: vec![None; size as usize],
            pending: (0..size).map(|_| None).collect(),
            inbox: VecDeque::new(),
            avail_idx: 0,
            last_seen_used: 0,
            active: false,
            _traits: PhantomData,
        };

        if Q::DEVICE_WRITE_ONLY {
            queue.repost_free();
        }

        Ok(queue)
    }

    /// Negotiate the size with the device, allocate, and activate queue `index`.
    pub fn setup<R, A>(
        endpoint: &mut DeviceEndpoint<R>,
        index: u16,
        requested: u16,
        buffer_size: usize,
        dma: &A,
    ) -> Result<Self>
    where
        R: RegisterIo,
        A: DmaAllocator + ?Sized,
    {
        if endpoint.is_queue_ready(index) {
            return Err(Error::QueueAlreadyReady { index });
        }
        let device_max = endpoint.get_max_queue_size(index);
        let size = negotiate_queue_size::<Q>(index, requested, device_max)?;
        let mut queue = Self::new(index, size, buffer_size, dma)?;

        if !queue.configure_queue(endpoint) {
            log::error!(
                "VirtIO @ {:#x}: queue {} did not become ready",
                endpoint.base(),
                index
            );
            return Err(Error::QueueNotActivated { index });
        }
        if Q::DEVICE_WRITE_ONLY {
            queue.kick(endpoint)?;
        }
        log::debug!(
            "VirtIO @ {:#x}: queue {} ready, {} entries",
            endpoint.base(),
            index,
            size
        );
        Ok(queue)
    }

    /// Hand this queue's rings to the device; on success the queue is active.
    pub fn configure_queue<R: RegisterIo>(&mut self, endpoint: &mut DeviceEndpoint<R>) -> bool {
        let ok = endpoint.configure_queue(self.index, self.description());
        self.active |= ok;
        ok
    }

    pub fn description(&self) -> QueueDescription {
        QueueDescription {
            desc: self.ring.phys(),
            avail: self.ring.phys_at(self.layout.avail),
            used: self.ring.phys_at(self.layout.used),
            size: self.size,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Mark the queue active after it was configured by other means.
    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Heads the device currently owns.
    pub fn in_flight(&self) -> u16 {
        self.in_flight_count
    }

    pub fn free_descriptors(&self) -> usize {
        self.free.len()
    }

    /// Next available index this driver will publish.
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    pub fn last_seen_used(&self) -> u16 {
        self.last_seen_used
    }

    /// Used index as currently published by the device.
    pub fn device_used_idx(&self) -> u16 {
        unsafe { read_volatile(self.used_idx_ptr()) }
    }

    // ── Ring memory ─────────────────────────────────────────────────

    fn desc_ptr(&self, id: u16) -> *mut Descriptor {
        unsafe { (self.ring.as_ptr() as *mut Descriptor).add(id as usize) }
    }

    fn avail_idx_ptr(&self) -> *mut u16 {
        unsafe { self.ring.as_ptr().add(self.layout.avail + 2) as *mut u16 }
    }

    fn avail_slot_ptr(&self, slot: u16) -> *mut u16 {
        unsafe {
            (self.ring.as_ptr().add(self.layout.avail + RING_HEADER) as *mut u16).add(slot as usize)
        }
    }

    fn used_idx_ptr(&self) -> *const u16 {
        unsafe { self.ring.as_ptr().add(self.layout.used + 2) as *const u16 }
    }

    fn used_elem_ptr(&self, slot: u16) -> *const UsedElem {
        unsafe {
            (self.ring.as_ptr().add(self.layout.used + RING_HEADER) as *const UsedElem)
                .add(slot as usize)
        }
    }

    fn buffer_ptr(&self, id: u16) -> *mut u8 {
        unsafe { self.buffers.as_ptr().add(id as usize * self.buffer_size) }
    }

    fn buffer_phys(&self, id: u16) -> u64 {
        self.buffers.phys_at(id as usize * self.buffer_size)
    }

    fn write_desc(&mut self, id: u16, len: u32, flags: u16, next: u16) {
        let desc = Descriptor {
            addr: self.buffer_phys(id),
            len,
            flags,
            next,
        };
        unsafe { write_volatile(self.desc_ptr(id), desc) };
    }

    /// Put `head` in the next available slot and advance the index.
    ///
    /// The slot write is release-fenced before the index store so the
    /// device never observes an index whose slot is not yet filled.
    fn publish(&mut self, head: u16) {
        if !core::mem::replace(&mut self.in_flight[head as usize], true) {
            self.in_flight_count += 1;
        }
        let slot = self.avail_idx % self.size;
        unsafe { write_volatile(self.avail_slot_ptr(slot), head) };
        fence(Ordering::Release);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        unsafe { write_volatile(self.avail_idx_ptr(), self.avail_idx) };
    }

    fn post_device_writable(&mut self, id: u16) {
        self.write_desc(id, self.buffer_size as u32, VIRTQ_DESC_F_WRITE, 0);
        self.publish(id);
    }

    /// Hand every free buffer of a write-only queue back to the device.
    fn repost_free(&mut self) {
        for id in core::mem::take(&mut self.free) {
            self.post_device_writable(id);
        }
    }

    /// Ring the doorbell. The index store is fully fenced first.
    pub fn kick<N: QueueNotify + ?Sized>(&mut self, notifier: &mut N) -> Result<()> {
        if !self.active {
            log::error!("notify on inactive queue {}", self.index);
            return Err(Error::QueueInactive);
        }
        fence(Ordering::SeqCst);
        notifier.notify(self.index);
        Ok(())
    }

    // ── Producer path ───────────────────────────────────────────────

    fn copy_in(&mut self, id: u16, data: &H) {
        let bytes = unsafe {
            core::slice::from_raw_parts(data as *const H as *const u8, size_of::<H>())
        };
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.buffer_ptr(id), bytes.len())
        };
    }

    /// Publish `data` as one device-readable buffer and notify the device.
    ///
    /// Fails with `QueueFull` while every descriptor is in flight.
    pub fn write_data<N: QueueNotify + ?Sized>(&mut self, data: &H, notifier: &mut N) -> Result<()> {
        if !self.active {
            return Err(Error::QueueInactive);
        }
        let id = self.free.pop().ok_or(Error::QueueFull)?;
        self.copy_in(id, data);
        self.write_desc(id, size_of::<H>() as u32, 0, 0);
        self.publish(id);
        self.kick(notifier)
    }

    /// Publish a request followed by a `reply_len` byte device-writable
    /// reply buffer. The completion resolves to the bytes the device wrote.
    pub fn request<N: QueueNotify + ?Sized>(
        &mut self,
        data: &H,
        reply_len: usize,
        notifier: &mut N,
    ) -> Result<Completion<Vec<u8>>> {
        if !self.active {
            return Err(Error::QueueInactive);
        }
        if reply_len > self.buffer_size {
            return Err(Error::BufferTooSmall);
        }
        if self.free.len() < 2 {
            return Err(Error::QueueFull);
        }
        let (head, reply) = match (self.free.pop(), self.free.pop()) {
            (Some(head), Some(reply)) => (head, reply),
            _ => return Err(Error::QueueFull),
        };

        self.copy_in(head, data);
        self.write_desc(reply, reply_len as u32, VIRTQ_DESC_F_WRITE, 0);
        self.write_desc(head, size_of::<H>() as u32, VIRTQ_DESC_F_NEXT, reply);

        let (promise, done) = completion();
        self.reply_of[head as usize] = Some(reply);
        self.pending[head as usize] = Some(promise);

        self.publish(head);
        self.kick(notifier)?;
        Ok(done)
    }

    // ── Consumer path ───────────────────────────────────────────────

    /// True if the device published used entries we have not consumed.
    pub fn has_used_buffers(&self) -> bool {
        let used = unsafe { read_volatile(self.used_idx_ptr()) };
        fence(Ordering::Acquire);
        used != self.last_seen_used
    }

    /// Take the oldest unseen used entry as (descriptor id, written length).
    ///
    /// Only heads currently in flight are accepted. Anything else (an id out
    /// of range, a reply descriptor, a head returned twice) is skipped, and
    /// entries published while nothing is in flight are dropped wholesale.
    fn next_used(&mut self) -> Option<(u16, u32)> {
        while self.has_used_buffers() {
            if self.in_flight_count == 0 {
                let used = self.device_used_idx();
                log::error!(
                    "queue {}: device published {} used entries with nothing in flight",
                    self.index,
                    used.wrapping_sub(self.last_seen_used)
                );
                self.last_seen_used = used;
                return None;
            }

            let slot = self.last_seen_used % self.size;
            let elem = unsafe { read_volatile(self.used_elem_ptr(slot)) };
            self.last_seen_used = self.last_seen_used.wrapping_add(1);

            match self.in_flight.get_mut(elem.id as usize) {
                Some(owned) if *owned => {
                    *owned = false;
                    self.in_flight_count -= 1;
                    return Some((elem.id as u16, elem.len));
                }
                _ => log::error!(
                    "queue {}: device returned descriptor {} which is not in flight",
                    self.index,
                    elem.id
                ),
            }
        }
        None
    }

    fn copy_out(&self, id: u16, len: usize) -> Vec<u8> {
        let len = len.min(self.buffer_size);
        let mut data = vec![0u8; len];
        unsafe { core::ptr::copy_nonoverlapping(self.buffer_ptr(id), data.as_mut_ptr(), len) };
        data
    }

    /// Return a finished descriptor (and its reply link) to the free list.
    ///
    /// Write-only queues repost their free buffers once the used ring reads
    /// empty, so a buffer is never back with the device while stale used
    /// entries naming it may still be pending.
    fn recycle(&mut self, id: u16) {
        if Q::DEVICE_WRITE_ONLY {
            self.free.push(id);
            return;
        }
        if let Some(reply) = self.reply_of[id as usize].take() {
            self.free.push(reply);
        }
        self.pending[id as usize] = None;
        self.free.push(id);
    }

    /// Read the next device-written buffer of a write-only queue.
    ///
    /// Consumed buffers go back to the device once the used ring has been
    /// drained. Entries shorter than `H` are dropped with a warning.
    pub fn read_data(&mut self) -> Option<H> {
        let mut value = None;
        while let Some((id, len)) = self.next_used() {
            if (len as usize) < size_of::<H>() {
                log::warn!("queue {}: short buffer ({} bytes)", self.index, len);
            } else {
                value = Some(unsafe { core::ptr::read_unaligned(self.buffer_ptr(id) as *const H) });
            }
            self.recycle(id);
            if value.is_some() {
                break;
            }
        }
        self.repost_if_drained();
        value
    }

    fn repost_if_drained(&mut self) {
        if Q::DEVICE_WRITE_ONLY && !self.has_used_buffers() {
            self.repost_free();
        }
    }

    /// Drain every used entry without delivering payloads.
    ///
    /// Pending requests drained this way complete as cancelled.
    pub fn ack_all_transfers(&mut self) -> usize {
        let mut count = 0;
        while let Some((id, _)) = self.next_used() {
            self.recycle(id);
            count += 1;
        }
        self.repost_if_drained();
        count
    }

    fn complete_requests(&mut self) -> usize {
        let mut count = 0;
        while let Some((head, len)) = self.next_used() {
            let reply = self.copy_out_reply(head, len as usize);
            if let Some(promise) = self.pending[head as usize].take() {
                promise.fulfill(reply);
            } else {
                log::warn!("queue {}: used entry {} has no requester", self.index, head);
            }
            self.recycle(head);
            count += 1;
        }
        count
    }

    fn copy_out_reply(&self, head: u16, len: usize) -> Vec<u8> {
        match self.reply_of[head as usize] {
            Some(reply) => self.copy_out(reply, len),
            None => Vec::new(),
        }
    }

    /// Next event collected by interrupt processing.
    pub fn pop_event(&mut self) -> Option<H> {
        self.inbox.pop_front()
    }

    pub fn pending_events(&self) -> usize {
        self.inbox.len()
    }
}

impl<H: WireFormat, Q: QueueTraits> RingConsumer for Virtqueue<H, Q> {
    fn process_used(&mut self) -> usize {
        if Q::DEVICE_WRITE_ONLY {
            let mut count = 0;
            while let Some(event) = self.read_data() {
                self.inbox.push_back(event);
                count += 1;
            }
            count
        } else if Q::HAS_DATA_PAYLOAD {
            self.complete_requests()
        } else {
            self.ack_all_transfers()
        }
    }
}
