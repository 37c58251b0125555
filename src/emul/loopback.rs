//! Loopback device backend.
//!
//! Queue 0 is a device-to-driver event queue fed through
//! [`EmulatedDevice::inject_event`]. Queue 1 answers every request chain:
//! chains with a device-writable part get the request bytes echoed back,
//! chains without one are consumed and recorded.

use alloc::vec;
use alloc::vec::Vec;

use super::mmio::EmulatedDevice;
use super::queue::DeviceQueue;
use super::DeviceModel;
use crate::virtio::regs::CONFIG_SPACE_SIZE;
use crate::virtio::{AccessWidth, DeviceType, VIRTIO_F_VERSION_1};

pub const EVENT_QUEUE: u16 = 0;
pub const REQUEST_QUEUE: u16 = 1;

pub struct LoopbackModel {
    device_id: u32,
    features: u64,
    required_features: u64,
    max_queue_size: u16,
    config: Vec<u8>,
    sunk: Vec<Vec<u8>>,
    echoed: usize,
}

impl LoopbackModel {
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            device_id: device_type.id(),
            features: VIRTIO_F_VERSION_1,
            required_features: 0,
            max_queue_size: 64,
            config: vec![0; CONFIG_SPACE_SIZE],
            sunk: Vec::new(),
            echoed: 0,
        }
    }

    pub fn with_features(mut self, features: u64) -> Self {
        self.features = features;
        self
    }

    /// Refuse FEATURES_OK unless the driver accepts every bit in `features`.
    pub fn with_required_features(mut self, features: u64) -> Self {
        self.required_features = features;
        self
    }

    pub fn with_max_queue_size(mut self, size: u16) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Preload config space starting at `offset`.
    pub fn with_config(mut self, offset: usize, bytes: &[u8]) -> Self {
        let end = (offset + bytes.len()).min(self.config.len());
        if offset < end {
            self.config[offset..end].copy_from_slice(&bytes[..end - offset]);
        }
        self
    }

    pub fn config_bytes(&self) -> &[u8] {
        &self.config
    }

    /// Payloads of request chains that carried no reply buffer.
    pub fn sunk(&self) -> &[Vec<u8>] {
        &self.sunk
    }

    pub fn echoed(&self) -> usize {
        self.echoed
    }
}

impl DeviceModel for LoopbackModel {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn device_features(&self) -> u64 {
        self.features
    }

    fn accepts_features(&self, driver_features: u64) -> bool {
        self.required_features & !driver_features == 0
    }

    fn config_read(&self, offset: usize, width: AccessWidth) -> u32 {
        let Some(bytes) = self.config.get(offset..offset + width.bytes()) else {
            return 0;
        };
        bytes
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32)
    }

    fn config_write(&mut self, offset: usize, width: AccessWidth, value: u32) {
        let Some(bytes) = self.config.get_mut(offset..offset + width.bytes()) else {
            return;
        };
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (value >> (8 * i)) as u8;
        }
    }

    fn queue_notify(&mut self, queue_idx: u16, queue: &mut DeviceQueue) -> bool {
        if queue_idx != REQUEST_QUEUE {
            return false;
        }

        let mut processed = false;
        // Safety: the queue was programmed through the register file by a
        // driver that keeps its rings and buffers alive while it is ready.
        while let Some(chain) = unsafe { queue.get_avail_desc() } {
            let mut request = Vec::new();
            unsafe { chain.read_all(&mut request) };
            if chain.writable_len() > 0 {
                let written = unsafe { chain.write_all(&request) };
                unsafe { queue.put_used(chain.head, written as u32) };
                self.echoed += 1;
            } else {
                unsafe { queue.put_used(chain.head, 0) };
                self.sunk.push(request);
            }
            processed = true;
        }
        processed
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn max_queue_size(&self) -> u16 {
        self.max_queue_size
    }
}

impl EmulatedDevice<LoopbackModel> {
    /// Deliver one event into the next buffer the driver posted on queue 0.
    ///
    /// Returns false if no buffer is available. A buffer too small for the
    /// event is returned empty so the driver can reuse it.
    pub fn inject_event(&mut self, event: &[u8]) -> bool {
        let Some(queue) = self.queue_mut(EVENT_QUEUE as usize) else {
            return false;
        };
        // Safety: as in `queue_notify`, the addresses come from a live driver.
        let Some(chain) = (unsafe { queue.get_avail_desc() }) else {
            return false;
        };

        let delivered = if chain.writable_len() < event.len() {
            unsafe { queue.put_used(chain.head, 0) };
            false
        } else {
            let written = unsafe { chain.write_all(event) };
            unsafe { queue.put_used(chain.head, written as u32) };
            true
        };

        self.signal_used();
        delivered
    }
}
