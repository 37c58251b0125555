//! Virtio-MMIO register model (version 2, "modern" devices only).
//!
//! Implements the device side of the virtio-mmio register interface and
//! wraps a [`DeviceModel`] backend that supplies the device type, features,
//! config space and queue processing.

use alloc::vec::Vec;

use super::queue::DeviceQueue;
use super::{DeviceModel, MmioDevice};
use crate::virtio::irq::InterruptStatus;
use crate::virtio::regs::*;
use crate::virtio::{AccessWidth, DeviceStatus, QueueDescription};

const VIRTIO_VENDOR_ID: u32 = 0x554D4551; // "QEMU"

/// Emulated virtio-mmio device wrapping a backend model.
pub struct EmulatedDevice<D: DeviceModel> {
    base: u64,
    irq: u32,
    model: D,
    queues: Vec<DeviceQueue>,
    magic: u32,
    queue_sel: u32,
    status: u8,
    interrupt_status: u32,
    device_features_sel: u32,
    driver_features_sel: u32,
    driver_features: u64,
    config_generation: u32,
    /// Writes to QueueNum and the ring address registers.
    ring_writes: u32,
    notifications: u32,
}

impl<D: DeviceModel> EmulatedDevice<D> {
    pub fn new(base: u64, irq: u32, model: D) -> Self {
        let queues = (0..model.num_queues()).map(|_| DeviceQueue::new()).collect();
        Self {
            base,
            irq,
            model,
            queues,
            magic: VIRTIO_MMIO_MAGIC,
            queue_sel: 0,
            status: 0,
            interrupt_status: 0,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            config_generation: 0,
            ring_writes: 0,
            notifications: 0,
        }
    }

    /// Answer the magic register with `magic` (for non-virtio windows).
    pub fn with_magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    pub fn model(&self) -> &D {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut D {
        &mut self.model
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.status)
    }

    pub fn driver_features(&self) -> u64 {
        self.driver_features
    }

    pub fn interrupt_status(&self) -> u32 {
        self.interrupt_status
    }

    pub fn ring_writes(&self) -> u32 {
        self.ring_writes
    }

    pub fn notifications(&self) -> u32 {
        self.notifications
    }

    pub fn config_generation(&self) -> u32 {
        self.config_generation
    }

    pub fn queue(&self, index: usize) -> Option<&DeviceQueue> {
        self.queues.get(index)
    }

    pub fn queue_mut(&mut self, index: usize) -> Option<&mut DeviceQueue> {
        self.queues.get_mut(index)
    }

    pub fn queue_description(&self, index: usize) -> Option<QueueDescription> {
        self.queues.get(index).map(DeviceQueue::description)
    }

    /// Raise interrupt status bits as the device would.
    pub fn raise(&mut self, bits: InterruptStatus) {
        self.interrupt_status |= bits.bits();
    }

    /// Raise a raw status value, including bits without meaning.
    pub fn raise_raw(&mut self, status: u32) {
        self.interrupt_status |= status;
    }

    /// Config space changed behind the driver's back.
    pub fn raise_config_change(&mut self) {
        self.config_generation = self.config_generation.wrapping_add(1);
        self.raise(InterruptStatus::CONFIG_CHANGE);
    }

    pub(crate) fn signal_used(&mut self) {
        self.raise(InterruptStatus::USED_RING_UPDATE);
    }

    fn current_queue(&mut self) -> Option<&mut DeviceQueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    fn reset(&mut self) {
        self.status = 0;
        self.interrupt_status = 0;
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.driver_features = 0;
        self.queue_sel = 0;
        for q in &mut self.queues {
            q.reset();
        }
        self.model.reset();
    }

    fn write_status(&mut self, value: u8) {
        if value == 0 {
            self.reset();
            return;
        }
        let mut status = DeviceStatus::from_bits_retain(value);
        let newly = status - DeviceStatus::from_bits_retain(self.status);
        if newly.contains(DeviceStatus::FEATURES_OK)
            && (self.driver_features & !self.model.device_features() != 0
                || !self.model.accepts_features(self.driver_features))
        {
            log::debug!(
                "emul @ {:#x}: refusing features {:#x}",
                self.base,
                self.driver_features
            );
            status.remove(DeviceStatus::FEATURES_OK);
        }
        self.status = status.bits();
    }

    fn write_queue_ready(&mut self, value: u32) {
        let max = self.model.max_queue_size();
        if let Some(q) = self.current_queue() {
            if value == 0 {
                q.ready = false;
            } else {
                q.ready = q.num != 0 && q.num <= max && q.num.is_power_of_two();
            }
        }
    }

    fn notify(&mut self, index: u16) {
        self.notifications += 1;
        let Some(queue) = self.queues.get_mut(index as usize) else {
            return;
        };
        if !queue.ready {
            return;
        }
        if self.model.queue_notify(index, queue) {
            self.signal_used();
        }
    }
}

impl<D: DeviceModel> MmioDevice for EmulatedDevice<D> {
    fn read(&mut self, offset: usize, width: AccessWidth) -> u32 {
        // Config space reads can be 1/2/4 bytes
        if offset >= CONFIG_SPACE {
            return self.model.config_read(offset - CONFIG_SPACE, width);
        }

        // All other registers are 32-bit
        if width != AccessWidth::Bits32 {
            return 0;
        }

        match offset {
            MAGIC_VALUE => self.magic,
            VERSION => VIRTIO_MMIO_VERSION,
            DEVICE_ID => self.model.device_id(),
            VENDOR_ID => VIRTIO_VENDOR_ID,
            DEVICE_FEATURES => {
                let features = self.model.device_features();
                if self.device_features_sel == 0 {
                    features as u32
                } else {
                    (features >> 32) as u32
                }
            }
            QUEUE_NUM_MAX => {
                let max = self.model.max_queue_size() as u32;
                self.current_queue().map_or(0, |_| max)
            }
            QUEUE_READY => self.current_queue().map_or(0, |q| q.ready as u32),
            INTERRUPT_STATUS => self.interrupt_status,
            STATUS => self.status as u32,
            CONFIG_GENERATION => self.config_generation,
            _ => 0,
        }
    }

    fn write(&mut self, offset: usize, width: AccessWidth, value: u32) {
        if offset >= CONFIG_SPACE {
            self.model.config_write(offset - CONFIG_SPACE, width, value);
            return;
        }

        if width != AccessWidth::Bits32 {
            return;
        }

        match offset {
            DEVICE_FEATURES_SEL => self.device_features_sel = value,
            DRIVER_FEATURES => {
                if self.driver_features_sel == 0 {
                    self.driver_features =
                        (self.driver_features & 0xFFFF_FFFF_0000_0000) | (value as u64);
                } else {
                    self.driver_features =
                        (self.driver_features & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
                }
            }
            DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            QUEUE_SEL => self.queue_sel = value,
            QUEUE_NUM => {
                self.ring_writes += 1;
                if let Some(q) = self.current_queue() {
                    q.num = value as u16;
                }
            }
            QUEUE_READY => self.write_queue_ready(value),
            QUEUE_NOTIFY => self.notify(value as u16),
            INTERRUPT_ACK => self.interrupt_status &= !value,
            STATUS => self.write_status(value as u8),
            QUEUE_DESC_LOW | QUEUE_DESC_HIGH => {
                self.ring_writes += 1;
                if let Some(q) = self.current_queue() {
                    q.set_desc_half(offset == QUEUE_DESC_HIGH, value);
                }
            }
            QUEUE_AVAIL_LOW | QUEUE_AVAIL_HIGH => {
                self.ring_writes += 1;
                if let Some(q) = self.current_queue() {
                    q.set_avail_half(offset == QUEUE_AVAIL_HIGH, value);
                }
            }
            QUEUE_USED_LOW | QUEUE_USED_HIGH => {
                self.ring_writes += 1;
                if let Some(q) = self.current_queue() {
                    q.set_used_half(offset == QUEUE_USED_HIGH, value);
                }
            }
            _ => {}
        }
    }

    fn base_address(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        WINDOW_SIZE as u64
    }

    fn pending_irq(&self) -> Option<u32> {
        (self.interrupt_status != 0).then_some(self.irq)
    }
}
