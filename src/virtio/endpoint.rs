//! Device endpoint: register-level access to one leased virtio-mmio device.
//!
//! Every operation is a single register read/write sequence. Nothing here
//! interprets status or feature semantics; that is the job of
//! [`crate::virtio::driver`].

use crate::error::{Error, Result};
use super::irq::{IrqLine, IrqSubscription};
use super::queue::QueueNotify;
use super::regs::*;
use super::{AccessWidth, DeviceStatus, DeviceType, QueueDescription};

/// Generation retries before a torn config read is returned as-is.
const MAX_CONFIG_RETRIES: usize = 16;

/// Exclusive register access to one device plus its IRQ subscription.
pub struct DeviceEndpoint<R: RegisterIo> {
    regs: R,
    base: u64,
    irq: IrqSubscription,
}

impl<R: RegisterIo> DeviceEndpoint<R> {
    /// Wrap a mapped register window after checking the magic register.
    pub fn probe(regs: R, base: u64, line: IrqLine) -> Result<Self> {
        let magic = regs.read32(MAGIC_VALUE);
        if magic != VIRTIO_MMIO_MAGIC {
            return Err(Error::ProbeFailed { base, magic });
        }
        Ok(Self {
            regs,
            base,
            irq: IrqSubscription::new(line),
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn version(&self) -> u32 {
        self.regs.read32(VERSION)
    }

    pub fn vendor_id(&self) -> u32 {
        self.regs.read32(VENDOR_ID)
    }

    pub fn device_id(&self) -> u32 {
        self.regs.read32(DEVICE_ID)
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::from_id(self.device_id())
    }

    pub fn get_status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain((self.regs.read32(STATUS) & 0xFF) as u8)
    }

    /// Write the status register and report whether the device kept the value.
    pub fn set_status(&mut self, status: DeviceStatus) -> bool {
        self.regs.write32(STATUS, status.bits() as u32);
        self.get_status() == status
    }

    /// Read 32 feature bits; `selection` 0 is the low word, 1 the high word.
    pub fn get_features(&mut self, selection: u32) -> u32 {
        self.regs.write32(DEVICE_FEATURES_SEL, selection);
        self.regs.read32(DEVICE_FEATURES)
    }

    pub fn set_features(&mut self, selection: u32, features: u32) {
        self.regs.write32(DRIVER_FEATURES_SEL, selection);
        self.regs.write32(DRIVER_FEATURES, features);
    }

    /// Register offset of config byte `offset` in the view matching `width`.
    ///
    /// The byte offset is shifted into an index of the 8/16/32-bit view
    /// (stride 1/2/4), so unaligned low bits are dropped.
    fn config_register(offset: u8, width: AccessWidth) -> usize {
        let index = (offset as usize) >> width.shift();
        CONFIG_SPACE + index * width.bytes()
    }

    pub fn read_config(&self, offset: u8, width: AccessWidth) -> u32 {
        self.regs.read(Self::config_register(offset, width), width) & width.mask()
    }

    pub fn write_config(&mut self, offset: u8, width: AccessWidth, value: u32) {
        self.regs
            .write(Self::config_register(offset, width), width, value & width.mask());
    }

    pub fn get_config_generation(&self) -> u8 {
        (self.regs.read32(CONFIG_GENERATION) & 0xFF) as u8
    }

    /// Run `read` until the config generation is the same before and after.
    pub fn read_config_stable<T>(&self, mut read: impl FnMut(&Self) -> T) -> T {
        let mut attempt = 0;
        loop {
            let before = self.get_config_generation();
            let value = read(self);
            let after = self.get_config_generation();
            attempt += 1;
            if before == after {
                return value;
            }
            if attempt >= MAX_CONFIG_RETRIES {
                log::warn!(
                    "VirtIO @ {:#x}: config generation keeps changing, using last read",
                    self.base
                );
                return value;
            }
            log::debug!("VirtIO @ {:#x}: config changed during read, retrying", self.base);
        }
    }

    pub fn is_queue_ready(&mut self, index: u16) -> bool {
        self.regs.write32(QUEUE_SEL, index as u32);
        self.regs.read32(QUEUE_READY) != 0
    }

    /// Device limit for queue `index`, or 0 if the queue is already ready.
    pub fn get_max_queue_size(&mut self, index: u16) -> u16 {
        self.regs.write32(QUEUE_SEL, index as u32);
        if self.regs.read32(QUEUE_READY) != 0 {
            return 0;
        }
        self.regs.read32(QUEUE_NUM_MAX) as u16
    }

    /// Hand ring addresses and size to the device and activate queue `index`.
    ///
    /// Returns false without touching the ring registers if the queue is
    /// already ready, or if the device does not confirm activation.
    pub fn configure_queue(&mut self, index: u16, desc: QueueDescription) -> bool {
        self.regs.write32(QUEUE_SEL, index as u32);

        if self.regs.read32(QUEUE_READY) != 0 {
            return false;
        }

        self.regs.write32(QUEUE_NUM, desc.size as u32);
        RegisterPair::QUEUE_DESC.write(&self.regs, desc.desc);
        RegisterPair::QUEUE_AVAIL.write(&self.regs, desc.avail);
        RegisterPair::QUEUE_USED.write(&self.regs, desc.used);

        self.regs.write32(QUEUE_READY, 1);
        self.regs.read32(QUEUE_READY) != 0
    }

    /// Read the interrupt status and write the same value back as ack.
    ///
    /// Bits raised between the read and the ack are acknowledged without
    /// being returned; callers that care re-read until zero.
    pub fn read_isr(&mut self) -> u32 {
        let isr = self.regs.read32(INTERRUPT_STATUS);
        self.regs.write32(INTERRUPT_ACK, isr);
        isr
    }

    pub fn notify_buffers_available(&mut self, index: u16) {
        log::trace!("VirtIO @ {:#x}: notify queue {}", self.base, index);
        self.regs.write32(QUEUE_NOTIFY, index as u32);
    }

    pub fn irq(&self) -> &IrqSubscription {
        &self.irq
    }
}

impl<R: RegisterIo> QueueNotify for DeviceEndpoint<R> {
    fn notify(&mut self, queue_index: u16) {
        self.notify_buffers_available(queue_index);
    }
}
