//! Emulated virtio-mmio devices.
//!
//! Gives the transport something to talk to without hardware: an
//! [`EmulatedBus`] maps register windows to registered devices, each
//! [`EmulatedDevice`] implements the register file, and a [`DeviceModel`]
//! backend supplies device-specific behaviour.

pub mod loopback;
pub mod mmio;
pub mod queue;

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::virtio::regs::{MmioMapper, RegisterIo};
use crate::virtio::AccessWidth;

pub use loopback::LoopbackModel;
pub use mmio::EmulatedDevice;
pub use queue::DeviceQueue;

/// Device backend behind an emulated register file.
pub trait DeviceModel: Send {
    /// Virtio device ID (e.g., 16 for GPU)
    fn device_id(&self) -> u32;

    /// Device feature bits (low 32 bits selected by feature_sel=0,
    /// high 32 bits by feature_sel=1)
    fn device_features(&self) -> u64;

    /// Whether the device accepts `driver_features` when FEATURES_OK is set.
    /// Only called for subsets of `device_features()`.
    fn accepts_features(&self, _driver_features: u64) -> bool {
        true
    }

    /// Read from device-specific config space.
    /// `offset` is relative to the config space base (MMIO offset 0x100).
    fn config_read(&self, offset: usize, width: AccessWidth) -> u32;

    /// Write to device-specific config space.
    fn config_write(&mut self, offset: usize, width: AccessWidth, value: u32);

    /// Handle a doorbell write on a ready queue. Returns true if entries
    /// were added to the used ring.
    fn queue_notify(&mut self, queue_idx: u16, queue: &mut DeviceQueue) -> bool;

    fn num_queues(&self) -> u16;

    fn max_queue_size(&self) -> u16 {
        256
    }

    /// Called when the driver writes 0 to the status register.
    fn reset(&mut self) {}
}

/// Register-level access to one emulated window.
///
/// Offsets are relative to `base_address()`.
pub trait MmioDevice: Send {
    fn read(&mut self, offset: usize, width: AccessWidth) -> u32;
    fn write(&mut self, offset: usize, width: AccessWidth, value: u32);
    fn base_address(&self) -> u64;
    fn size(&self) -> u64;

    /// Interrupt number if the device currently asserts its line.
    fn pending_irq(&self) -> Option<u32> {
        None
    }
}

/// A device behind a lock, shared between the bus and test code.
pub trait SharedWindow: Send + Sync {
    fn read(&self, offset: usize, width: AccessWidth) -> u32;
    fn write(&self, offset: usize, width: AccessWidth, value: u32);
    fn base_address(&self) -> u64;
    fn size(&self) -> u64;
    fn pending_irq(&self) -> Option<u32>;
}

impl<D: MmioDevice> SharedWindow for Mutex<D> {
    fn read(&self, offset: usize, width: AccessWidth) -> u32 {
        self.lock().read(offset, width)
    }

    fn write(&self, offset: usize, width: AccessWidth, value: u32) {
        self.lock().write(offset, width, value)
    }

    fn base_address(&self) -> u64 {
        self.lock().base_address()
    }

    fn size(&self) -> u64 {
        self.lock().size()
    }

    fn pending_irq(&self) -> Option<u32> {
        self.lock().pending_irq()
    }
}

pub type SharedDevice = Arc<dyn SharedWindow>;

/// Wrap a device for registration on a bus while keeping a typed handle.
pub fn shared<D: MmioDevice>(device: D) -> Arc<Mutex<D>> {
    Arc::new(Mutex::new(device))
}

/// Routes mapped windows to registered devices by base address.
#[derive(Default)]
pub struct EmulatedBus {
    devices: Vec<SharedDevice>,
}

impl EmulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, device: SharedDevice) {
        self.devices.push(device);
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Interrupt numbers of every device asserting its line.
    pub fn pending_irqs(&self) -> Vec<u32> {
        self.devices
            .iter()
            .filter_map(|d| d.pending_irq())
            .collect()
    }

    fn find(&self, base: u64) -> Option<&SharedDevice> {
        self.devices.iter().find(|d| {
            let start = d.base_address();
            base >= start && base < start + d.size()
        })
    }
}

impl MmioMapper for EmulatedBus {
    type Regs = BusWindow;

    fn map(&self, base: u64, size: u64) -> Result<BusWindow> {
        let device = self.find(base).ok_or(Error::MapFailed { base })?;
        if device.base_address() != base || size > device.size() {
            return Err(Error::MapFailed { base });
        }
        Ok(BusWindow { device: device.clone() })
    }
}

/// A mapped window onto an emulated device.
pub struct BusWindow {
    device: SharedDevice,
}

impl RegisterIo for BusWindow {
    fn read(&self, offset: usize, width: AccessWidth) -> u32 {
        self.device.read(offset, width)
    }

    fn write(&self, offset: usize, width: AccessWidth, value: u32) {
        self.device.write(offset, width, value)
    }
}
