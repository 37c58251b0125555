//! Virtio-MMIO register layout (version 2, "modern" devices only) and the
//! register access seam used by endpoints and the bus probe.

use crate::error::{Error, Result};
use super::AccessWidth;

// ── Virtio-MMIO register offsets ────────────────────────────────────
pub const MAGIC_VALUE: usize = 0x000;
pub const VERSION: usize = 0x004;
pub const DEVICE_ID: usize = 0x008;
pub const VENDOR_ID: usize = 0x00C;
pub const DEVICE_FEATURES: usize = 0x010;
pub const DEVICE_FEATURES_SEL: usize = 0x014;
pub const DRIVER_FEATURES: usize = 0x020;
pub const DRIVER_FEATURES_SEL: usize = 0x024;
pub const QUEUE_SEL: usize = 0x030;
pub const QUEUE_NUM_MAX: usize = 0x034;
pub const QUEUE_NUM: usize = 0x038;
pub const QUEUE_READY: usize = 0x044;
pub const QUEUE_NOTIFY: usize = 0x050;
pub const INTERRUPT_STATUS: usize = 0x060;
pub const INTERRUPT_ACK: usize = 0x064;
pub const STATUS: usize = 0x070;
pub const QUEUE_DESC_LOW: usize = 0x080;
pub const QUEUE_DESC_HIGH: usize = 0x084;
pub const QUEUE_AVAIL_LOW: usize = 0x090;
pub const QUEUE_AVAIL_HIGH: usize = 0x094;
pub const QUEUE_USED_LOW: usize = 0x0A0;
pub const QUEUE_USED_HIGH: usize = 0x0A4;
pub const CONFIG_GENERATION: usize = 0x0FC;
pub const CONFIG_SPACE: usize = 0x100;

/// Bytes of device-specific config space reachable through the 8-bit view.
pub const CONFIG_SPACE_SIZE: usize = 0x100;
/// Size of the full register window.
pub const WINDOW_SIZE: usize = CONFIG_SPACE + CONFIG_SPACE_SIZE;

// ── Magic and version ───────────────────────────────────────────────
pub const VIRTIO_MMIO_MAGIC: u32 = 0x74726976; // "virt"
pub const VIRTIO_MMIO_VERSION: u32 = 2;

/// Register access to one mapped virtio-mmio window.
///
/// Offsets are relative to the device base. Control registers are only
/// ever accessed 32 bits wide and aligned; narrower widths are used for
/// the config space views only.
pub trait RegisterIo {
    fn read(&self, offset: usize, width: AccessWidth) -> u32;
    fn write(&self, offset: usize, width: AccessWidth, value: u32);

    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        self.read(offset, AccessWidth::Bits32)
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, AccessWidth::Bits32, value)
    }
}

/// Maps a device register window described by the platform.
pub trait MmioMapper {
    type Regs: RegisterIo;

    fn map(&self, base: u64, size: u64) -> Result<Self::Regs>;
}

/// Two 32-bit registers holding one 64-bit guest-physical address.
#[derive(Debug, Clone, Copy)]
pub struct RegisterPair {
    low: usize,
    high: usize,
}

impl RegisterPair {
    pub const QUEUE_DESC: Self = Self { low: QUEUE_DESC_LOW, high: QUEUE_DESC_HIGH };
    pub const QUEUE_AVAIL: Self = Self { low: QUEUE_AVAIL_LOW, high: QUEUE_AVAIL_HIGH };
    pub const QUEUE_USED: Self = Self { low: QUEUE_USED_LOW, high: QUEUE_USED_HIGH };

    /// Write `value` as two 32-bit halves. The transport requires the low
    /// half to be written before the high half.
    pub fn write<R: RegisterIo + ?Sized>(&self, regs: &R, value: u64) {
        regs.write32(self.low, value as u32);
        regs.write32(self.high, (value >> 32) as u32);
    }
}

/// Volatile accessor for a register window mapped into our address space.
pub struct VolatileRegisters {
    base: usize,
    size: usize,
}

// Safety: the window is device memory; every access is a single volatile
// load or store and the owning endpoint serializes sequences.
unsafe impl Send for VolatileRegisters {}

impl VolatileRegisters {
    /// # Safety
    ///
    /// `base..base + size` must be a mapped virtio-mmio register window that
    /// stays mapped for the lifetime of the returned value.
    pub unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    fn in_bounds(&self, offset: usize, width: AccessWidth) -> bool {
        offset % width.bytes() == 0 && offset + width.bytes() <= self.size
    }
}

impl RegisterIo for VolatileRegisters {
    fn read(&self, offset: usize, width: AccessWidth) -> u32 {
        if !self.in_bounds(offset, width) {
            log::error!("register read outside window: {:#x}", offset);
            return 0;
        }
        let addr = self.base + offset;
        unsafe {
            match width {
                AccessWidth::Bits8 => core::ptr::read_volatile(addr as *const u8) as u32,
                AccessWidth::Bits16 => core::ptr::read_volatile(addr as *const u16) as u32,
                AccessWidth::Bits32 => core::ptr::read_volatile(addr as *const u32),
            }
        }
    }

    fn write(&self, offset: usize, width: AccessWidth, value: u32) {
        if !self.in_bounds(offset, width) {
            log::error!("register write outside window: {:#x}", offset);
            return;
        }
        let addr = self.base + offset;
        unsafe {
            match width {
                AccessWidth::Bits8 => core::ptr::write_volatile(addr as *mut u8, value as u8),
                AccessWidth::Bits16 => core::ptr::write_volatile(addr as *mut u16, value as u16),
                AccessWidth::Bits32 => core::ptr::write_volatile(addr as *mut u32, value),
            }
        }
    }
}

/// Mapper for platforms that identity-map device memory (PA == VA).
pub struct IdentityMapper {
    _private: (),
}

impl IdentityMapper {
    /// # Safety
    ///
    /// Every register window handed to `map` must be identity-mapped as
    /// device memory for the lifetime of the returned registers.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl MmioMapper for IdentityMapper {
    type Regs = VolatileRegisters;

    fn map(&self, base: u64, size: u64) -> Result<VolatileRegisters> {
        if base == 0 || size < WINDOW_SIZE as u64 {
            return Err(Error::MapFailed { base });
        }
        Ok(unsafe { VolatileRegisters::new(base as usize, size as usize) })
    }
}
