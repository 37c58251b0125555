//! VirtIO-MMIO driver-side transport.
//!
//! `regs` holds the wire-exact register layout, `endpoint` the primitive
//! register sequences for one leased device, `queue` the split virtqueue,
//! `irq` the interrupt relay and `driver` the status/feature bring-up that
//! concrete device drivers run on top of an endpoint.

pub mod dma;
pub mod driver;
pub mod endpoint;
pub mod irq;
pub mod queue;
pub mod regs;

use core::fmt;

use bitflags::bitflags;

/// Feature bit every modern (non-legacy) device must offer.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// VirtIO device type, as read from the DeviceID register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// ID 0: no device behind this slot
    Invalid,
    Nic,
    Block,
    Console,
    Entropy,
    Gpu,
    Input,
    Other(u32),
}

impl DeviceType {
    pub fn from_id(id: u32) -> Self {
        match id {
            0 => Self::Invalid,
            1 => Self::Nic,
            2 => Self::Block,
            3 => Self::Console,
            4 => Self::Entropy,
            16 => Self::Gpu,
            18 => Self::Input,
            other => Self::Other(other),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            Self::Invalid => 0,
            Self::Nic => 1,
            Self::Block => 2,
            Self::Console => 3,
            Self::Entropy => 4,
            Self::Gpu => 16,
            Self::Input => 18,
            Self::Other(id) => id,
        }
    }

    /// Parse a policy name (`gpu`, `input`, ...) or a decimal device ID.
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name {
            "invalid" => Self::Invalid,
            "nic" => Self::Nic,
            "block" => Self::Block,
            "console" => Self::Console,
            "entropy" => Self::Entropy,
            "gpu" => Self::Gpu,
            "input" => Self::Input,
            other => Self::from_id(other.parse::<u32>().ok()?),
        };
        Some(ty)
    }

    pub fn is_valid(self) -> bool {
        self != Self::Invalid
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid"),
            Self::Nic => write!(f, "nic"),
            Self::Block => write!(f, "block"),
            Self::Console => write!(f, "console"),
            Self::Entropy => write!(f, "entropy"),
            Self::Gpu => write!(f, "gpu"),
            Self::Input => write!(f, "input"),
            Self::Other(id) => write!(f, "type-{}", id),
        }
    }
}

bitflags! {
    /// Device status register bits. An empty set is RESET.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 1 << 0;
        const DRIVER = 1 << 1;
        const DRIVER_OK = 1 << 2;
        const FEATURES_OK = 1 << 3;
        const DEVICE_NEEDS_RESET = 1 << 6;
        const FAILED = 1 << 7;
    }
}

impl DeviceStatus {
    pub const RESET: Self = Self::empty();

    /// Bit that must already be set before `step` may be added.
    pub fn prerequisite(step: Self) -> Option<Self> {
        if step == Self::DRIVER {
            Some(Self::ACKNOWLEDGE)
        } else if step == Self::FEATURES_OK {
            Some(Self::DRIVER)
        } else if step == Self::DRIVER_OK {
            Some(Self::FEATURES_OK)
        } else {
            None
        }
    }
}

/// Guest-physical ring addresses and ring size handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDescription {
    pub desc: u64,
    pub avail: u64,
    pub used: u64,
    pub size: u16,
}

/// Config space access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Bits8,
    Bits16,
    Bits32,
}

impl AccessWidth {
    /// Access size in bytes, which is also the stride of the config view.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Bits8 => 1,
            Self::Bits16 => 2,
            Self::Bits32 => 4,
        }
    }

    /// Shift turning a byte offset into an index of the matching view.
    pub const fn shift(self) -> u32 {
        match self {
            Self::Bits8 => 0,
            Self::Bits16 => 1,
            Self::Bits32 => 2,
        }
    }

    pub const fn mask(self) -> u32 {
        match self {
            Self::Bits8 => 0xFF,
            Self::Bits16 => 0xFFFF,
            Self::Bits32 => 0xFFFF_FFFF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_ids() {
        assert_eq!(DeviceType::from_id(16), DeviceType::Gpu);
        assert_eq!(DeviceType::from_id(18), DeviceType::Input);
        assert_eq!(DeviceType::from_id(0), DeviceType::Invalid);
        assert_eq!(DeviceType::from_id(42), DeviceType::Other(42));
        assert_eq!(DeviceType::Gpu.id(), 16);
        assert!(!DeviceType::Invalid.is_valid());
    }

    #[test]
    fn test_device_type_names() {
        assert_eq!(DeviceType::from_name("gpu"), Some(DeviceType::Gpu));
        assert_eq!(DeviceType::from_name("input"), Some(DeviceType::Input));
        assert_eq!(DeviceType::from_name("2"), Some(DeviceType::Block));
        assert_eq!(DeviceType::from_name("keyboard"), None);
    }

    #[test]
    fn test_status_order() {
        assert_eq!(
            DeviceStatus::prerequisite(DeviceStatus::DRIVER),
            Some(DeviceStatus::ACKNOWLEDGE)
        );
        assert_eq!(
            DeviceStatus::prerequisite(DeviceStatus::DRIVER_OK),
            Some(DeviceStatus::FEATURES_OK)
        );
        assert_eq!(DeviceStatus::prerequisite(DeviceStatus::ACKNOWLEDGE), None);
        assert_eq!(DeviceStatus::RESET.bits(), 0);
    }
}
