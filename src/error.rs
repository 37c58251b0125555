//! Error types for the VirtIO bus, arbiter and transport.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Device tree blob failed header validation.
    InvalidDeviceTree,
    /// Root `#address-cells` / `#size-cells` missing or not 2/2.
    UnsupportedCellSize { address_cells: u32, size_cells: u32 },
    /// Register window could not be mapped.
    MapFailed { base: u64 },
    /// Magic register did not read `0x74726976`.
    ProbeFailed { base: u64, magic: u32 },
    /// Session has no free device slot left.
    OutOfDeviceSlots,
    /// Session capability budget cannot cover a lease.
    OutOfCaps { needed: u32, available: u32 },
    /// DMA memory for rings or buffers could not be allocated.
    OutOfMemory,
    /// No policy in the configuration matches the session label.
    NoPolicy,
    /// Configuration document could not be parsed.
    InvalidConfig,
    /// Handle does not name a live lease of this session.
    InvalidHandle,
    /// Device did not accept a status write (read-back mismatch).
    StatusRejected { requested: u8, actual: u8 },
    /// Status bit written out of the RESET/ACK/DRIVER/FEATURES_OK/DRIVER_OK order.
    StatusOrder { requested: u8, current: u8 },
    /// Device carries FAILED and must be reset before reuse.
    DeviceFailed,
    /// Device does not offer VIRTIO_F_VERSION_1.
    UnsupportedVersion,
    /// Device did not accept the negotiated feature set.
    FeaturesRejected,
    /// Queue is already marked ready by the device.
    QueueAlreadyReady { index: u16 },
    /// Device reports a maximum queue size of zero.
    QueueSizeZero { index: u16 },
    /// Queue activation was not confirmed by read-back.
    QueueNotActivated { index: u16 },
    /// Notify on a queue that was never activated.
    QueueInactive,
    /// No free descriptor for a new transfer.
    QueueFull,
    /// Payload does not fit the per-descriptor buffer.
    BufferTooSmall,
    /// Interrupt delivered with no recognized status bit.
    SpuriousInterrupt { status: u32 },
    /// Device operation stopped after a fatal protocol violation.
    DeviceStopped,
    /// No device accepted by the transport was found.
    DeviceNotFound,
}

impl Error {
    /// Resource exhaustion the caller may retry after freeing or donating resources.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfDeviceSlots | Self::OutOfCaps { .. } | Self::OutOfMemory | Self::QueueFull
        )
    }

    /// Protocol violations and negotiation failures that end the device instance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::QueueAlreadyReady { .. }
                | Self::QueueSizeZero { .. }
                | Self::QueueNotActivated { .. }
                | Self::QueueInactive
                | Self::SpuriousInterrupt { .. }
                | Self::DeviceStopped
                | Self::DeviceFailed
                | Self::UnsupportedVersion
                | Self::FeaturesRejected
                | Self::StatusRejected { .. }
                | Self::StatusOrder { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDeviceTree => write!(f, "Device tree header invalid"),
            Self::UnsupportedCellSize { address_cells, size_cells } => write!(
                f,
                "Invalid #address-cells / #size-cells values ({}/{})",
                address_cells, size_cells
            ),
            Self::MapFailed { base } => write!(f, "Failed to map registers at {:#x}", base),
            Self::ProbeFailed { base, magic } => {
                write!(f, "Probe failed at {:#x} (magic {:#010x})", base, magic)
            }
            Self::OutOfDeviceSlots => write!(f, "Too many claimed devices"),
            Self::OutOfCaps { needed, available } => write!(
                f,
                "Out of caps: need {}, {} available",
                needed, available
            ),
            Self::OutOfMemory => write!(f, "Out of DMA memory"),
            Self::NoPolicy => write!(f, "No matching session policy"),
            Self::InvalidConfig => write!(f, "Invalid configuration"),
            Self::InvalidHandle => write!(f, "Invalid device handle"),
            Self::StatusRejected { requested, actual } => write!(
                f,
                "Device rejected status {:#04x} (reads {:#04x})",
                requested, actual
            ),
            Self::StatusOrder { requested, current } => write!(
                f,
                "Status {:#04x} out of order (current {:#04x})",
                requested, current
            ),
            Self::DeviceFailed => write!(f, "Device is in FAILED state"),
            Self::UnsupportedVersion => write!(f, "Unsupported VirtIO device version"),
            Self::FeaturesRejected => write!(f, "Device feature negotiation failed"),
            Self::QueueAlreadyReady { index } => write!(f, "Queue {} already ready", index),
            Self::QueueSizeZero { index } => write!(f, "Queue {} has size 0", index),
            Self::QueueNotActivated { index } => write!(f, "Queue {} did not activate", index),
            Self::QueueInactive => write!(f, "Notify on inactive queue"),
            Self::QueueFull => write!(f, "No free descriptors"),
            Self::BufferTooSmall => write!(f, "Buffer too small"),
            Self::SpuriousInterrupt { status } => {
                write!(f, "Unhandled IRQ (status {:#x})", status)
            }
            Self::DeviceStopped => write!(f, "Device stopped"),
            Self::DeviceNotFound => write!(f, "No suitable VirtIO device found"),
        }
    }
}
