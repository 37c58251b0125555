//! VirtIO-MMIO bus enumeration from a flattened device tree.
//!
//! The scan runs once at startup. It walks the top-level nodes, decodes
//! `interrupts` and `reg` of every `virtio_mmio*` node, probes the register
//! window for the virtio magic and records the device type. Nothing is
//! claimed or kept mapped; the resulting [`DeviceList`] feeds the
//! [`crate::arbiter::Registry`].

use alloc::vec::Vec;
use core::fmt;

use fdt::node::FdtNode;
use fdt::Fdt;

use crate::error::{Error, Result};
use crate::virtio::irq::{IrqLine, IrqPolarity, IrqTrigger};
use crate::virtio::regs::{MmioMapper, RegisterIo, DEVICE_ID, MAGIC_VALUE, VIRTIO_MMIO_MAGIC};
use crate::virtio::DeviceType;

/// Interrupt number base per `interrupts` type cell.
const IRQ_TYPE_BASE: [u32; 2] = [
    32, // SPI
    16, // PPI
];

const IRQ_TYPE_EDGE_LO_HI: u32 = 1;
const IRQ_TYPE_EDGE_HI_LO: u32 = 2;
const IRQ_TYPE_LEVEL_HI: u32 = 4;
const IRQ_TYPE_LEVEL_LO: u32 = 8;

/// `interrupts` is exactly one (type, number, flags) triple.
const INTERRUPTS_LEN: usize = 3 * 4;

const SUPPORTED_CELLS: u32 = 2;

#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// Name prefix of the bus nodes to scan.
    pub node_prefix: &'static str,
    /// Value the magic register must read.
    pub magic: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_prefix: "virtio_mmio",
            magic: VIRTIO_MMIO_MAGIC,
        }
    }
}

/// One discovered device. Immutable after the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescription {
    pub base: u64,
    pub size: u64,
    pub irq: IrqLine,
    pub device_type: DeviceType,
}

impl fmt::Display for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtIO {} device, address: {:#x}, interrupt: {}",
            self.device_type, self.base, self.irq.number
        )
    }
}

/// Result of a bus scan.
#[derive(Debug, Default, Clone)]
pub struct DeviceList {
    devices: Vec<DeviceDescription>,
}

impl DeviceList {
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&DeviceDescription> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescription> {
        self.devices.iter()
    }

    pub fn into_vec(self) -> Vec<DeviceDescription> {
        self.devices
    }
}

impl From<Vec<DeviceDescription>> for DeviceList {
    fn from(devices: Vec<DeviceDescription>) -> Self {
        Self { devices }
    }
}

fn be_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?))
}

fn be_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.get(..8)?.try_into().ok()?))
}

/// Root `#address-cells` / `#size-cells`.
fn root_cells(root: &FdtNode<'_, '_>) -> (u32, u32) {
    let cells = |name: &str| {
        root.property(name)
            .and_then(|prop| be_u32(prop.value))
            .unwrap_or(0)
    };
    (cells("#address-cells"), cells("#size-cells"))
}

/// Decode a 12-byte `interrupts` property.
pub fn parse_interrupts(value: &[u8]) -> Option<IrqLine> {
    if value.len() != INTERRUPTS_LEN {
        log::warn!("Invalid interrupts property length {}", value.len());
        return None;
    }
    let kind = be_u32(&value[0..])?;
    let number = be_u32(&value[4..])?;
    let flags = be_u32(&value[8..])?;

    let Some(base) = IRQ_TYPE_BASE.get(kind as usize) else {
        log::warn!("Unsupported IRQ type {}", kind);
        return None;
    };

    let (trigger, polarity) = match flags {
        IRQ_TYPE_EDGE_LO_HI => (IrqTrigger::Edge, IrqPolarity::High),
        IRQ_TYPE_EDGE_HI_LO => (IrqTrigger::Edge, IrqPolarity::Low),
        IRQ_TYPE_LEVEL_HI => (IrqTrigger::Level, IrqPolarity::High),
        IRQ_TYPE_LEVEL_LO => (IrqTrigger::Level, IrqPolarity::Low),
        _ => {
            log::warn!("Unsupported IRQ flags {:#x}", flags);
            return None;
        }
    };

    let Some(irq) = base.checked_add(number) else {
        log::warn!("IRQ number {:#x} out of range", number);
        return None;
    };
    Some(IrqLine::new(irq, trigger, polarity))
}

/// Decode a `reg` property of exactly one (address, size) pair.
pub fn parse_reg(value: &[u8], address_cells: u32, size_cells: u32) -> Result<(u64, u64)> {
    if address_cells != SUPPORTED_CELLS || size_cells != SUPPORTED_CELLS {
        return Err(Error::UnsupportedCellSize { address_cells, size_cells });
    }
    let expected = (address_cells + size_cells) as usize * 4;
    if value.len() != expected {
        log::warn!("Invalid reg property length {} (expected {})", value.len(), expected);
        return Err(Error::InvalidDeviceTree);
    }
    match (be_u64(&value[0..]), be_u64(&value[8..])) {
        (Some(base), Some(size)) => Ok((base, size)),
        _ => Err(Error::InvalidDeviceTree),
    }
}

/// Map the window and read magic and device ID.
fn probe<M: MmioMapper>(mapper: &M, base: u64, size: u64, config: &BusConfig) -> Result<DeviceType> {
    let regs = mapper.map(base, size)?;
    let magic = regs.read32(MAGIC_VALUE);
    if magic != config.magic {
        return Err(Error::ProbeFailed { base, magic });
    }
    Ok(DeviceType::from_id(regs.read32(DEVICE_ID)))
}

/// Scan the top-level nodes of `dtb` for virtio-mmio devices.
///
/// Malformed nodes and failed probes are logged and skipped; only a blob
/// that fails header validation fails the scan.
pub fn scan<M: MmioMapper>(dtb: &[u8], mapper: &M, config: &BusConfig) -> Result<DeviceList> {
    let fdt = Fdt::new(dtb).map_err(|e| {
        log::error!("Device tree invalid: {:?}", e);
        Error::InvalidDeviceTree
    })?;
    let root = fdt.find_node("/").ok_or(Error::InvalidDeviceTree)?;
    let (address_cells, size_cells) = root_cells(&root);

    let mut devices = Vec::new();

    for node in root.children() {
        if !node.name.starts_with(config.node_prefix) {
            continue;
        }

        let Some(irq) = node
            .property("interrupts")
            .and_then(|prop| parse_interrupts(prop.value))
        else {
            log::warn!("{}: skipping node without usable interrupts", node.name);
            continue;
        };

        let Some(reg) = node.property("reg") else {
            log::warn!("{}: skipping node without reg", node.name);
            continue;
        };
        let (base, size) = match parse_reg(reg.value, address_cells, size_cells) {
            Ok(window) => window,
            Err(e) => {
                log::warn!("{}: {}", node.name, e);
                continue;
            }
        };

        let device_type = match probe(mapper, base, size, config) {
            Ok(ty) => ty,
            Err(e) => {
                log::warn!("{}: {}", node.name, e);
                continue;
            }
        };
        if !device_type.is_valid() {
            log::debug!("{}: empty slot @ {:#x}", node.name, base);
            continue;
        }

        let device = DeviceDescription { base, size, irq, device_type };
        log::info!("Found {}", device);
        devices.push(device);
    }

    if devices.is_empty() {
        log::warn!("No VirtIO devices found");
    } else {
        log::info!("Probe finished, found {} VirtIO device(s).", devices.len());
    }

    Ok(DeviceList { devices })
}
