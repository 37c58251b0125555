//! Shared fixtures: a flattened device tree builder and emulated devices.

#![allow(dead_code)]

use std::sync::Arc;

use spin::Mutex;
use virtio_bus::emul::{shared, BusWindow, EmulatedBus, EmulatedDevice, LoopbackModel};
use virtio_bus::virtio::endpoint::DeviceEndpoint;
use virtio_bus::virtio::irq::{IrqLine, IrqPolarity, IrqTrigger};
use virtio_bus::virtio::regs::{MmioMapper, WINDOW_SIZE};
use virtio_bus::virtio::DeviceType;

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;
const HEADER_SIZE: usize = 40;
const RSVMAP_SIZE: usize = 16;

pub type Loopback = Arc<Mutex<EmulatedDevice<LoopbackModel>>>;

/// Builds a version 17 flattened device tree blob.
pub struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
    names: Vec<(String, u32)>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self {
            structure: Vec::new(),
            strings: Vec::new(),
            names: Vec::new(),
        }
    }

    fn push_u32(&mut self, value: u32) {
        self.structure.extend_from_slice(&value.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        if let Some((_, off)) = self.names.iter().find(|(n, _)| n == name) {
            return *off;
        }
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.names.push((name.to_string(), off));
        off
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.push_u32(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        self.push_u32(FDT_END_NODE);
        self
    }

    pub fn property(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let nameoff = self.string_offset(name);
        self.push_u32(FDT_PROP);
        self.push_u32(value.len() as u32);
        self.push_u32(nameoff);
        self.structure.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn cells(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let value: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.property(name, &value)
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.push_u32(FDT_END);

        let off_rsvmap = HEADER_SIZE;
        let off_struct = off_rsvmap + RSVMAP_SIZE;
        let off_strings = off_struct + self.structure.len();
        let total = off_strings + self.strings.len();

        let mut blob = Vec::with_capacity(total);
        for field in [
            FDT_MAGIC,
            total as u32,
            off_struct as u32,
            off_strings as u32,
            off_rsvmap as u32,
            17, // version
            16, // last compatible version
            0,  // boot cpu
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            blob.extend_from_slice(&field.to_be_bytes());
        }
        blob.extend_from_slice(&[0u8; RSVMAP_SIZE]);
        blob.extend_from_slice(&self.structure);
        blob.extend_from_slice(&self.strings);
        blob
    }
}

/// Root node with 2/2 cells, ready for `virtio_node` children.
pub fn root() -> FdtBuilder {
    let mut fdt = FdtBuilder::new();
    fdt.begin_node("")
        .cells("#address-cells", &[2])
        .cells("#size-cells", &[2]);
    fdt
}

/// A `virtio_mmio@...` node with a level-high SPI.
pub fn virtio_node(fdt: &mut FdtBuilder, base: u64, spi: u32) {
    fdt.begin_node(&format!("virtio_mmio@{:x}", base))
        .cells("interrupts", &[0, spi, 4])
        .cells(
            "reg",
            &[(base >> 32) as u32, base as u32, 0, 0x200],
        )
        .end_node();
}

/// Device tree with one virtio node per `(base, spi)`.
pub fn virtio_tree(nodes: &[(u64, u32)]) -> Vec<u8> {
    let mut fdt = root();
    for &(base, spi) in nodes {
        virtio_node(&mut fdt, base, spi);
    }
    fdt.end_node();
    fdt.finish()
}

pub fn loopback(base: u64, irq: u32, ty: DeviceType) -> Loopback {
    shared(EmulatedDevice::new(base, irq, LoopbackModel::new(ty)))
}

/// Attach a loopback device of type `ty` at `base` to `bus`.
pub fn attach_loopback(bus: &mut EmulatedBus, base: u64, irq: u32, ty: DeviceType) -> Loopback {
    let device = loopback(base, irq, ty);
    bus.attach(device.clone());
    device
}

/// Attach a loopback device built from a custom `model`.
pub fn attach_model(bus: &mut EmulatedBus, base: u64, irq: u32, model: LoopbackModel) -> Loopback {
    let device = shared(EmulatedDevice::new(base, irq, model));
    bus.attach(device.clone());
    device
}

/// Base address of the `n`-th window in the test layout.
pub fn slot_base(n: usize) -> u64 {
    0x0a00_0000 + n as u64 * 0x200
}

/// Map and probe the window at `base` without going through a session.
pub fn open_endpoint(bus: &EmulatedBus, base: u64, irq: u32) -> DeviceEndpoint<BusWindow> {
    let regs = bus.map(base, WINDOW_SIZE as u64).unwrap();
    DeviceEndpoint::probe(regs, base, IrqLine::new(irq, IrqTrigger::Level, IrqPolarity::High)).unwrap()
}
