//! Bus scan over generated device trees and emulated windows.

mod common;

use common::{attach_loopback, root, virtio_node, virtio_tree};
use virtio_bus::emul::{shared, EmulatedBus, EmulatedDevice, LoopbackModel};
use virtio_bus::virtio::irq::{IrqLine, IrqPolarity, IrqTrigger};
use virtio_bus::virtio::DeviceType;
use virtio_bus::{bus, BusConfig, Error};

const BASE_A: u64 = 0x0a00_0000;
const BASE_B: u64 = 0x0a00_0200;
const BASE_C: u64 = 0x0a00_0400;

#[test]
fn test_two_node_tree_with_truncated_interrupts() {
    let mut emul = EmulatedBus::new();
    attach_loopback(&mut emul, BASE_A, 48, DeviceType::Gpu);
    attach_loopback(&mut emul, BASE_B, 49, DeviceType::Input);

    let mut fdt = root();
    virtio_node(&mut fdt, BASE_A, 16);
    // Node B: interrupts carries only (type, number).
    fdt.begin_node("virtio_mmio@a000200")
        .cells("interrupts", &[0, 17])
        .cells("reg", &[0, BASE_B as u32, 0, 0x200])
        .end_node();
    fdt.end_node();
    let dtb = fdt.finish();

    let list = bus::scan(&dtb, &emul, &BusConfig::default()).unwrap();
    assert_eq!(list.device_count(), 1);

    let gpu = list.get(0).unwrap();
    assert_eq!(gpu.base, BASE_A);
    assert_eq!(gpu.size, 0x200);
    assert_eq!(gpu.device_type, DeviceType::Gpu);
    assert_eq!(gpu.irq, IrqLine::new(48, IrqTrigger::Level, IrqPolarity::High));
}

#[test]
fn test_magic_mismatch_is_skipped() {
    let mut emul = EmulatedBus::new();
    attach_loopback(&mut emul, BASE_A, 48, DeviceType::Block);
    let bogus = shared(
        EmulatedDevice::new(BASE_B, 49, LoopbackModel::new(DeviceType::Block)).with_magic(0x1234_5678),
    );
    emul.attach(bogus);

    let dtb = virtio_tree(&[(BASE_A, 16), (BASE_B, 17)]);
    let list = bus::scan(&dtb, &emul, &BusConfig::default()).unwrap();

    assert_eq!(list.device_count(), 1);
    assert!(list.iter().all(|d| d.base != BASE_B));
}

#[test]
fn test_empty_slots_and_unmapped_windows_are_skipped() {
    let mut emul = EmulatedBus::new();
    attach_loopback(&mut emul, BASE_A, 48, DeviceType::Invalid);
    attach_loopback(&mut emul, BASE_B, 49, DeviceType::Entropy);
    // Nothing answers at BASE_C.

    let dtb = virtio_tree(&[(BASE_A, 16), (BASE_B, 17), (BASE_C, 18)]);
    let list = bus::scan(&dtb, &emul, &BusConfig::default()).unwrap();

    assert_eq!(list.device_count(), 1);
    assert_eq!(list.get(0).map(|d| d.device_type), Some(DeviceType::Entropy));
    assert_eq!(list.get(0).map(|d| d.irq.number), Some(49));
}

#[test]
fn test_only_prefixed_nodes_are_scanned() {
    let mut emul = EmulatedBus::new();
    attach_loopback(&mut emul, BASE_A, 48, DeviceType::Console);

    let mut fdt = root();
    fdt.begin_node("uart@a000000")
        .cells("interrupts", &[0, 16, 4])
        .cells("reg", &[0, BASE_A as u32, 0, 0x200])
        .end_node();
    fdt.end_node();
    let dtb = fdt.finish();

    let list = bus::scan(&dtb, &emul, &BusConfig::default()).unwrap();
    assert!(list.is_empty());

    let config = BusConfig { node_prefix: "uart", ..BusConfig::default() };
    let list = bus::scan(&dtb, &emul, &config).unwrap();
    assert_eq!(list.device_count(), 1);
}

#[test]
fn test_unsupported_cells_skip_every_node() {
    let mut emul = EmulatedBus::new();
    attach_loopback(&mut emul, BASE_A, 48, DeviceType::Gpu);

    let mut fdt = common::FdtBuilder::new();
    fdt.begin_node("")
        .cells("#address-cells", &[2])
        .cells("#size-cells", &[1]);
    fdt.begin_node("virtio_mmio@a000000")
        .cells("interrupts", &[0, 16, 4])
        .cells("reg", &[0, BASE_A as u32, 0x200])
        .end_node();
    fdt.end_node();
    let dtb = fdt.finish();

    let list = bus::scan(&dtb, &emul, &BusConfig::default()).unwrap();
    assert_eq!(list.device_count(), 0);
}

#[test]
fn test_bad_reg_length_and_irq_flags() {
    let mut emul = EmulatedBus::new();
    attach_loopback(&mut emul, BASE_A, 48, DeviceType::Gpu);
    attach_loopback(&mut emul, BASE_B, 49, DeviceType::Gpu);
    attach_loopback(&mut emul, BASE_C, 50, DeviceType::Gpu);

    let mut fdt = root();
    // reg one cell short
    fdt.begin_node("virtio_mmio@a000000")
        .cells("interrupts", &[0, 16, 4])
        .cells("reg", &[0, BASE_A as u32, 0])
        .end_node();
    // flags 3 is not a single trigger type
    fdt.begin_node("virtio_mmio@a000200")
        .cells("interrupts", &[0, 17, 3])
        .cells("reg", &[0, BASE_B as u32, 0, 0x200])
        .end_node();
    // PPI, edge falling
    fdt.begin_node("virtio_mmio@a000400")
        .cells("interrupts", &[1, 2, 2])
        .cells("reg", &[0, BASE_C as u32, 0, 0x200])
        .end_node();
    fdt.end_node();
    let dtb = fdt.finish();

    let list = bus::scan(&dtb, &emul, &BusConfig::default()).unwrap();
    assert_eq!(list.device_count(), 1);
    let dev = list.get(0).unwrap();
    assert_eq!(dev.base, BASE_C);
    assert_eq!(dev.irq, IrqLine::new(18, IrqTrigger::Edge, IrqPolarity::Low));
}

#[test]
fn test_invalid_header_fails_scan() {
    let emul = EmulatedBus::new();
    let mut dtb = virtio_tree(&[(BASE_A, 16)]);
    dtb[0] = 0;
    assert_eq!(
        bus::scan(&dtb, &emul, &BusConfig::default()).map(|l| l.device_count()),
        Err(Error::InvalidDeviceTree)
    );
    assert!(bus::scan(&[], &emul, &BusConfig::default()).is_err());
}

#[test]
fn test_description_display() {
    let mut emul = EmulatedBus::new();
    attach_loopback(&mut emul, BASE_A, 48, DeviceType::Gpu);
    let list = bus::scan(&virtio_tree(&[(BASE_A, 16)]), &emul, &BusConfig::default()).unwrap();
    assert_eq!(
        list.get(0).unwrap().to_string(),
        "VirtIO gpu device, address: 0xa000000, interrupt: 48"
    );
}
