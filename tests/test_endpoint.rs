//! Register sequences of a device endpoint against the emulated register file.

mod common;

use common::{attach_loopback, attach_model, open_endpoint, slot_base};
use virtio_bus::emul::{EmulatedBus, LoopbackModel};
use virtio_bus::virtio::irq::InterruptStatus;
use virtio_bus::virtio::regs::VIRTIO_MMIO_VERSION;
use virtio_bus::virtio::{AccessWidth, DeviceStatus, DeviceType, QueueDescription};

const RINGS: QueueDescription = QueueDescription {
    desc: 0x4000_1000,
    avail: 0x4000_2000,
    used: 0x1_4000_3000,
    size: 16,
};

#[test]
fn test_identity_registers() {
    let mut emul = EmulatedBus::new();
    attach_loopback(&mut emul, slot_base(0), 48, DeviceType::Input);
    let ep = open_endpoint(&emul, slot_base(0), 48);

    assert_eq!(ep.base(), slot_base(0));
    assert_eq!(ep.version(), VIRTIO_MMIO_VERSION);
    assert_eq!(ep.device_id(), 18);
    assert_eq!(ep.device_type(), DeviceType::Input);
    assert_eq!(ep.vendor_id(), 0x554D_4551);
    assert_eq!(ep.irq().line().number, 48);
}

#[test]
fn test_config_space_widths() {
    let mut emul = EmulatedBus::new();
    let model = LoopbackModel::new(DeviceType::Gpu).with_config(0, &[0x11, 0x22, 0x33, 0x44]);
    let device = attach_model(&mut emul, slot_base(0), 48, model);
    let mut ep = open_endpoint(&emul, slot_base(0), 48);

    // Test 1: reads of preloaded config at every width
    assert_eq!(ep.read_config(0, AccessWidth::Bits32), 0x4433_2211);
    assert_eq!(ep.read_config(2, AccessWidth::Bits16), 0x4433);
    assert_eq!(ep.read_config(1, AccessWidth::Bits8), 0x22);

    // Test 2: writes land at the byte offset of their view
    ep.write_config(8, AccessWidth::Bits32, 0xDEAD_BEEF);
    ep.write_config(12, AccessWidth::Bits16, 0xCAFE);
    ep.write_config(15, AccessWidth::Bits8, 0x7F);
    assert_eq!(ep.read_config(8, AccessWidth::Bits32), 0xDEAD_BEEF);
    assert_eq!(ep.read_config(12, AccessWidth::Bits16), 0xCAFE);
    assert_eq!(ep.read_config(15, AccessWidth::Bits8), 0x7F);
    assert_eq!(
        &device.lock().model().config_bytes()[8..16],
        &[0xEF, 0xBE, 0xAD, 0xDE, 0xFE, 0xCA, 0x00, 0x7F]
    );

    // Test 3: values wider than the view are truncated
    ep.write_config(20, AccessWidth::Bits8, 0x1234);
    assert_eq!(ep.read_config(20, AccessWidth::Bits32), 0x34);
}

#[test]
fn test_status_readback() {
    let mut emul = EmulatedBus::new();
    let device = attach_loopback(&mut emul, slot_base(0), 48, DeviceType::Gpu);
    let mut ep = open_endpoint(&emul, slot_base(0), 48);

    assert_eq!(ep.get_status(), DeviceStatus::RESET);
    assert!(ep.set_status(DeviceStatus::ACKNOWLEDGE));
    assert!(ep.set_status(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER));
    assert_eq!(device.lock().status(), DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER);

    // A feature the device never offered makes it drop FEATURES_OK.
    ep.set_features(0, 1 << 3);
    let wanted = DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::FEATURES_OK;
    assert!(!ep.set_status(wanted));
    assert!(!ep.get_status().contains(DeviceStatus::FEATURES_OK));

    // Writing RESET clears everything.
    assert!(ep.set_status(DeviceStatus::RESET));
    assert_eq!(device.lock().driver_features(), 0);
}

#[test]
fn test_feature_words() {
    let mut emul = EmulatedBus::new();
    let model = LoopbackModel::new(DeviceType::Block).with_features((1 << 32) | (1 << 5));
    let device = attach_model(&mut emul, slot_base(0), 48, model);
    let mut ep = open_endpoint(&emul, slot_base(0), 48);

    assert_eq!(ep.get_features(0), 1 << 5);
    assert_eq!(ep.get_features(1), 1);

    ep.set_features(1, 1);
    ep.set_features(0, 1 << 5);
    assert_eq!(device.lock().driver_features(), (1 << 32) | (1 << 5));
}

#[test]
fn test_configure_queue_once() {
    let mut emul = EmulatedBus::new();
    let device = attach_loopback(&mut emul, slot_base(0), 48, DeviceType::Gpu);
    let mut ep = open_endpoint(&emul, slot_base(0), 48);

    // Test 1: fresh queue reports the device limit and activates
    assert!(!ep.is_queue_ready(0));
    assert_eq!(ep.get_max_queue_size(0), 64);
    assert!(ep.configure_queue(0, RINGS));
    assert!(ep.is_queue_ready(0));
    assert_eq!(device.lock().queue_description(0), Some(RINGS));
    let writes = device.lock().ring_writes();
    assert_eq!(writes, 7);

    // Test 2: a ready queue is left alone
    let other = QueueDescription { desc: 0x9000, avail: 0xA000, used: 0xB000, size: 8 };
    assert!(!ep.configure_queue(0, other));
    assert_eq!(device.lock().ring_writes(), writes);
    assert_eq!(device.lock().queue_description(0), Some(RINGS));
    assert_eq!(ep.get_max_queue_size(0), 0);

    // Test 3: the other queue is still free
    assert_eq!(ep.get_max_queue_size(1), 64);

    // Test 4: a size the device cannot take does not activate
    let odd = QueueDescription { size: 12, ..RINGS };
    assert!(!ep.configure_queue(1, odd));
    assert!(!ep.is_queue_ready(1));
}

#[test]
fn test_unknown_queue_has_no_limit() {
    let mut emul = EmulatedBus::new();
    attach_loopback(&mut emul, slot_base(0), 48, DeviceType::Gpu);
    let mut ep = open_endpoint(&emul, slot_base(0), 48);
    assert_eq!(ep.get_max_queue_size(7), 0);
}

#[test]
fn test_read_isr_acknowledges() {
    let mut emul = EmulatedBus::new();
    let device = attach_loopback(&mut emul, slot_base(0), 48, DeviceType::Gpu);
    let mut ep = open_endpoint(&emul, slot_base(0), 48);

    assert_eq!(ep.read_isr(), 0);
    device.lock().raise(InterruptStatus::USED_RING_UPDATE | InterruptStatus::CONFIG_CHANGE);
    assert_eq!(emul.pending_irqs(), vec![48]);

    assert_eq!(ep.read_isr(), 0b11);
    assert_eq!(device.lock().interrupt_status(), 0);
    assert!(emul.pending_irqs().is_empty());
}

#[test]
fn test_stable_config_read_retries_on_generation_change() {
    let mut emul = EmulatedBus::new();
    let device = attach_loopback(&mut emul, slot_base(0), 48, DeviceType::Gpu);
    let ep = open_endpoint(&emul, slot_base(0), 48);

    let mut reads = 0;
    let value = ep.read_config_stable(|ep| {
        reads += 1;
        if reads == 1 {
            device.lock().raise_config_change();
        }
        ep.read_config(0, AccessWidth::Bits32)
    });
    assert_eq!(value, 0);
    assert_eq!(reads, 2);
    assert_eq!(ep.get_config_generation(), 1);
}

#[test]
fn test_notify_reaches_device() {
    let mut emul = EmulatedBus::new();
    let device = attach_loopback(&mut emul, slot_base(0), 48, DeviceType::Gpu);
    let mut ep = open_endpoint(&emul, slot_base(0), 48);

    ep.notify_buffers_available(1);
    ep.notify_buffers_available(0);
    assert_eq!(device.lock().notifications(), 2);
    // No queue was ready, so nothing was used.
    assert_eq!(device.lock().interrupt_status(), 0);
}
