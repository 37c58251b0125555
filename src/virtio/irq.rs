//! Interrupt relay for virtio-mmio devices.
//!
//! ## Delivery Flow
//! 1. The platform signals the device's IRQ line; the line stays masked
//!    until the subscription is acked
//! 2. The relay reads InterruptStatus and writes it back to InterruptAck
//! 3. CONFIG_CHANGE runs the target's config-changed hook
//! 4. USED_RING_UPDATE walks every queue registered with the target
//! 5. The line is re-armed, unless no recognized bit was set, in which
//!    case the device is stopped instead of being re-entered forever

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;

use crate::error::{Error, Result};
use super::endpoint::DeviceEndpoint;
use super::regs::RegisterIo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqTrigger {
    Unchanged,
    Edge,
    Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqPolarity {
    Unchanged,
    High,
    Low,
}

/// Absolute interrupt number plus its electrical configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqLine {
    pub number: u32,
    pub trigger: IrqTrigger,
    pub polarity: IrqPolarity,
}

impl IrqLine {
    pub const fn new(number: u32, trigger: IrqTrigger, polarity: IrqPolarity) -> Self {
        Self { number, trigger, polarity }
    }
}

impl fmt::Display for IrqLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}/{:?})", self.number, self.trigger, self.polarity)
    }
}

/// Subscription to one device interrupt line, owned by the endpoint.
///
/// A delivery masks the line; `ack` re-arms it.
pub struct IrqSubscription {
    line: IrqLine,
    armed: AtomicBool,
    acks: AtomicU32,
}

impl IrqSubscription {
    pub fn new(line: IrqLine) -> Self {
        Self {
            line,
            armed: AtomicBool::new(true),
            acks: AtomicU32::new(0),
        }
    }

    pub fn line(&self) -> IrqLine {
        self.line
    }

    /// Record a delivery. Returns false if the line was not armed.
    pub fn mark_delivered(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    pub fn ack(&self) {
        self.acks.fetch_add(1, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn ack_count(&self) -> u32 {
        self.acks.load(Ordering::Relaxed)
    }
}

bitflags! {
    /// InterruptStatus register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        const USED_RING_UPDATE = 1 << 0;
        const CONFIG_CHANGE = 1 << 1;
    }
}

/// A queue that can process entries the device placed in its used ring.
pub trait RingConsumer {
    /// Process every pending used entry; returns how many were consumed.
    fn process_used(&mut self) -> usize;
}

/// Receiver of relayed interrupt events for one device.
pub trait IrqTarget {
    fn config_changed(&mut self) {}

    /// Call `f` once for every queue registered against the device.
    fn for_each_queue(&mut self, f: &mut dyn FnMut(&mut dyn RingConsumer));
}

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Re-read InterruptStatus after handling until it reads zero, so bits
    /// raised between read and ack are not lost.
    pub drain_isr: bool,
    /// Upper bound on status reads per delivery when draining.
    pub max_rounds: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            drain_isr: true,
            max_rounds: 8,
        }
    }
}

/// Relays interrupts of one device to its transport driver and queues.
pub struct InterruptRelay {
    config: RelayConfig,
    stopped: bool,
    deliveries: u64,
}

impl InterruptRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            stopped: false,
            deliveries: 0,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries
    }

    /// Handle one IRQ delivery for `endpoint`.
    ///
    /// Returns the union of handled status bits. A delivery without any
    /// recognized bit stops the relay and leaves the line masked.
    pub fn handle_irq<R, T>(
        &mut self,
        endpoint: &mut DeviceEndpoint<R>,
        target: &mut T,
    ) -> Result<InterruptStatus>
    where
        R: RegisterIo,
        T: IrqTarget + ?Sized,
    {
        if self.stopped {
            return Err(Error::DeviceStopped);
        }

        if !endpoint.irq().mark_delivered() {
            log::debug!("IRQ {} delivered while masked", endpoint.irq().line().number);
        }
        self.deliveries += 1;

        let mut handled = InterruptStatus::empty();
        let mut raw_seen = 0u32;
        let mut status = endpoint.read_isr();
        let mut rounds = 1;

        loop {
            raw_seen |= status;
            let bits = InterruptStatus::from_bits_truncate(status);

            if bits.contains(InterruptStatus::CONFIG_CHANGE) {
                target.config_changed();
            }

            if bits.contains(InterruptStatus::USED_RING_UPDATE) {
                let mut consumed = 0;
                target.for_each_queue(&mut |queue| consumed += queue.process_used());
                log::trace!("IRQ {}: {} used entries", endpoint.irq().line().number, consumed);
            }

            handled |= bits;

            if !self.config.drain_isr || rounds >= self.config.max_rounds {
                break;
            }
            status = endpoint.read_isr();
            if status == 0 {
                break;
            }
            rounds += 1;
        }

        if handled.is_empty() {
            log::error!(
                "Unhandled IRQ {} (status {:#x}), stopping device @ {:#x}",
                endpoint.irq().line().number,
                raw_seen,
                endpoint.base()
            );
            self.stopped = true;
            return Err(Error::SpuriousInterrupt { status: raw_seen });
        }

        endpoint.irq().ack();
        Ok(handled)
    }
}

impl Default for InterruptRelay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_arm_cycle() {
        let sub = IrqSubscription::new(IrqLine::new(48, IrqTrigger::Level, IrqPolarity::High));
        assert!(sub.is_armed());
        assert!(sub.mark_delivered());
        assert!(!sub.is_armed());
        assert!(!sub.mark_delivered());
        sub.ack();
        assert!(sub.is_armed());
        assert_eq!(sub.ack_count(), 1);
    }

    #[test]
    fn test_status_bits() {
        let bits = InterruptStatus::from_bits_truncate(0b111);
        assert!(bits.contains(InterruptStatus::USED_RING_UPDATE));
        assert!(bits.contains(InterruptStatus::CONFIG_CHANGE));
        assert!(InterruptStatus::from_bits_truncate(0b100).is_empty());
    }
}
