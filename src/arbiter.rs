//! Device arbitration: exclusive leases on scanned devices.
//!
//! The [`Registry`] holds every description found by the bus scan plus a
//! claim flag per description. A [`Session`] is one client's view of it:
//! a policy naming the device types it may lease, a capability quota that
//! pays for each lease, and a fixed table of device slots.
//!
//! Lease request order:
//! 1. The policy must permit the type (`Ok(None)` otherwise)
//! 2. A free slot must exist (`OutOfDeviceSlots` otherwise)
//! 3. Walk the registry from the start position for a free description
//!    of that type and claim it with a compare-exchange
//! 4. Map and probe the window; on failure unclaim and keep walking
//! 5. Withdraw `CAPS_PER_DEVICE`; on failure unclaim and return `OutOfCaps`

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::bus::{DeviceDescription, DeviceList};
use crate::config::{Config, Policy};
use crate::error::{Error, Result};
use crate::virtio::endpoint::DeviceEndpoint;
use crate::virtio::regs::{MmioMapper, RegisterIo};
use crate::virtio::DeviceType;

/// Quota units one lease costs: the endpoint, its register mapping and
/// its IRQ subscription.
pub const CAPS_PER_DEVICE: u32 = 3;

/// Maximum number of devices one session can hold at once.
pub const DEVICE_SLOT_COUNT: usize = 8;

struct Entry {
    description: DeviceDescription,
    claimed: AtomicBool,
}

/// All devices found on the bus, shared by every session.
pub struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    pub fn new(devices: DeviceList) -> Self {
        let entries = devices
            .into_vec()
            .into_iter()
            .map(|description| Entry {
                description,
                claimed: AtomicBool::new(false),
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn description(&self, index: usize) -> Option<&DeviceDescription> {
        self.entries.get(index).map(|e| &e.description)
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.entries
            .get(index)
            .is_some_and(|e| e.claimed.load(Ordering::Acquire))
    }

    pub fn claimed_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.claimed.load(Ordering::Acquire))
            .count()
    }

    fn try_claim(&self, index: usize) -> bool {
        self.entries.get(index).is_some_and(|e| {
            e.claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    fn unclaim(&self, index: usize) {
        if let Some(entry) = self.entries.get(index) {
            entry.claimed.store(false, Ordering::Release);
        }
    }
}

/// Per-session capability budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapQuota {
    available: u32,
}

impl CapQuota {
    pub const fn new(units: u32) -> Self {
        Self { available: units }
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn withdraw(&mut self, units: u32) -> Result<()> {
        if units > self.available {
            return Err(Error::OutOfCaps {
                needed: units,
                available: self.available,
            });
        }
        self.available -= units;
        Ok(())
    }

    pub fn replenish(&mut self, units: u32) {
        self.available = self.available.saturating_add(units);
    }
}

/// Session-local name of one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle {
    slot: usize,
    serial: u32,
}

struct Lease<R: RegisterIo> {
    index: usize,
    serial: u32,
    caps: u32,
    endpoint: DeviceEndpoint<R>,
}

/// One client's access to the registry.
pub struct Session<'r, M: MmioMapper> {
    label: String,
    policy: Policy,
    registry: &'r Registry,
    mapper: &'r M,
    quota: CapQuota,
    slots: Vec<Option<Lease<M::Regs>>>,
    next_serial: u32,
}

impl<'r, M: MmioMapper> Session<'r, M> {
    pub fn new(
        label: &str,
        policy: Policy,
        registry: &'r Registry,
        mapper: &'r M,
        quota: u32,
    ) -> Self {
        let mut slots = Vec::with_capacity(DEVICE_SLOT_COUNT);
        slots.resize_with(DEVICE_SLOT_COUNT, || None);
        Self {
            label: String::from(label),
            policy,
            registry,
            mapper,
            quota: CapQuota::new(quota),
            slots,
            next_serial: 1,
        }
    }

    /// Open a session whose policy is selected from `config` by `label`.
    pub fn open(
        config: &Config,
        label: &str,
        registry: &'r Registry,
        mapper: &'r M,
        quota: u32,
    ) -> Result<Self> {
        let policy = config.policy_for(label).map_err(|e| {
            log::warn!("rejecting session '{}': {}", label, e);
            e
        })?;
        Ok(Self::new(label, policy.clone(), registry, mapper, quota))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn quota_available(&self) -> u32 {
        self.quota.available()
    }

    pub fn lease_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Lease the first free device of type `ty`.
    pub fn first_device(&mut self, ty: DeviceType) -> Result<Option<DeviceHandle>> {
        self.lease(ty, 0)
    }

    /// Lease the next free device of the same type as `prev`, searching
    /// after `prev`'s position. `prev` stays leased.
    pub fn next_device(&mut self, prev: DeviceHandle) -> Result<Option<DeviceHandle>> {
        let index = self.lease_ref(prev)?.index;
        let ty = self
            .registry
            .description(index)
            .map(|d| d.device_type)
            .ok_or(Error::InvalidHandle)?;
        self.lease(ty, index + 1)
    }

    /// Give the device back. The endpoint is destroyed, the description
    /// unclaimed and the lease's quota refunded.
    pub fn release_device(&mut self, handle: DeviceHandle) -> Result<()> {
        self.lease_ref(handle)?;
        let Some(lease) = self.slots[handle.slot].take() else {
            return Err(Error::InvalidHandle);
        };
        self.retire(lease);
        Ok(())
    }

    pub fn device(&self, handle: DeviceHandle) -> Result<&DeviceEndpoint<M::Regs>> {
        Ok(&self.lease_ref(handle)?.endpoint)
    }

    pub fn device_mut(&mut self, handle: DeviceHandle) -> Result<&mut DeviceEndpoint<M::Regs>> {
        match self.slots.get_mut(handle.slot) {
            Some(Some(lease)) if lease.serial == handle.serial => Ok(&mut lease.endpoint),
            _ => Err(Error::InvalidHandle),
        }
    }

    pub fn description(&self, handle: DeviceHandle) -> Result<&DeviceDescription> {
        let index = self.lease_ref(handle)?.index;
        self.registry.description(index).ok_or(Error::InvalidHandle)
    }

    /// Donate `units` of quota to the session.
    pub fn upgrade_resources(&mut self, units: u32) {
        self.quota.replenish(units);
        log::debug!(
            "session '{}': quota upgraded by {} to {}",
            self.label,
            units,
            self.quota.available()
        );
    }

    /// Run `request`, and on `OutOfCaps` ask `donate` for more quota and
    /// retry. `donate` gets the missing amount and returns the units it
    /// grants; `None` or zero ends the retries with the last error.
    pub fn with_upgrade<T>(
        &mut self,
        mut request: impl FnMut(&mut Self) -> Result<T>,
        mut donate: impl FnMut(u32) -> Option<u32>,
    ) -> Result<T> {
        loop {
            match request(self) {
                Err(Error::OutOfCaps { needed, available }) => {
                    match donate(needed.saturating_sub(available)) {
                        Some(units) if units > 0 => self.upgrade_resources(units),
                        _ => return Err(Error::OutOfCaps { needed, available }),
                    }
                }
                result => return result,
            }
        }
    }

    fn lease_ref(&self, handle: DeviceHandle) -> Result<&Lease<M::Regs>> {
        match self.slots.get(handle.slot) {
            Some(Some(lease)) if lease.serial == handle.serial => Ok(lease),
            _ => Err(Error::InvalidHandle),
        }
    }

    fn lease(&mut self, ty: DeviceType, start: usize) -> Result<Option<DeviceHandle>> {
        if !self.policy.permits(ty) {
            log::debug!("session '{}': {} devices not permitted", self.label, ty);
            return Ok(None);
        }

        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::OutOfDeviceSlots)?;

        for index in start..self.registry.len() {
            let Some(desc) = self.registry.description(index).copied() else {
                break;
            };
            if desc.device_type != ty || !self.registry.try_claim(index) {
                continue;
            }

            let endpoint = match self
                .mapper
                .map(desc.base, desc.size)
                .and_then(|regs| DeviceEndpoint::probe(regs, desc.base, desc.irq))
            {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    log::warn!("session '{}': {}", self.label, e);
                    self.registry.unclaim(index);
                    continue;
                }
            };

            if let Err(e) = self.quota.withdraw(CAPS_PER_DEVICE) {
                drop(endpoint);
                self.registry.unclaim(index);
                return Err(e);
            }

            let serial = self.next_serial;
            self.next_serial = self.next_serial.wrapping_add(1);
            self.slots[slot] = Some(Lease {
                index,
                serial,
                caps: CAPS_PER_DEVICE,
                endpoint,
            });
            log::info!("session '{}': leased {}", self.label, desc);
            return Ok(Some(DeviceHandle { slot, serial }));
        }

        Ok(None)
    }

    fn retire(&mut self, lease: Lease<M::Regs>) {
        let Lease { index, caps, endpoint, .. } = lease;
        drop(endpoint);
        self.registry.unclaim(index);
        self.quota.replenish(caps);
    }
}

impl<M: MmioMapper> Drop for Session<'_, M> {
    fn drop(&mut self) {
        let mut released = 0;
        for slot in 0..self.slots.len() {
            if let Some(lease) = self.slots[slot].take() {
                self.retire(lease);
                released += 1;
            }
        }
        if released > 0 {
            log::info!("session '{}' closed, released {} device(s)", self.label, released);
        }
    }
}
