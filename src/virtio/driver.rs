//! Transport bring-up shared by all concrete device drivers.
//!
//! Drives the status state machine in the only order the device accepts:
//!
//! ```text
//! RESET -> ACKNOWLEDGE -> DRIVER -> FEATURES_OK -> (queue setup) -> DRIVER_OK
//! ```
//!
//! Any rejected step sets FAILED, after which the device is unusable until
//! the next reset.

use crate::arbiter::{DeviceHandle, Session};
use crate::error::{Error, Result};
use super::dma::DmaAllocator;
use super::endpoint::DeviceEndpoint;
use super::queue::{QueueTraits, Virtqueue, WireFormat};
use super::regs::{MmioMapper, RegisterIo};
use super::{DeviceStatus, DeviceType, VIRTIO_F_VERSION_1};

/// Status and feature negotiation on one leased endpoint.
pub struct Transport<'e, R: RegisterIo> {
    endpoint: &'e mut DeviceEndpoint<R>,
    features: u64,
}

impl<'e, R: RegisterIo> Transport<'e, R> {
    /// Reset the device and set ACKNOWLEDGE.
    pub fn begin(endpoint: &'e mut DeviceEndpoint<R>) -> Result<Self> {
        if !endpoint.set_status(DeviceStatus::RESET) {
            let actual = endpoint.get_status();
            log::warn!("VirtIO @ {:#x}: reset not accepted", endpoint.base());
            return Err(Error::StatusRejected {
                requested: 0,
                actual: actual.bits(),
            });
        }
        let mut transport = Self { endpoint, features: 0 };
        transport.advance(DeviceStatus::ACKNOWLEDGE)?;
        Ok(transport)
    }

    pub fn status(&self) -> DeviceStatus {
        self.endpoint.get_status()
    }

    /// Features accepted by the device in the last negotiation.
    pub fn features(&self) -> u64 {
        self.features
    }

    pub fn endpoint(&self) -> &DeviceEndpoint<R> {
        &*self.endpoint
    }

    pub fn endpoint_mut(&mut self) -> &mut DeviceEndpoint<R> {
        &mut *self.endpoint
    }

    /// Add one status bit on top of the current status.
    pub fn advance(&mut self, step: DeviceStatus) -> Result<()> {
        let current = self.endpoint.get_status();
        if current.contains(DeviceStatus::FAILED) {
            return Err(Error::DeviceFailed);
        }
        if let Some(required) = DeviceStatus::prerequisite(step) {
            if !current.contains(required) {
                return Err(Error::StatusOrder {
                    requested: step.bits(),
                    current: current.bits(),
                });
            }
        }

        let next = current | step;
        if !self.endpoint.set_status(next) {
            let actual = self.endpoint.get_status();
            self.fail();
            return Err(Error::StatusRejected {
                requested: next.bits(),
                actual: actual.bits(),
            });
        }
        Ok(())
    }

    /// Mark the device FAILED.
    pub fn fail(&mut self) {
        let status = self.endpoint.get_status() | DeviceStatus::FAILED;
        log::error!("VirtIO @ {:#x}: device initialization failed", self.endpoint.base());
        self.endpoint.set_status(status);
    }

    fn device_features(&mut self) -> u64 {
        let low = self.endpoint.get_features(0) as u64;
        let high = self.endpoint.get_features(1) as u64;
        (high << 32) | low
    }

    /// Negotiate `wanted | VERSION_1` against the device's offer and set
    /// FEATURES_OK. Returns the accepted feature set.
    pub fn negotiate_features(&mut self, wanted: u64) -> Result<u64> {
        let offered = self.device_features();
        if offered & VIRTIO_F_VERSION_1 == 0 {
            log::error!(
                "VirtIO @ {:#x}: device does not offer VERSION_1 ({:#x})",
                self.endpoint.base(),
                offered
            );
            self.fail();
            return Err(Error::UnsupportedVersion);
        }

        let accepted = (wanted | VIRTIO_F_VERSION_1) & offered;
        self.endpoint.set_features(0, accepted as u32);
        self.endpoint.set_features(1, (accepted >> 32) as u32);

        match self.advance(DeviceStatus::FEATURES_OK) {
            Ok(()) => {}
            Err(Error::StatusRejected { .. }) => return Err(Error::FeaturesRejected),
            Err(e) => return Err(e),
        }

        self.features = accepted;
        log::debug!(
            "VirtIO @ {:#x}: features {:#x}",
            self.endpoint.base(),
            accepted
        );
        Ok(accepted)
    }

    /// Set up queue `index` between FEATURES_OK and DRIVER_OK.
    ///
    /// A fatal queue error fails the device.
    pub fn setup_queue<H, Q, A>(
        &mut self,
        index: u16,
        requested: u16,
        buffer_size: usize,
        dma: &A,
    ) -> Result<Virtqueue<H, Q>>
    where
        H: WireFormat,
        Q: QueueTraits,
        A: DmaAllocator + ?Sized,
    {
        let status = self.endpoint.get_status();
        if !status.contains(DeviceStatus::FEATURES_OK) {
            return Err(Error::StatusOrder {
                requested: DeviceStatus::FEATURES_OK.bits(),
                current: status.bits(),
            });
        }
        Virtqueue::setup(&mut *self.endpoint, index, requested, buffer_size, dma).map_err(|e| {
            if e.is_fatal() {
                self.fail();
            }
            e
        })
    }

    /// Set DRIVER_OK; the device is live afterwards.
    pub fn finish(&mut self) -> Result<()> {
        self.advance(DeviceStatus::DRIVER_OK)?;
        log::info!(
            "VirtIO {} device @ {:#x} ready",
            self.endpoint.device_type(),
            self.endpoint.base()
        );
        Ok(())
    }
}

/// A concrete device driver running on top of the transport.
pub trait DeviceDriver {
    const DEVICE_TYPE: DeviceType;

    /// Feature bits requested in addition to VERSION_1.
    fn wanted_features(&self) -> u64 {
        0
    }

    /// Inspect a candidate after ACKNOWLEDGE. Returning false skips it.
    fn probe<R: RegisterIo>(&mut self, _endpoint: &mut DeviceEndpoint<R>) -> bool {
        true
    }

    /// Create the device's queues. Runs after FEATURES_OK.
    fn setup_queues<R: RegisterIo>(&mut self, transport: &mut Transport<'_, R>) -> Result<()>;
}

/// Run the full bring-up of `driver` on `endpoint`. Returns the accepted features.
pub fn bring_up<R, D>(endpoint: &mut DeviceEndpoint<R>, driver: &mut D) -> Result<u64>
where
    R: RegisterIo,
    D: DeviceDriver + ?Sized,
{
    let mut transport = Transport::begin(endpoint)?;
    if !driver.probe(transport.endpoint_mut()) {
        return Err(Error::DeviceNotFound);
    }
    transport.advance(DeviceStatus::DRIVER)?;
    let features = transport.negotiate_features(driver.wanted_features())?;
    if let Err(e) = driver.setup_queues(&mut transport) {
        if !transport.status().contains(DeviceStatus::FAILED) {
            transport.fail();
        }
        return Err(e);
    }
    transport.finish()?;
    Ok(features)
}

/// Walk leases of type `ty` until `accept` takes one.
///
/// Rejected candidates are released again, also when leasing the next one
/// fails. Fails with `DeviceNotFound` once the list is exhausted.
pub fn find_device<M, F>(session: &mut Session<'_, M>, ty: DeviceType, mut accept: F) -> Result<DeviceHandle>
where
    M: MmioMapper,
    F: FnMut(&mut DeviceEndpoint<M::Regs>) -> bool,
{
    let mut candidate = session.first_device(ty)?;
    while let Some(handle) = candidate {
        if accept(session.device_mut(handle)?) {
            return Ok(handle);
        }
        let next = session.next_device(handle);
        session.release_device(handle)?;
        candidate = next?;
    }
    log::warn!("No suitable VirtIO {} device found", ty);
    Err(Error::DeviceNotFound)
}

/// Lease and bring up the first device `driver` accepts.
pub fn attach<M, D>(session: &mut Session<'_, M>, driver: &mut D) -> Result<DeviceHandle>
where
    M: MmioMapper,
    D: DeviceDriver,
{
    find_device(session, D::DEVICE_TYPE, |endpoint| match bring_up(endpoint, &mut *driver) {
        Ok(_) => true,
        Err(e) => {
            log::warn!("VirtIO @ {:#x}: skipped ({})", endpoint.base(), e);
            false
        }
    })
}
