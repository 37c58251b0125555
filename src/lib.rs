#![cfg_attr(not(test), no_std)]

//! VirtIO-MMIO bus enumeration, device arbitration and split-virtqueue
//! transport.
//!
//! ```text
//! bus::scan ──> arbiter::Registry ──> Session::first_device
//!                                          │
//!                                   DeviceEndpoint ──> driver::Transport
//!                                          │                 │
//!                                   irq::InterruptRelay <── queue::Virtqueue
//! ```

extern crate alloc;

pub mod arbiter;
pub mod bus;
pub mod completion;
pub mod config;
pub mod emul;
pub mod error;
pub mod virtio;

pub use arbiter::{DeviceHandle, Registry, Session};
pub use bus::{BusConfig, DeviceDescription, DeviceList};
pub use error::{Error, Result};
