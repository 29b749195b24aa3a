//! Platform backend abstraction.
//!
//! The session core talks to the host USB stack exclusively through
//! these traits, so the state machine can be exercised against the
//! fake in [`crate::testing`]. [`libusb`] provides the real
//! implementation.

pub mod libusb;

use crate::error::PlatformError;
use crate::types::{DeviceDescriptor, DeviceKey, EndpointId};
use std::time::Duration;

/// Arrive/leave notification pushed by the platform.
///
/// Carries no device identity on purpose: any event triggers a full
/// directory refresh and session re-validation, so the core never has
/// to trust a stale identity from the notification path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived,
    Left,
}

/// Host-side USB stack: enumeration, open-by-id, hot-plug delivery.
pub trait PlatformBackend: Send + 'static {
    type Device: PlatformDevice;

    /// Enumerate all currently present devices, in platform order.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, PlatformError>;

    /// Open the first device matching the id pair.
    fn open(&self, vendor_id: u16, product_id: u16) -> Result<Self::Device, PlatformError>;

    /// Register for arrive/leave notifications, delivered on `sender`.
    ///
    /// The delivery side must never block: notifications are enqueued
    /// with `try_send` and may coalesce when the queue is full.
    fn watch_hotplug(
        &mut self,
        sender: async_channel::Sender<HotplugEvent>,
    ) -> Result<(), PlatformError>;

    /// Pump platform callbacks for at most `timeout`.
    fn poll_events(&self, timeout: Duration) -> Result<(), PlatformError>;
}

/// An opened device handle.
///
/// The session is the sole owner; the interrupt stream sees the handle
/// only through an `Arc` clone handed out by the session, and nothing
/// else may hold or close it.
pub trait PlatformDevice: Send + Sync + 'static {
    /// The stable key of the physical device behind this handle.
    fn key(&self) -> DeviceKey;

    fn set_configuration(&self, config: u8) -> Result<(), PlatformError>;
    fn claim_interface(&self, interface: u8) -> Result<(), PlatformError>;
    fn release_interface(&self, interface: u8) -> Result<(), PlatformError>;

    /// Vendor-class, device-recipient control transfer with an OUT (or
    /// zero-length) data stage. Returns the bytes written.
    fn control_out(
        &self,
        request: u8,
        value: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError>;

    /// Vendor-class, device-recipient control transfer with an IN data
    /// stage. Returns the bytes read into `buf`.
    fn control_in(
        &self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError>;

    /// Blocking interrupt read on `endpoint`.
    fn read_interrupt(
        &self,
        endpoint: EndpointId,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError>;

    /// Called exactly once per opened handle, on session teardown,
    /// after the interface has been released.
    fn close(&self);
}
