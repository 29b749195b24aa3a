//! libusb (rusb) backend.
//!
//! Enumeration reads cached descriptors plus best-effort string
//! descriptors, open goes by vid/pid the way the platform primitive
//! does, and hot-plug events come from a `HotplugBuilder` registration
//! that stays alive for the lifetime of the backend.

use crate::backend::{HotplugEvent, PlatformBackend, PlatformDevice};
use crate::error::PlatformError;
use crate::types::{DeviceDescriptor, DeviceKey, DriverClass, EndpointId};
use rusb::{Context, Device, Direction, Hotplug, HotplugBuilder, Recipient, Registration,
    RequestType, UsbContext};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// libusb-backed platform implementation.
pub struct LibusbBackend {
    context: Context,
    /// Keeps the hot-plug callback registered while the backend lives.
    _hotplug_registration: Option<Registration<Context>>,
}

impl LibusbBackend {
    pub fn new() -> Result<Self, PlatformError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            context,
            _hotplug_registration: None,
        })
    }
}

impl PlatformBackend for LibusbBackend {
    type Device = LibusbDevice;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, PlatformError> {
        let devices = self.context.devices().map_err(map_rusb_error)?;

        let mut entries = Vec::new();
        for device in devices.iter() {
            match describe(&device) {
                Ok(Some(descriptor)) => entries.push(descriptor),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        bus = device.bus_number(),
                        addr = device.address(),
                        "failed to describe device: {e}"
                    );
                }
            }
        }

        debug!("enumerated {} devices", entries.len());
        Ok(entries)
    }

    fn open(&self, vendor_id: u16, product_id: u16) -> Result<LibusbDevice, PlatformError> {
        let mut handle = self
            .context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(PlatformError::NotFound)?;

        // Best effort; unsupported on some platforms and harmless there.
        let _ = handle.set_auto_detach_kernel_driver(true);

        let key = device_key(&handle.device());
        debug!(%key, "opened device {vendor_id:04x}:{product_id:04x}");

        Ok(LibusbDevice {
            key,
            handle: Mutex::new(handle),
        })
    }

    fn watch_hotplug(
        &mut self,
        sender: async_channel::Sender<HotplugEvent>,
    ) -> Result<(), PlatformError> {
        if !rusb::has_hotplug() {
            return Err(PlatformError::Other(
                "hot-plug notifications not supported on this platform".into(),
            ));
        }

        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { sender }))
            .map_err(map_rusb_error)?;

        self._hotplug_registration = Some(registration);
        debug!("hot-plug callbacks registered");
        Ok(())
    }

    fn poll_events(&self, timeout: Duration) -> Result<(), PlatformError> {
        self.context
            .handle_events(Some(timeout))
            .map_err(map_rusb_error)
    }
}

/// An opened libusb device handle.
///
/// rusb needs `&mut` for configuration and interface calls, so the
/// handle lives behind a mutex. Interrupt reads hold that lock for the
/// duration of one read; the stream loop keeps its read timeout short
/// so control transfers are never starved for long.
pub struct LibusbDevice {
    key: DeviceKey,
    handle: Mutex<rusb::DeviceHandle<Context>>,
}

impl PlatformDevice for LibusbDevice {
    fn key(&self) -> DeviceKey {
        self.key.clone()
    }

    fn set_configuration(&self, config: u8) -> Result<(), PlatformError> {
        self.handle
            .lock()
            .unwrap()
            .set_active_configuration(config)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), PlatformError> {
        self.handle
            .lock()
            .unwrap()
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&self, interface: u8) -> Result<(), PlatformError> {
        self.handle
            .lock()
            .unwrap()
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle
            .lock()
            .unwrap()
            .write_control(request_type, request, value, 0, payload, timeout)
            .map_err(map_rusb_error)
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        self.handle
            .lock()
            .unwrap()
            .read_control(request_type, request, value, 0, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn read_interrupt(
        &self,
        endpoint: EndpointId,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError> {
        self.handle
            .lock()
            .unwrap()
            .read_interrupt(endpoint.0, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn close(&self) {
        // The libusb handle closes when the last Arc clone drops; this
        // is the point where the session gives up ownership.
        debug!(key = %self.key, "closed device");
    }
}

/// Forwards libusb hot-plug callbacks into the worker's channel.
struct HotplugForwarder {
    sender: async_channel::Sender<HotplugEvent>,
}

impl<T: UsbContext> Hotplug<T> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            bus = device.bus_number(),
            addr = device.address(),
            "hot-plug: device arrived"
        );
        // Must not block inside the event loop; a full queue just
        // coalesces into the refresh triggered by an earlier event.
        if self.sender.try_send(HotplugEvent::Arrived).is_err() {
            debug!("hot-plug queue full, arrival coalesced");
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            bus = device.bus_number(),
            addr = device.address(),
            "hot-plug: device left"
        );
        if self.sender.try_send(HotplugEvent::Left).is_err() {
            debug!("hot-plug queue full, removal coalesced");
        }
    }
}

fn device_key<T: UsbContext>(device: &Device<T>) -> DeviceKey {
    DeviceKey(format!("{:03}:{:03}", device.bus_number(), device.address()))
}

/// Build a directory entry for one enumerated device. Returns `None`
/// for root hubs, which are bus infrastructure rather than something
/// this tool can talk to.
fn describe(device: &Device<Context>) -> Result<Option<DeviceDescriptor>, rusb::Error> {
    let desc = device.device_descriptor()?;

    // Root hubs: VID 0x1d6b (Linux Foundation) with device class 9 (Hub).
    if desc.vendor_id() == 0x1d6b && desc.class_code() == 9 {
        return Ok(None);
    }

    // String descriptors need an open handle; skip them when the open
    // is refused rather than dropping the device from the snapshot.
    let (product, manufacturer) = match device.open() {
        Ok(handle) => {
            let product = desc
                .product_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
            let manufacturer = desc
                .manufacturer_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
            (product, manufacturer)
        }
        Err(_) => (None, None),
    };

    Ok(Some(DeviceDescriptor {
        key: device_key(device),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        revision: bcd_revision(desc.device_version()),
        name: product.unwrap_or_else(|| {
            format!(
                "USB device {:04x}:{:04x}",
                desc.vendor_id(),
                desc.product_id()
            )
        }),
        manufacturer,
        driver_class: DriverClass::LibUsb,
    }))
}

/// Reassemble the bcdDevice field from rusb's split version.
fn bcd_revision(version: rusb::Version) -> u16 {
    ((version.major() as u16) << 8)
        | (((version.minor() as u16) & 0xf) << 4)
        | ((version.sub_minor() as u16) & 0xf)
}

/// Map rusb errors onto the backend-neutral taxonomy.
pub(crate) fn map_rusb_error(err: rusb::Error) -> PlatformError {
    match err {
        rusb::Error::Timeout => PlatformError::Timeout,
        rusb::Error::Pipe => PlatformError::Stall,
        rusb::Error::NoDevice => PlatformError::NoDevice,
        rusb::Error::NotFound => PlatformError::NotFound,
        rusb::Error::Busy => PlatformError::Busy,
        rusb::Error::Access => PlatformError::Access,
        rusb::Error::Overflow => PlatformError::Overflow,
        rusb::Error::Io => PlatformError::Io,
        rusb::Error::InvalidParam => PlatformError::InvalidParam,
        _ => PlatformError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), PlatformError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), PlatformError::Stall);
        assert_eq!(
            map_rusb_error(rusb::Error::NoDevice),
            PlatformError::NoDevice
        );
        assert_eq!(
            map_rusb_error(rusb::Error::NotFound),
            PlatformError::NotFound
        );
    }

    #[test]
    fn test_bcd_revision() {
        assert_eq!(bcd_revision(rusb::Version(1, 0, 0)), 0x0100);
        assert_eq!(bcd_revision(rusb::Version(2, 1, 3)), 0x0213);
    }
}
