//! Core value types: directory entries, transfer shapes, session info.

use bytes::Bytes;
use std::fmt;

/// Stable, handle-independent key identifying a physical device across
/// directory refreshes.
///
/// Backends generate these; the core and the shell only compare and
/// display them. Entry positions in a directory snapshot are not stable
/// across refreshes, keys are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey(pub String);

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Which backend driver class a device is reachable through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverClass {
    LibUsb,
    WinUsb,
}

impl fmt::Display for DriverClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverClass::LibUsb => f.write_str("LibUsb"),
            DriverClass::WinUsb => f.write_str("WinUsb"),
        }
    }
}

/// Immutable snapshot entry describing one enumerated device.
///
/// Built on every directory refresh and superseded wholesale by the
/// next one; nothing mutates an existing descriptor.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub key: DeviceKey,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Device revision (bcdDevice).
    pub revision: u16,
    /// Product string when readable, otherwise a synthesized name.
    pub name: String,
    pub manufacturer: Option<String>,
    pub driver_class: DriverClass,
}

impl DeviceDescriptor {
    /// The `VID_xxxx PID_xxxx REV_xxxx` label shown in device listings.
    pub fn id_label(&self) -> String {
        format!(
            "VID_{:04X} PID_{:04X} REV_{:04X}",
            self.vendor_id, self.product_id, self.revision
        )
    }
}

/// Endpoint address, direction bit included (e.g. `0x83` for IN
/// endpoint 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub u8);

impl EndpointId {
    pub const DIRECTION_IN: u8 = 0x80;

    /// True for device-to-host endpoints.
    pub fn is_in(self) -> bool {
        self.0 & Self::DIRECTION_IN != 0
    }

    /// Endpoint number without the direction bit.
    pub fn number(self) -> u8 {
        self.0 & 0x0f
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// One vendor control transfer, constructed and consumed within a
/// single call. The shape alone determines direction and data-stage
/// length of the setup packet.
#[derive(Debug, Clone)]
pub enum TransferRequest {
    /// Zero-length data stage; `value` rides in the setup packet's
    /// wValue field.
    NoData { request: u8, value: u16 },
    /// Host-to-device data stage carrying `payload`.
    Write { request: u8, payload: Bytes },
    /// Device-to-host data stage of at most `capacity` bytes.
    Read { request: u8, capacity: usize },
}

impl TransferRequest {
    /// The vendor request code (bRequest).
    pub fn request_code(&self) -> u8 {
        match self {
            TransferRequest::NoData { request, .. }
            | TransferRequest::Write { request, .. }
            | TransferRequest::Read { request, .. } => *request,
        }
    }
}

/// Result of a control transfer that reached the device.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// False when the device stalled the request. A stall is a normal
    /// outcome, not an error.
    pub accepted: bool,
    /// Bytes returned by a read data stage; empty for out transfers.
    pub data: Bytes,
}

impl TransferOutcome {
    pub(crate) fn acknowledged() -> Self {
        Self {
            accepted: true,
            data: Bytes::new(),
        }
    }

    pub(crate) fn stalled() -> Self {
        Self {
            accepted: false,
            data: Bytes::new(),
        }
    }

    pub(crate) fn with_data(data: Bytes) -> Self {
        Self {
            accepted: true,
            data,
        }
    }
}

/// Details of the open session, returned by a successful connect.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: DeviceKey,
    pub vendor_id: u16,
    pub product_id: u16,
    pub active_config: u8,
    pub claimed_interface: u8,
}
