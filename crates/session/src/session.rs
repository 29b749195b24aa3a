//! Device session state machine.
//!
//! At most one session exists at a time. It is either `Closed` or
//! `Open`, and the open state exclusively owns the platform handle; no
//! other component may hold or close it. Stream presence is part of
//! the open state itself, so a toggle flag can never disagree with the
//! resource it describes.
//!
//! Callers must serialize all transitions (connect, disconnect,
//! transfers, stream toggles) — in this crate that owner is the
//! control thread in [`crate::worker`].

use crate::backend::{PlatformBackend, PlatformDevice};
use crate::error::{ConnectError, PlatformError, StreamError, TransferError};
use crate::stream::InterruptStream;
use crate::types::{DeviceKey, EndpointId, SessionInfo, TransferOutcome, TransferRequest};
use bytes::Bytes;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration selected on connect. The vendor devices this tool
/// targets are single-configuration.
const ACTIVE_CONFIG: u8 = 1;

/// Interface claimed on connect, unconditionally: single-interface
/// vendor devices.
const CLAIMED_INTERFACE: u8 = 0;

/// Default wait for control transfers.
const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

enum SessionState<D: PlatformDevice> {
    Closed,
    Open(OpenSession<D>),
}

struct OpenSession<D: PlatformDevice> {
    device: Arc<D>,
    info: SessionInfo,
    stream: Option<InterruptStream>,
}

/// The single device session.
pub struct Session<D: PlatformDevice> {
    state: SessionState<D>,
    transfer_timeout: Duration,
}

impl<D: PlatformDevice> Session<D> {
    pub fn new() -> Self {
        Self {
            state: SessionState::Closed,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }

    pub fn with_transfer_timeout(timeout: Duration) -> Self {
        Self {
            state: SessionState::Closed,
            transfer_timeout: timeout,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open(_))
    }

    pub fn is_streaming(&self) -> bool {
        matches!(&self.state, SessionState::Open(open) if open.stream.is_some())
    }

    /// Key of the currently open device, used to re-validate the
    /// session against a fresh directory snapshot.
    pub fn open_key(&self) -> Option<&DeviceKey> {
        match &self.state {
            SessionState::Open(open) => Some(&open.info.key),
            SessionState::Closed => None,
        }
    }

    pub fn info(&self) -> Option<&SessionInfo> {
        match &self.state {
            SessionState::Open(open) => Some(&open.info),
            SessionState::Closed => None,
        }
    }

    /// `Closed -> Open`. Opens the first device matching the id pair,
    /// then selects the configuration and claims the interface as one
    /// atomic step: if either is rejected the handle is closed before
    /// the error surfaces, so a failed connect never leaks a handle.
    pub fn connect<B: PlatformBackend<Device = D>>(
        &mut self,
        backend: &B,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<SessionInfo, ConnectError> {
        if self.is_open() {
            return Err(ConnectError::Busy);
        }

        let device = backend.open(vendor_id, product_id).map_err(|e| {
            debug!("open {vendor_id:04x}:{product_id:04x} failed: {e}");
            ConnectError::NotFound
        })?;

        if let Err(e) = device
            .set_configuration(ACTIVE_CONFIG)
            .and_then(|()| device.claim_interface(CLAIMED_INTERFACE))
        {
            warn!("claim failed for {vendor_id:04x}:{product_id:04x}: {e}");
            device.close();
            return Err(ConnectError::ClaimFailed(e));
        }

        let info = SessionInfo {
            key: device.key(),
            vendor_id,
            product_id,
            active_config: ACTIVE_CONFIG,
            claimed_interface: CLAIMED_INTERFACE,
        };
        info!(key = %info.key, "session open for {vendor_id:04x}:{product_id:04x}");

        self.state = SessionState::Open(OpenSession {
            device: Arc::new(device),
            info: info.clone(),
            stream: None,
        });
        Ok(info)
    }

    /// `Open -> Closed`; a no-op when already closed. Teardown order is
    /// fixed: stream, then interface, then handle. Release and close
    /// failures are logged, not propagated — the caller cannot act on
    /// them and the session always ends Closed.
    pub fn disconnect(&mut self) {
        match mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Closed => {}
            SessionState::Open(mut open) => {
                if let Some(stream) = open.stream.take() {
                    stream.stop();
                }
                if let Err(e) = open.device.release_interface(open.info.claimed_interface) {
                    warn!(key = %open.info.key, "failed to release interface: {e}");
                }
                open.device.close();
                info!(key = %open.info.key, "session closed");
            }
        }
    }

    /// Execute one vendor control transfer. The request shape alone
    /// determines direction and data-stage length; all three shapes go
    /// through the same pair of platform primitives. A stall from the
    /// device is a normal `accepted = false` outcome, not an error.
    pub fn control_transfer(
        &mut self,
        request: TransferRequest,
    ) -> Result<TransferOutcome, TransferError> {
        let open = match &self.state {
            SessionState::Open(open) => open,
            SessionState::Closed => return Err(TransferError::SessionClosed),
        };
        let timeout = self.transfer_timeout;

        let result = match &request {
            TransferRequest::NoData { request, value } => open
                .device
                .control_out(*request, *value, &[], timeout)
                .map(|_| TransferOutcome::acknowledged()),
            TransferRequest::Write { request, payload } => open
                .device
                .control_out(*request, 0, payload, timeout)
                .map(|_| TransferOutcome::acknowledged()),
            TransferRequest::Read { request, capacity } => {
                let mut buf = vec![0u8; *capacity];
                open.device
                    .control_in(*request, 0, &mut buf, timeout)
                    .map(|len| {
                        buf.truncate(len);
                        TransferOutcome::with_data(Bytes::from(buf))
                    })
            }
        };

        match result {
            Ok(outcome) => {
                debug!(
                    request = request.request_code(),
                    bytes = outcome.data.len(),
                    "control transfer ok"
                );
                Ok(outcome)
            }
            Err(PlatformError::Stall) => {
                debug!(request = request.request_code(), "control transfer stalled");
                Ok(TransferOutcome::stalled())
            }
            Err(e) => {
                warn!(
                    request = request.request_code(),
                    "control transfer failed: {e}"
                );
                Err(TransferError::Platform(e))
            }
        }
    }

    /// No-data transfer; `value` rides in the setup packet. `Ok(false)`
    /// means the device refused the request.
    pub fn send_no_data(&mut self, request: u8, value: u16) -> Result<bool, TransferError> {
        self.control_transfer(TransferRequest::NoData { request, value })
            .map(|outcome| outcome.accepted)
    }

    /// Write transfer; the data stage carries the full payload.
    pub fn send_write(&mut self, request: u8, payload: Bytes) -> Result<bool, TransferError> {
        self.control_transfer(TransferRequest::Write { request, payload })
            .map(|outcome| outcome.accepted)
    }

    /// Read transfer of up to `capacity` bytes; returns what the device
    /// actually sent.
    pub fn send_read(&mut self, request: u8, capacity: usize) -> Result<Bytes, TransferError> {
        let outcome = self.control_transfer(TransferRequest::Read { request, capacity })?;
        if outcome.accepted {
            Ok(outcome.data)
        } else {
            Err(TransferError::Rejected)
        }
    }

    /// Enable continuous interrupt reads on `endpoint`. Starting while
    /// a stream exists is an error, not a silent restart.
    pub fn start_stream<F>(
        &mut self,
        endpoint: EndpointId,
        buffer_size: usize,
        on_data: F,
    ) -> Result<(), StreamError>
    where
        F: Fn(Bytes) + Send + 'static,
    {
        let open = match &mut self.state {
            SessionState::Open(open) => open,
            SessionState::Closed => return Err(StreamError::SessionClosed),
        };
        if open.stream.is_some() {
            return Err(StreamError::AlreadyStreaming);
        }
        if !endpoint.is_in() {
            return Err(StreamError::Platform(PlatformError::InvalidParam));
        }

        open.stream = Some(InterruptStream::spawn(
            open.device.clone(),
            endpoint,
            buffer_size,
            Box::new(on_data),
        ));
        info!(%endpoint, "interrupt stream enabled");
        Ok(())
    }

    /// Disable the interrupt stream. Safe on both the explicit toggle
    /// path and disconnect's implicit teardown; stopping while stopped
    /// is an error, not a silent no-op.
    pub fn stop_stream(&mut self) -> Result<(), StreamError> {
        let open = match &mut self.state {
            SessionState::Open(open) => open,
            SessionState::Closed => return Err(StreamError::SessionClosed),
        };
        match open.stream.take() {
            Some(stream) => {
                stream.stop();
                info!("interrupt stream disabled");
                Ok(())
            }
            None => Err(StreamError::NotStreaming),
        }
    }
}

impl<D: PlatformDevice> Default for Session<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeDevice};

    fn session() -> Session<FakeDevice> {
        Session::new()
    }

    #[test]
    fn connect_then_disconnect() {
        let mut backend = FakeBackend::new();
        backend.add_device(0x1234, 0x5678, 0x0100);

        let mut session = session();
        assert!(!session.is_open());

        let info = session.connect(&backend, 0x1234, 0x5678).unwrap();
        assert!(session.is_open());
        assert_eq!(info.vendor_id, 0x1234);
        assert_eq!(info.active_config, 1);
        assert_eq!(info.claimed_interface, 0);

        session.disconnect();
        assert!(!session.is_open());
    }

    #[test]
    fn connect_unknown_device_is_not_found() {
        let backend = FakeBackend::new();
        let mut session = session();

        let err = session.connect(&backend, 0x1234, 0x5678).unwrap_err();
        assert_eq!(err, ConnectError::NotFound);
        assert!(!session.is_open());
    }

    #[test]
    fn connect_while_open_is_busy() {
        let mut backend = FakeBackend::new();
        backend.add_device(0x1234, 0x5678, 0x0100);

        let mut session = session();
        session.connect(&backend, 0x1234, 0x5678).unwrap();
        let err = session.connect(&backend, 0x1234, 0x5678).unwrap_err();
        assert_eq!(err, ConnectError::Busy);
        assert!(session.is_open());
    }

    #[test]
    fn transfer_requires_open_session() {
        let mut session = session();
        let err = session.send_no_data(0x01, 0).unwrap_err();
        assert_eq!(err, TransferError::SessionClosed);
    }

    #[test]
    fn stalled_write_is_a_normal_false() {
        let mut backend = FakeBackend::new();
        backend.add_device(0x1234, 0x5678, 0x0100);
        backend.stall_transfers(true);

        let mut session = session();
        session.connect(&backend, 0x1234, 0x5678).unwrap();
        assert_eq!(session.send_no_data(0x01, 7), Ok(false));
    }
}
