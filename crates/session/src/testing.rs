//! Fake platform backend for exercising the session state machine.
//!
//! The fake records every open/close/claim/release and every control
//! transfer it sees, so tests can assert call-count parity and inspect
//! the exact data stage a transfer produced. Interrupt data and
//! hot-plug events are injected by the test; failures are scripted per
//! operation.

use crate::backend::{HotplugEvent, PlatformBackend, PlatformDevice};
use crate::error::PlatformError;
use crate::types::{DeviceDescriptor, DeviceKey, DriverClass, EndpointId};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Direction of a recorded control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Out,
    In,
}

/// One control transfer as the fake device saw it.
#[derive(Debug, Clone)]
pub struct RecordedTransfer {
    pub request: u8,
    pub value: u16,
    pub direction: TransferDirection,
    /// Data stage for out transfers; empty for in and no-data shapes.
    pub payload: Vec<u8>,
}

#[derive(Default)]
#[derive(Debug)]
struct FakeState {
    devices: Vec<DeviceDescriptor>,
    next_device: u32,

    open_calls: u32,
    close_calls: u32,
    claim_calls: u32,
    release_calls: u32,
    claimed_interfaces: Vec<u8>,

    fail_open: bool,
    fail_configuration: bool,
    fail_claim: bool,
    stall_transfers: bool,
    transfer_error: Option<PlatformError>,

    read_response: Vec<u8>,
    recorded: Vec<RecordedTransfer>,
    interrupt_queue: VecDeque<Bytes>,

    hotplug_tx: Option<async_channel::Sender<HotplugEvent>>,
}

/// Scripted in-memory platform. Clone it before handing one copy to a
/// worker thread; all clones share the same state.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the enumerable set. Returns its key.
    pub fn add_device(&mut self, vendor_id: u16, product_id: u16, revision: u16) -> DeviceKey {
        let mut state = self.state.lock().unwrap();
        let n = state.next_device;
        state.next_device += 1;

        let key = DeviceKey(format!("fake-{n}"));
        state.devices.push(DeviceDescriptor {
            key: key.clone(),
            vendor_id,
            product_id,
            revision,
            name: format!("Fake Device {n}"),
            manufacturer: Some("Acme Test Gear".into()),
            driver_class: DriverClass::LibUsb,
        });
        key
    }

    /// Push a second entry with an already-used key, for exercising the
    /// directory's unique-key invariant.
    pub fn add_duplicate_of(&mut self, key: &DeviceKey) {
        let mut state = self.state.lock().unwrap();
        let duplicate = state
            .devices
            .iter()
            .find(|d| &d.key == key)
            .expect("no device with that key")
            .clone();
        state.devices.push(duplicate);
    }

    pub fn remove_device(&mut self, key: &DeviceKey) {
        let mut state = self.state.lock().unwrap();
        state.devices.retain(|d| &d.key != key);
    }

    /// Add a device and deliver an arrival notification.
    pub fn emit_arrival(&mut self, vendor_id: u16, product_id: u16, revision: u16) -> DeviceKey {
        let key = self.add_device(vendor_id, product_id, revision);
        self.notify(HotplugEvent::Arrived);
        key
    }

    /// Remove a device and deliver a leave notification.
    pub fn emit_removal(&mut self, key: &DeviceKey) {
        self.remove_device(key);
        self.notify(HotplugEvent::Left);
    }

    fn notify(&self, event: HotplugEvent) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = &state.hotplug_tx {
            let _ = tx.try_send(event);
        }
    }

    pub fn fail_open(&mut self, fail: bool) {
        self.state.lock().unwrap().fail_open = fail;
    }

    pub fn fail_configuration(&mut self, fail: bool) {
        self.state.lock().unwrap().fail_configuration = fail;
    }

    pub fn fail_claim(&mut self, fail: bool) {
        self.state.lock().unwrap().fail_claim = fail;
    }

    /// Make the device stall every control transfer.
    pub fn stall_transfers(&mut self, stall: bool) {
        self.state.lock().unwrap().stall_transfers = stall;
    }

    /// Make every control transfer fail with this platform error.
    pub fn fail_transfers_with(&mut self, error: PlatformError) {
        self.state.lock().unwrap().transfer_error = Some(error);
    }

    /// Bytes the device answers read transfers with.
    pub fn set_read_response(&mut self, data: &[u8]) {
        self.state.lock().unwrap().read_response = data.to_vec();
    }

    /// Queue one interrupt buffer; reads drain the queue in order and
    /// block (time out) once it is empty.
    pub fn inject_interrupt_data(&mut self, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .interrupt_queue
            .push_back(Bytes::copy_from_slice(data));
    }

    pub fn open_calls(&self) -> u32 {
        self.state.lock().unwrap().open_calls
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().unwrap().close_calls
    }

    pub fn claim_calls(&self) -> u32 {
        self.state.lock().unwrap().claim_calls
    }

    pub fn release_calls(&self) -> u32 {
        self.state.lock().unwrap().release_calls
    }

    /// Interfaces currently claimed and not yet released.
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        self.state.lock().unwrap().claimed_interfaces.clone()
    }

    pub fn recorded_transfers(&self) -> Vec<RecordedTransfer> {
        self.state.lock().unwrap().recorded.clone()
    }
}

impl PlatformBackend for FakeBackend {
    type Device = FakeDevice;

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, PlatformError> {
        Ok(self.state.lock().unwrap().devices.clone())
    }

    fn open(&self, vendor_id: u16, product_id: u16) -> Result<FakeDevice, PlatformError> {
        let mut state = self.state.lock().unwrap();

        let key = state
            .devices
            .iter()
            .find(|d| d.vendor_id == vendor_id && d.product_id == product_id)
            .map(|d| d.key.clone())
            .ok_or(PlatformError::NotFound)?;

        if state.fail_open {
            return Err(PlatformError::Access);
        }

        state.open_calls += 1;
        Ok(FakeDevice {
            key,
            state: self.state.clone(),
        })
    }

    fn watch_hotplug(
        &mut self,
        sender: async_channel::Sender<HotplugEvent>,
    ) -> Result<(), PlatformError> {
        self.state.lock().unwrap().hotplug_tx = Some(sender);
        Ok(())
    }

    fn poll_events(&self, timeout: Duration) -> Result<(), PlatformError> {
        // Nothing to pump; keep the control loop responsive in tests.
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(())
    }
}

/// Handle produced by [`FakeBackend::open`].
#[derive(Debug)]
pub struct FakeDevice {
    key: DeviceKey,
    state: Arc<Mutex<FakeState>>,
}

impl PlatformDevice for FakeDevice {
    fn key(&self) -> DeviceKey {
        self.key.clone()
    }

    fn set_configuration(&self, _config: u8) -> Result<(), PlatformError> {
        let state = self.state.lock().unwrap();
        if state.fail_configuration {
            return Err(PlatformError::Busy);
        }
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.claim_calls += 1;
        if state.fail_claim {
            return Err(PlatformError::Busy);
        }
        state.claimed_interfaces.push(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.release_calls += 1;
        state.claimed_interfaces.retain(|i| *i != interface);
        Ok(())
    }

    fn control_out(
        &self,
        request: u8,
        value: u16,
        payload: &[u8],
        _timeout: Duration,
    ) -> Result<usize, PlatformError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.transfer_error.clone() {
            return Err(error);
        }

        state.recorded.push(RecordedTransfer {
            request,
            value,
            direction: TransferDirection::Out,
            payload: payload.to_vec(),
        });

        if state.stall_transfers {
            return Err(PlatformError::Stall);
        }
        Ok(payload.len())
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, PlatformError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.transfer_error.clone() {
            return Err(error);
        }

        state.recorded.push(RecordedTransfer {
            request,
            value,
            direction: TransferDirection::In,
            payload: Vec::new(),
        });

        if state.stall_transfers {
            return Err(PlatformError::Stall);
        }

        let n = state.read_response.len().min(buf.len());
        buf[..n].copy_from_slice(&state.read_response[..n]);
        Ok(n)
    }

    fn read_interrupt(
        &self,
        _endpoint: EndpointId,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, PlatformError> {
        // Don't hold the lock while simulating the blocking wait.
        let next = self.state.lock().unwrap().interrupt_queue.pop_front();

        match next {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => {
                std::thread::sleep(timeout);
                Err(PlatformError::Timeout)
            }
        }
    }

    fn close(&self) {
        self.state.lock().unwrap().close_calls += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_a_matching_device() {
        let mut backend = FakeBackend::new();
        backend.add_device(0x1234, 0x5678, 0x0100);

        assert!(backend.open(0x1234, 0x5678).is_ok());
        assert_eq!(backend.open(0x9999, 0x9999).unwrap_err(), PlatformError::NotFound);
        assert_eq!(backend.open_calls(), 1);
    }

    #[test]
    fn transfers_are_recorded() {
        let mut backend = FakeBackend::new();
        backend.add_device(0x1234, 0x5678, 0x0100);
        backend.set_read_response(b"hello");

        let device = backend.open(0x1234, 0x5678).unwrap();
        device
            .control_out(0x02, 0, b"AB", Duration::from_secs(1))
            .unwrap();

        let mut buf = [0u8; 16];
        let n = device
            .control_in(0x03, 0, &mut buf, Duration::from_secs(1))
            .unwrap();
        assert_eq!(&buf[..n], b"hello");

        let recorded = backend.recorded_transfers();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].direction, TransferDirection::Out);
        assert_eq!(recorded[0].payload, b"AB");
        assert_eq!(recorded[1].direction, TransferDirection::In);
    }
}
