//! Interrupt endpoint streaming.
//!
//! An [`InterruptStream`] exists only inside an open session, at most
//! one at a time. It runs a dedicated reader thread that issues short
//! blocking reads and hands each received buffer to the registered
//! callback. The callback runs on the reader thread: it must forward
//! the data and return, never call back into the session (that path
//! would deadlock against the control thread serializing transitions).

use crate::backend::PlatformDevice;
use crate::error::PlatformError;
use crate::types::EndpointId;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for one blocking interrupt read. Kept short so stop and
/// control transfers are never held up for long.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Backoff after a transient read error.
const ERROR_BACKOFF: Duration = Duration::from_millis(5);

/// Callback receiving raw interrupt buffers, payload uninterpreted.
pub type DataCallback = Box<dyn Fn(Bytes) + Send + 'static>;

/// A running interrupt reader bound to one endpoint of the open
/// session's device.
pub struct InterruptStream {
    endpoint: EndpointId,
    running: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl InterruptStream {
    pub(crate) fn spawn<D: PlatformDevice>(
        device: Arc<D>,
        endpoint: EndpointId,
        buffer_size: usize,
        on_data: DataCallback,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let reader = std::thread::Builder::new()
            .name(format!("interrupt-{endpoint}"))
            .spawn(move || read_loop(device, endpoint, buffer_size, flag, on_data))
            .expect("failed to spawn interrupt reader thread");

        debug!(%endpoint, buffer_size, "interrupt stream started");
        Self {
            endpoint,
            running,
            reader: Some(reader),
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Abort-then-join. After this returns the callback will not run
    /// again; a read in flight at the moment of stop is dropped, never
    /// delivered.
    pub(crate) fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            warn!(endpoint = %self.endpoint, "interrupt reader panicked");
        }
        debug!(endpoint = %self.endpoint, "interrupt stream stopped");
    }
}

impl Drop for InterruptStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn read_loop<D: PlatformDevice>(
    device: Arc<D>,
    endpoint: EndpointId,
    buffer_size: usize,
    running: Arc<AtomicBool>,
    on_data: DataCallback,
) {
    let mut buf = vec![0u8; buffer_size];

    while running.load(Ordering::Acquire) {
        match device.read_interrupt(endpoint, &mut buf, READ_TIMEOUT) {
            Ok(0) => {}
            Ok(len) => {
                // Re-checked so a buffer completing during stop is
                // dropped rather than delivered after stop returns.
                if running.load(Ordering::Acquire) {
                    on_data(Bytes::copy_from_slice(&buf[..len]));
                }
            }
            Err(PlatformError::Timeout) => {}
            Err(PlatformError::NoDevice) => {
                debug!(%endpoint, "device gone, interrupt reader exiting");
                break;
            }
            Err(e) => {
                warn!(%endpoint, "interrupt read failed: {e}");
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    debug!(%endpoint, "interrupt reader exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PlatformBackend;
    use crate::testing::FakeBackend;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn delivers_injected_buffers_then_goes_quiet_after_stop() {
        let mut backend = FakeBackend::new();
        backend.add_device(0x1234, 0x5678, 0x0100);
        backend.inject_interrupt_data(&[1, 2, 3]);
        backend.inject_interrupt_data(&[4, 5]);

        let device = Arc::new(backend.open(0x1234, 0x5678).unwrap());
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();

        let stream = InterruptStream::spawn(
            device,
            EndpointId(0x83),
            256,
            Box::new(move |data| {
                assert!(!data.is_empty());
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while delivered.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 2);

        stream.stop();
        let after_stop = delivered.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(delivered.load(Ordering::SeqCst), after_stop);
    }
}
