//! Session control thread.
//!
//! One blocking OS thread owns the backend, the directory, and the
//! session, so no two state transitions can ever interleave. The loop
//! alternates between draining shell commands, pumping platform
//! callbacks, and reconciling hot-plug notifications against the
//! session and the directory.

use crate::backend::{HotplugEvent, PlatformBackend};
use crate::channel::{SessionCommand, SessionEvent, SessionWorker};
use crate::directory::DeviceDirectory;
use crate::error::PlatformError;
use crate::session::Session;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one iteration may spend inside the platform event pump.
const EVENT_POLL_BUDGET: Duration = Duration::from_millis(100);

/// The control thread state: backend, directory, session, and the
/// blocking half of the channel bridge.
pub struct SessionWorkerThread<B: PlatformBackend> {
    backend: B,
    session: Session<B::Device>,
    directory: DeviceDirectory,
    worker: SessionWorker,
    hotplug_rx: async_channel::Receiver<HotplugEvent>,
}

impl<B: PlatformBackend> SessionWorkerThread<B> {
    pub fn new(backend: B, worker: SessionWorker) -> crate::Result<Self> {
        Self::with_session(backend, worker, Session::new())
    }

    pub fn with_transfer_timeout(
        backend: B,
        worker: SessionWorker,
        timeout: Duration,
    ) -> crate::Result<Self> {
        Self::with_session(backend, worker, Session::with_transfer_timeout(timeout))
    }

    fn with_session(
        mut backend: B,
        worker: SessionWorker,
        session: Session<B::Device>,
    ) -> crate::Result<Self> {
        let (hotplug_tx, hotplug_rx) = async_channel::bounded(64);
        // Some platforms cannot deliver hot-plug events; the analyzer
        // still works there, just without automatic refreshes.
        if let Err(e) = backend.watch_hotplug(hotplug_tx) {
            warn!("hot-plug notifications unavailable: {e}");
        }

        let directory = DeviceDirectory::capture(&backend)?;
        info!("control thread initialized with {} devices", directory.len());

        Ok(Self {
            backend,
            session,
            directory,
            worker,
            hotplug_rx,
        })
    }

    /// Run the control loop until a `Shutdown` command arrives.
    pub fn run(mut self) -> crate::Result<()> {
        info!("session control thread started");

        // First snapshot for the shell to render.
        self.send_event(SessionEvent::DirectoryChanged(self.directory.clone()));

        loop {
            match self.worker.try_recv_command() {
                Some(SessionCommand::Shutdown) => {
                    info!("control thread shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            if let Err(e) = self.backend.poll_events(EVENT_POLL_BUDGET) {
                warn!("error pumping platform events: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }

            while let Ok(event) = self.hotplug_rx.try_recv() {
                self.handle_hotplug(event);
            }
        }

        // Disconnect is the cancellation point for everything: stream,
        // interface, handle. No dangling reader survives shutdown.
        self.session.disconnect();
        info!("session control thread stopped");
        Ok(())
    }

    /// A panic in a command handler must not kill the control thread.
    fn handle_command(&mut self, cmd: SessionCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(cmd)
        }));

        if let Err(e) = result {
            error!("panic in session command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::RefreshDirectory { response } => {
                let _ = response.send(self.refresh_directory());
            }

            SessionCommand::Connect {
                vendor_id,
                product_id,
                response,
            } => {
                debug!("connect {vendor_id:04x}:{product_id:04x}");
                let result = self.session.connect(&self.backend, vendor_id, product_id);
                let _ = response.send(result);
            }

            SessionCommand::Disconnect { response } => {
                self.session.disconnect();
                let _ = response.send(());
            }

            SessionCommand::SendNoData {
                request,
                value,
                response,
            } => {
                let _ = response.send(self.session.send_no_data(request, value));
            }

            SessionCommand::SendWrite {
                request,
                payload,
                response,
            } => {
                let _ = response.send(self.session.send_write(request, payload));
            }

            SessionCommand::SendRead {
                request,
                capacity,
                response,
            } => {
                let _ = response.send(self.session.send_read(request, capacity));
            }

            SessionCommand::StartStream {
                endpoint,
                buffer_size,
                response,
            } => {
                let events = self.worker.event_tx.clone();
                // The reader thread forwards buffers and returns; it
                // never touches session state and never waits on the
                // shell, otherwise a stalled shell would wedge the
                // stop-side join. A full queue drops the buffer.
                let result = self.session.start_stream(endpoint, buffer_size, move |data| {
                    if events
                        .try_send(SessionEvent::StreamData { endpoint, data })
                        .is_err()
                    {
                        debug!(%endpoint, "event queue full, stream buffer dropped");
                    }
                });
                let _ = response.send(result);
            }

            SessionCommand::StopStream { response } => {
                let _ = response.send(self.session.stop_stream());
            }

            SessionCommand::Shutdown => {
                // Handled in the main loop.
                unreachable!()
            }
        }
    }

    fn refresh_directory(&mut self) -> Result<DeviceDirectory, PlatformError> {
        let directory = DeviceDirectory::capture(&self.backend)?;
        self.directory = directory.clone();
        Ok(directory)
    }

    /// Reconcile one arrive/leave notification: refresh the directory,
    /// then re-validate the session against it. This is the one path
    /// where the session closes itself without an explicit command.
    fn handle_hotplug(&mut self, event: HotplugEvent) {
        debug!(?event, "hot-plug notification");

        let directory = match DeviceDirectory::capture(&self.backend) {
            Ok(directory) => directory,
            Err(e) => {
                warn!("directory refresh after hot-plug failed: {e}");
                self.send_event(SessionEvent::PlatformError(e.to_string()));
                return;
            }
        };
        self.directory = directory.clone();

        if let Some(key) = self.session.open_key().cloned()
            && !directory.contains(&key)
        {
            warn!(%key, "open device removed, forcing disconnect");
            self.session.disconnect();
            self.send_event(SessionEvent::DeviceRemoved(key));
        }

        self.send_event(SessionEvent::DirectoryChanged(directory));
    }

    /// Non-blocking by construction: the shell may have stopped
    /// draining events, and the control loop must keep serving
    /// commands regardless. Directory refreshes coalesce into the next
    /// snapshot anyway.
    fn send_event(&self, event: SessionEvent) {
        if !self.worker.try_send_event(event) {
            warn!("event queue full, session event dropped");
        }
    }
}

/// Spawn the control thread. It runs until a `Shutdown` command is
/// received; transfer timeout comes from configuration.
pub fn spawn_session_worker<B: PlatformBackend>(
    backend: B,
    worker: SessionWorker,
    transfer_timeout: Duration,
) -> std::thread::JoinHandle<crate::Result<()>> {
    std::thread::Builder::new()
        .name("session-control".to_string())
        .spawn(move || {
            let thread = SessionWorkerThread::with_transfer_timeout(backend, worker, transfer_timeout)?;
            thread.run()
        })
        .expect("failed to spawn session control thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::create_session_bridge;
    use crate::testing::FakeBackend;

    #[test]
    fn test_initial_directory_capture() {
        let mut backend = FakeBackend::new();
        backend.add_device(0x1234, 0x5678, 0x0100);

        let (_bridge, worker) = create_session_bridge();
        let thread = SessionWorkerThread::new(backend, worker).unwrap();
        assert_eq!(thread.directory.len(), 1);
    }
}
