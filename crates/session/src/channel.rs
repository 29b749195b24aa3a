//! Async channel bridge between the shell runtime and the control
//! thread that owns the session.
//!
//! Commands flow one way, events the other; every command except
//! `Shutdown` carries a oneshot responder so the shell can await the
//! result without ever touching session state directly.

use crate::directory::DeviceDirectory;
use crate::error::{ConnectError, PlatformError, StreamError, TransferError};
use crate::types::{DeviceKey, EndpointId, SessionInfo};
use async_channel::{Receiver, Sender, bounded};
use bytes::Bytes;

/// Commands from the shell runtime to the control thread.
#[derive(Debug)]
pub enum SessionCommand {
    /// Capture a fresh directory snapshot.
    RefreshDirectory {
        response: tokio::sync::oneshot::Sender<Result<DeviceDirectory, PlatformError>>,
    },

    /// Open and claim the device matching the id pair.
    Connect {
        vendor_id: u16,
        product_id: u16,
        response: tokio::sync::oneshot::Sender<Result<SessionInfo, ConnectError>>,
    },

    /// Tear down the session. Idempotent.
    Disconnect {
        response: tokio::sync::oneshot::Sender<()>,
    },

    /// No-data vendor control transfer.
    SendNoData {
        request: u8,
        value: u16,
        response: tokio::sync::oneshot::Sender<Result<bool, TransferError>>,
    },

    /// Vendor control transfer with an out data stage.
    SendWrite {
        request: u8,
        payload: Bytes,
        response: tokio::sync::oneshot::Sender<Result<bool, TransferError>>,
    },

    /// Vendor control transfer with an in data stage.
    SendRead {
        request: u8,
        capacity: usize,
        response: tokio::sync::oneshot::Sender<Result<Bytes, TransferError>>,
    },

    /// Enable the interrupt stream; data arrives as
    /// [`SessionEvent::StreamData`].
    StartStream {
        endpoint: EndpointId,
        buffer_size: usize,
        response: tokio::sync::oneshot::Sender<Result<(), StreamError>>,
    },

    /// Disable the interrupt stream.
    StopStream {
        response: tokio::sync::oneshot::Sender<Result<(), StreamError>>,
    },

    /// Stop the control thread gracefully.
    Shutdown,
}

/// Events pushed by the control thread to the shell.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A fresh directory snapshot replaced the previous one.
    DirectoryChanged(DeviceDirectory),
    /// The open device vanished; the session tore itself down.
    DeviceRemoved(DeviceKey),
    /// One interrupt buffer, payload uninterpreted.
    StreamData { endpoint: EndpointId, data: Bytes },
    /// A platform-level failure worth surfacing to the user.
    PlatformError(String),
}

/// Handle for the shell runtime (async side).
#[derive(Clone)]
pub struct SessionBridge {
    cmd_tx: Sender<SessionCommand>,
    event_rx: Receiver<SessionEvent>,
}

impl SessionBridge {
    /// Send a command to the control thread.
    pub async fn send_command(&self, cmd: SessionCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event from the control thread.
    pub async fn recv_event(&self) -> crate::Result<SessionEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the control thread (blocking side).
pub struct SessionWorker {
    pub(crate) cmd_rx: Receiver<SessionCommand>,
    /// Event sender; also cloned into stream callbacks.
    pub event_tx: Sender<SessionEvent>,
}

impl SessionWorker {
    /// Receive a command, blocking.
    pub fn recv_command(&self) -> crate::Result<SessionCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive a command without blocking.
    pub fn try_recv_command(&self) -> Option<SessionCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Push an event toward the shell without blocking. Returns false
    /// when the queue is full and the event was dropped.
    ///
    /// The shell is free to stop draining events at any time, so
    /// nothing on the control thread (or a stream reader) may ever
    /// wait on this queue.
    pub fn try_send_event(&self, event: SessionEvent) -> bool {
        self.event_tx.try_send(event).is_ok()
    }
}

/// Create the bridge. Returns the async half for the shell and the
/// blocking half for the control thread.
pub fn create_session_bridge() -> (SessionBridge, SessionWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        SessionBridge { cmd_tx, event_rx },
        SessionWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_crosses_the_bridge() {
        let (bridge, worker) = create_session_bridge();

        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, SessionCommand::RefreshDirectory { .. })
        });

        let (tx, _rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(SessionCommand::RefreshDirectory { response: tx })
            .await
            .unwrap();

        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_event_crosses_the_bridge() {
        let (bridge, worker) = create_session_bridge();

        assert!(worker.try_send_event(SessionEvent::DeviceRemoved(DeviceKey::from("001:004"))));

        match bridge.recv_event().await.unwrap() {
            SessionEvent::DeviceRemoved(key) => assert_eq!(key, DeviceKey::from("001:004")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_full_event_queue_drops_instead_of_blocking() {
        let (bridge, worker) = create_session_bridge();

        for _ in 0..256 {
            assert!(worker.try_send_event(SessionEvent::PlatformError("queued".into())));
        }
        assert!(!worker.try_send_event(SessionEvent::PlatformError("overflow".into())));

        // The queued events are untouched by the dropped one.
        match bridge.recv_event().await.unwrap() {
            SessionEvent::PlatformError(message) => assert_eq!(message, "queued"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
