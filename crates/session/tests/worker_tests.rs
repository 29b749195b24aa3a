//! Control-thread integration tests: commands over the bridge and
//! hot-plug reconciliation against the fake platform.

use session::testing::FakeBackend;
use session::{
    EndpointId, SessionBridge, SessionCommand, SessionEvent, TransferError, create_session_bridge,
    spawn_session_worker,
};
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn start(backend: FakeBackend) -> (SessionBridge, std::thread::JoinHandle<session::Result<()>>) {
    let (bridge, worker) = create_session_bridge();
    let handle = spawn_session_worker(backend, worker, Duration::from_secs(1));
    (bridge, handle)
}

async fn next_event(bridge: &SessionBridge) -> SessionEvent {
    timeout(WAIT, bridge.recv_event())
        .await
        .expect("timed out waiting for event")
        .unwrap()
}

async fn wait_for(
    bridge: &SessionBridge,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    loop {
        let event = next_event(bridge).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn connect(bridge: &SessionBridge, vendor_id: u16, product_id: u16) -> session::SessionInfo {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::Connect {
            vendor_id,
            product_id,
            response: tx,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap()
}

async fn shutdown(
    bridge: SessionBridge,
    handle: std::thread::JoinHandle<session::Result<()>>,
) {
    bridge.send_command(SessionCommand::Shutdown).await.unwrap();
    handle.join().unwrap().unwrap();
}

#[tokio::test]
async fn initial_snapshot_then_refresh_on_demand() {
    let mut backend = FakeBackend::new();
    backend.add_device(0x1234, 0x5678, 0x0100);
    let (bridge, handle) = start(backend.clone());

    match next_event(&bridge).await {
        SessionEvent::DirectoryChanged(directory) => assert_eq!(directory.len(), 1),
        other => panic!("expected initial snapshot, got {other:?}"),
    }

    backend.add_device(0xaaaa, 0xbbbb, 0x0001);
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::RefreshDirectory { response: tx })
        .await
        .unwrap();
    let directory = rx.await.unwrap().unwrap();
    assert_eq!(directory.len(), 2);

    shutdown(bridge, handle).await;
}

#[tokio::test]
async fn removing_the_open_device_emits_exactly_one_device_removed() {
    let mut backend = FakeBackend::new();
    let key = backend.add_device(0x1234, 0x5678, 0x0100);
    let (bridge, handle) = start(backend.clone());

    let info = connect(&bridge, 0x1234, 0x5678).await;
    assert_eq!(info.key, key);

    backend.emit_removal(&key);

    match wait_for(&bridge, |e| matches!(e, SessionEvent::DeviceRemoved(_))).await {
        SessionEvent::DeviceRemoved(removed) => assert_eq!(removed, key),
        _ => unreachable!(),
    }

    // The session tore itself down; transfers now fail closed.
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::SendNoData {
            request: 0x01,
            value: 0,
            response: tx,
        })
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), Err(TransferError::SessionClosed));

    // Further notifications refresh the directory but produce no
    // second DeviceRemoved.
    backend.emit_arrival(0x1111, 0x2222, 0x0001);
    let mut saw_second_removed = false;
    loop {
        match next_event(&bridge).await {
            SessionEvent::DeviceRemoved(_) => saw_second_removed = true,
            SessionEvent::DirectoryChanged(d) if d.find_ids(0x1111, 0x2222).is_some() => break,
            _ => {}
        }
    }
    assert!(!saw_second_removed);

    shutdown(bridge, handle).await;
}

#[tokio::test]
async fn removing_another_device_leaves_the_session_alone() {
    let mut backend = FakeBackend::new();
    backend.add_device(0x1234, 0x5678, 0x0100);
    let other = backend.add_device(0xaaaa, 0xbbbb, 0x0001);
    let (bridge, handle) = start(backend.clone());

    connect(&bridge, 0x1234, 0x5678).await;
    backend.emit_removal(&other);

    let mut saw_removed = false;
    loop {
        match next_event(&bridge).await {
            SessionEvent::DeviceRemoved(_) => saw_removed = true,
            SessionEvent::DirectoryChanged(d) if !d.contains(&other) => break,
            _ => {}
        }
    }
    assert!(!saw_removed);

    // Session still open and usable.
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::SendNoData {
            request: 0x01,
            value: 0,
            response: tx,
        })
        .await
        .unwrap();
    assert_eq!(rx.await.unwrap(), Ok(true));

    shutdown(bridge, handle).await;
}

#[tokio::test]
async fn stream_data_arrives_as_events() {
    let mut backend = FakeBackend::new();
    backend.add_device(0x1234, 0x5678, 0x0100);
    backend.inject_interrupt_data(b"ping");
    let (bridge, handle) = start(backend.clone());

    connect(&bridge, 0x1234, 0x5678).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::StartStream {
            endpoint: EndpointId(0x83),
            buffer_size: 256,
            response: tx,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    match wait_for(&bridge, |e| matches!(e, SessionEvent::StreamData { .. })).await {
        SessionEvent::StreamData { endpoint, data } => {
            assert_eq!(endpoint, EndpointId(0x83));
            assert_eq!(&data[..], b"ping");
        }
        _ => unreachable!(),
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::StopStream { response: tx })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    shutdown(bridge, handle).await;
}

#[tokio::test]
async fn stop_stream_returns_even_when_nobody_drains_events() {
    let mut backend = FakeBackend::new();
    backend.add_device(0x1234, 0x5678, 0x0100);
    // More buffers than the event queue can hold, with no reader on
    // the other side.
    for _ in 0..300 {
        backend.inject_interrupt_data(b"burst");
    }
    let (bridge, handle) = start(backend.clone());

    connect(&bridge, 0x1234, 0x5678).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::StartStream {
            endpoint: EndpointId(0x83),
            buffer_size: 256,
            response: tx,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    // Let the reader overrun the event queue.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::StopStream { response: tx })
        .await
        .unwrap();
    timeout(WAIT, rx)
        .await
        .expect("control thread wedged while stopping the stream")
        .unwrap()
        .unwrap();

    shutdown(bridge, handle).await;
}

#[tokio::test]
async fn reconciliation_survives_a_full_event_queue() {
    let mut backend = FakeBackend::new();
    let key = backend.add_device(0x1234, 0x5678, 0x0100);
    for _ in 0..300 {
        backend.inject_interrupt_data(b"burst");
    }
    let (bridge, handle) = start(backend.clone());

    connect(&bridge, 0x1234, 0x5678).await;

    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::StartStream {
            endpoint: EndpointId(0x83),
            buffer_size: 256,
            response: tx,
        })
        .await
        .unwrap();
    rx.await.unwrap().unwrap();

    // Fill the event queue, then pull the device out from under the
    // session without ever draining an event.
    tokio::time::sleep(Duration::from_millis(100)).await;
    backend.emit_removal(&key);

    let deadline = tokio::time::Instant::now() + WAIT;
    while backend.close_calls() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "control thread never reconciled the removal"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The control thread is still serving commands afterwards.
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(SessionCommand::SendNoData {
            request: 0x01,
            value: 0,
            response: tx,
        })
        .await
        .unwrap();
    let outcome = timeout(WAIT, rx)
        .await
        .expect("control thread stalled after reconciliation")
        .unwrap();
    assert_eq!(outcome, Err(TransferError::SessionClosed));

    shutdown(bridge, handle).await;
}

#[tokio::test]
async fn disconnect_over_the_bridge_is_idempotent() {
    let mut backend = FakeBackend::new();
    backend.add_device(0x1234, 0x5678, 0x0100);
    let (bridge, handle) = start(backend.clone());

    connect(&bridge, 0x1234, 0x5678).await;

    for _ in 0..2 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(SessionCommand::Disconnect { response: tx })
            .await
            .unwrap();
        rx.await.unwrap();
    }

    assert_eq!(backend.close_calls(), 1);
    assert_eq!(backend.release_calls(), 1);

    shutdown(bridge, handle).await;
}
