use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{Identity, PresenceState},
    protocol::{ClientMessage, EventKind, EventType, MessagePayload},
};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::{
    bus::EventBus,
    transport::{ConnectionState, EventStream, TransportConfig},
};

struct TestServer {
    inbound_tx: mpsc::UnboundedSender<ClientMessage>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EventKind>>>,
}

/// Minimal stand-in for the delivery server: one websocket endpoint that
/// pushes whatever the test feeds it and records everything the client
/// sends back.
async fn spawn_server() -> (
    SocketAddr,
    mpsc::UnboundedSender<EventKind>,
    mpsc::UnboundedReceiver<ClientMessage>,
) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let state = Arc::new(TestServer {
        inbound_tx,
        events_rx: Mutex::new(Some(events_rx)),
    });

    let app = Router::new().route("/ws", get(ws_route)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (addr, events_tx, inbound_rx)
}

async fn ws_route(
    ws: WebSocketUpgrade,
    State(state): State<Arc<TestServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

async fn serve_connection(socket: WebSocket, state: Arc<TestServer>) {
    let (mut sink, mut stream) = socket.split();
    // Only the first connection gets the event feed; reconnects just echo
    // inbound frames into the channel, which is all these tests need.
    let mut events_rx = state.events_rx.lock().await.take();
    loop {
        tokio::select! {
            event = async {
                match events_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                let Some(event) = event else { break };
                let text = serde_json::to_string(&event).expect("serialize event");
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let message = serde_json::from_str(&text).expect("client frame");
                    let _ = state.inbound_tx.send(message);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }
}

async fn wait_for_state(handle: &crate::transport::EventStreamHandle, want: ConnectionState) {
    let mut state = handle.watch_state();
    // Generous enough to cover a full first-retry backoff delay.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *state.borrow() == want {
                return;
            }
            state.changed().await.expect("stream alive");
        }
    })
    .await
    .expect("connection state before timeout");
}

fn config_for(addr: SocketAddr) -> TransportConfig {
    TransportConfig {
        server_url: format!("http://{addr}"),
        identity: "alice".into(),
        token: None,
    }
}

#[tokio::test]
async fn server_events_are_emitted_on_the_local_bus() {
    let (addr, events_tx, _inbound_rx) = spawn_server().await;
    let bus = EventBus::new();

    let delivered = Arc::new(StdMutex::new(Vec::new()));
    let delivered_clone = Arc::clone(&delivered);
    let _sub = bus.on(EventType::MessageDelivered, move |event| {
        if let EventKind::MessageDelivered { message } = event {
            delivered_clone.lock().unwrap().push(message.preview());
        }
    });

    let handle = EventStream::spawn(config_for(addr), Arc::clone(&bus)).expect("spawn stream");
    wait_for_state(&handle, ConnectionState::Connected).await;

    events_tx
        .send(EventKind::MessageDelivered {
            message: MessagePayload::text("bob".into(), "alice".into(), "hello over the wire"),
        })
        .expect("push event");

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !delivered.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("event before timeout");
    assert_eq!(delivered.lock().unwrap()[0], "hello over the wire");
}

#[tokio::test]
async fn outbound_frames_reach_the_server() {
    let (addr, _events_tx, mut inbound_rx) = spawn_server().await;
    let bus = EventBus::new();
    let handle = EventStream::spawn(config_for(addr), bus).expect("spawn stream");
    wait_for_state(&handle, ConnectionState::Connected).await;

    handle
        .send(ClientMessage::PresenceUpdate {
            state: PresenceState::Online,
        })
        .expect("queue frame");

    let frame = tokio::time::timeout(Duration::from_secs(2), inbound_rx.recv())
        .await
        .expect("frame before timeout")
        .expect("server alive");
    assert!(matches!(
        frame,
        ClientMessage::PresenceUpdate {
            state: PresenceState::Online
        }
    ));
}

#[tokio::test]
async fn shutdown_revokes_the_subscription() {
    let (addr, events_tx, _inbound_rx) = spawn_server().await;
    let bus = EventBus::new();

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = Arc::clone(&seen);
    let _sub = bus.on(EventType::PresenceChanged, move |_| {
        seen_clone.fetch_add(1, Ordering::SeqCst);
    });

    let handle = EventStream::spawn(config_for(addr), Arc::clone(&bus)).expect("spawn stream");
    wait_for_state(&handle, ConnectionState::Connected).await;

    events_tx
        .send(EventKind::PresenceChanged {
            identity: Identity::from("bob"),
            state: PresenceState::Online,
        })
        .expect("push event");
    tokio::time::timeout(Duration::from_secs(2), async {
        while seen.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first event before timeout");

    handle.shutdown();
    wait_for_state(&handle, ConnectionState::Closed).await;

    // Events pushed after revocation never reach the bus.
    let _ = events_tx.send(EventKind::PresenceChanged {
        identity: Identity::from("bob"),
        state: PresenceState::Offline,
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

/// Server whose handler holds each socket open until told to drop it,
/// simulating an abrupt server-side disconnect.
async fn spawn_flaky_server() -> (SocketAddr, Arc<Notify>) {
    let drop_signal = Arc::new(Notify::new());
    let app = Router::new()
        .route("/ws", get(flaky_ws))
        .with_state(Arc::clone(&drop_signal));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, drop_signal)
}

async fn flaky_ws(
    ws: WebSocketUpgrade,
    State(drop_signal): State<Arc<Notify>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |mut socket| async move {
        tokio::select! {
            _ = drop_signal.notified() => {}
            _ = async {
                while socket.recv().await.is_some() {}
            } => {}
        }
    })
}

#[tokio::test]
async fn reconnects_after_the_server_drops_the_connection() {
    let (addr, drop_signal) = spawn_flaky_server().await;
    let bus = EventBus::new();
    let handle = EventStream::spawn(config_for(addr), bus).expect("spawn stream");
    wait_for_state(&handle, ConnectionState::Connected).await;

    drop_signal.notify_waiters();
    wait_for_state(&handle, ConnectionState::Reconnecting).await;

    // The first retry lands after roughly one second and the same server
    // is still accepting, so the stream comes back on its own.
    wait_for_state(&handle, ConnectionState::Connected).await;
}

#[tokio::test]
async fn unreachable_server_reports_reconnecting_and_accepts_queued_frames() {
    let bus = EventBus::new();
    // Nothing is listening on this port.
    let handle = EventStream::spawn(
        TransportConfig {
            server_url: "http://127.0.0.1:9".into(),
            identity: "alice".into(),
            token: None,
        },
        bus,
    )
    .expect("spawn stream");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.connection_state(), ConnectionState::Reconnecting);
    // Frames queue for the eventual reconnect instead of erroring.
    handle
        .send(ClientMessage::PresenceUpdate {
            state: PresenceState::Online,
        })
        .expect("queue while down");
}
