use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use shared::{
    domain::Identity,
    error::ApiError,
    protocol::{ClientMessage, Event, EventKind},
};
use tracing::{info, warn};

mod auth;
mod config;
mod presence;
mod registry;
mod router;

use auth::{SessionProvider, SharedSecretSessions};
use config::{load_settings, Settings};
use presence::PresenceTracker;
use registry::{Channel, ConnectionRegistry, OutboundFrame};
use router::EventRouter;

struct AppState {
    registry: Arc<ConnectionRegistry>,
    router: Arc<EventRouter>,
    presence: PresenceTracker,
    sessions: Arc<dyn SessionProvider>,
    channel_queue_depth: usize,
}

impl AppState {
    fn new(sessions: Arc<dyn SessionProvider>, channel_queue_depth: usize) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(EventRouter::new(Arc::clone(&registry)));
        let presence = PresenceTracker::new(Arc::clone(&registry), Arc::clone(&router));
        Self {
            registry,
            router,
            presence,
            sessions,
            channel_queue_depth,
        }
    }

    fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Arc::new(SharedSecretSessions::new(settings.auth_token.clone())),
            settings.channel_queue_depth,
        )
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    identity: String,
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let state = AppState::from_settings(&settings);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "delivery server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut identities: Vec<String> = state
        .registry
        .all()
        .into_iter()
        .map(|(identity, _)| identity.0)
        .collect();
    identities.sort();
    Json(serde_json::json!({
        "connected": identities.len(),
        "identities": identities,
    }))
}

/// Installed once at router construction; every upgrade request flows
/// through this handler for the lifetime of the server.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Response {
    let Some(identity) = state.sessions.authenticate(&q.identity, q.token.as_deref()) else {
        warn!(identity = %q.identity, "websocket handshake rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ApiError::unauthorized("websocket handshake rejected")),
        )
            .into_response();
    };
    ws.on_upgrade(move |socket| ws_connection(state, socket, identity))
        .into_response()
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    identity: Identity,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sink, mut stream) = socket.split();
    let (frames_tx, mut frames_rx) = tokio::sync::mpsc::channel(state.channel_queue_depth);
    let channel = Channel::new(frames_tx);

    state.presence.connected(&identity, channel.clone());

    let send_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            match frame {
                OutboundFrame::Event(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(inbound) => relay_client_message(&state, &identity, inbound),
                Err(err) => {
                    warn!(%identity, %err, "malformed client frame; skipping");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.presence.disconnected(&identity, &channel);
    send_task.abort();
}

/// Turns inbound client frames into router sends. The authenticated
/// identity always wins over whatever the frame claims about its sender.
fn relay_client_message(state: &AppState, identity: &Identity, inbound: ClientMessage) {
    match inbound {
        ClientMessage::PresenceUpdate { state: presence } => {
            state
                .router
                .send(&Event::broadcast(EventKind::PresenceChanged {
                    identity: identity.clone(),
                    state: presence,
                }));
        }
        ClientMessage::MessageSent { mut message } => {
            message.sender = identity.clone();
            let target = message.receiver.clone();
            state
                .router
                .send(&Event::unicast(EventKind::MessageDelivered { message }, target));
        }
        ClientMessage::ReadReceipt { to, mut receipt } => {
            receipt.reader = identity.clone();
            state
                .router
                .send(&Event::unicast(EventKind::ReadReceipt { receipt }, to));
        }
    }
}
