use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use shared::protocol::{ClientMessage, EventKind};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(8);
const OUTBOUND_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Not connected; the backoff loop is working on it. Reconciliation
    /// polling is the only data path in this state.
    Reconnecting,
    /// Terminal: the handle was shut down or dropped. No further
    /// transitions.
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport unavailable; outbound frame not accepted")]
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the delivery server; http(s) schemes are mapped to
    /// ws(s).
    pub server_url: String,
    pub identity: String,
    pub token: Option<String>,
}

impl TransportConfig {
    fn websocket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)
            .with_context(|| format!("invalid server url: {}", self.server_url))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => bail!("unsupported scheme for websocket transport: {other}"),
        };
        let _ = url.set_scheme(scheme);
        url.set_path("/ws");
        url.query_pairs_mut().append_pair("identity", &self.identity);
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

/// Resilient subscription to the server's event stream. Incoming events are
/// emitted on the local bus; outbound client frames go through the same
/// socket. Reconnects with bounded exponential backoff and jitter.
pub struct EventStream;

impl EventStream {
    pub fn spawn(config: TransportConfig, bus: Arc<crate::bus::EventBus>) -> Result<EventStreamHandle> {
        let url = config.websocket_url()?;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Reconnecting);

        let task = tokio::spawn(run_connection_loop(
            url,
            bus,
            outbound_rx,
            shutdown_rx,
            state_tx,
        ));

        Ok(EventStreamHandle {
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            state: state_rx,
            task,
        })
    }
}

/// Revocable handle for one live event subscription. Dropping it tears the
/// background task down.
pub struct EventStreamHandle {
    outbound: mpsc::Sender<ClientMessage>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl EventStreamHandle {
    /// Queues an outbound frame without blocking. Frames queued while
    /// reconnecting are flushed once the socket is back.
    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.outbound
            .try_send(message)
            .map_err(|_| TransportError::Unavailable)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for EventStreamHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_connection_loop(
    url: Url,
    bus: Arc<crate::bus::EventBus>,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ConnectionState>,
) {
    let mut backoff = Backoff::new();
    loop {
        if *shutdown_rx.borrow() {
            state_tx.send_replace(ConnectionState::Closed);
            return;
        }

        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                info!("event stream connected");
                state_tx.send_replace(ConnectionState::Connected);
                backoff.reset();

                let (mut sink, mut stream) = socket.split();
                loop {
                    tokio::select! {
                        inbound = stream.next() => match inbound {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<EventKind>(&text) {
                                    Ok(event) => bus.emit(&event),
                                    Err(err) => warn!(%err, "malformed event frame; skipping"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(%err, "event stream read failed");
                                break;
                            }
                        },
                        outbound = outbound_rx.recv() => match outbound {
                            Some(message) => {
                                let text = match serde_json::to_string(&message) {
                                    Ok(text) => text,
                                    Err(err) => {
                                        warn!(%err, "failed to serialize outbound frame");
                                        continue;
                                    }
                                };
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                // Handle gone; nothing left to do here.
                                let _ = sink.send(Message::Close(None)).await;
                                state_tx.send_replace(ConnectionState::Closed);
                                return;
                            }
                        },
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                let _ = sink.send(Message::Close(None)).await;
                                state_tx.send_replace(ConnectionState::Closed);
                                return;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%err, "event stream connect failed");
            }
        }

        state_tx.send_replace(ConnectionState::Reconnecting);
        let delay = backoff.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    state_tx.send_replace(ConnectionState::Closed);
                    return;
                }
            }
        }
    }
}

/// 1s, 2s, 4s, 8s cap, with ±25% multiplicative jitter. Reset after every
/// successful connect so a later outage starts the schedule over.
struct Backoff {
    attempt: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { attempt: 0 }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(3);
        self.attempt = self.attempt.saturating_add(1);
        let base = BACKOFF_BASE
            .saturating_mul(1u32 << exp)
            .min(BACKOFF_CAP);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }
}
