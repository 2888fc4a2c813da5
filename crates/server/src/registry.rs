use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
};

use shared::domain::Identity;
use tokio::sync::mpsc;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Frame handed to a connection's writer task.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// Serialized event text destined for the peer.
    Event(String),
    /// Ask the writer task to close the socket and stop. Sent to a channel
    /// that has been superseded by a reconnect.
    Close,
}

#[derive(Debug)]
pub enum ChannelSendError {
    /// The per-connection queue is full; the peer is not draining.
    Full,
    /// The writer task is gone; the connection is dead.
    Closed,
}

/// Handle for one live duplex connection. Cloneable; all clones refer to the
/// same underlying connection and compare equal by `id`.
#[derive(Debug, Clone)]
pub struct Channel {
    id: u64,
    frames: mpsc::Sender<OutboundFrame>,
}

impl Channel {
    pub fn new(frames: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            frames,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Non-blocking write of one serialized event.
    pub fn send_event(&self, text: String) -> Result<(), ChannelSendError> {
        self.frames
            .try_send(OutboundFrame::Event(text))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => ChannelSendError::Full,
                mpsc::error::TrySendError::Closed(_) => ChannelSendError::Closed,
            })
    }

    /// Ask the owning writer task to shut the socket down. Best effort; a
    /// queue that is already full or closed means the task is on its way
    /// out anyway.
    pub fn close(&self) {
        let _ = self.frames.try_send(OutboundFrame::Close);
    }

    pub fn same_connection(&self, other: &Channel) -> bool {
        self.id == other.id
    }
}

/// Authoritative map of identity -> live channel. Existence of an entry is
/// the definition of "online". At most one entry per identity; a reconnect
/// replaces the previous channel (last writer wins).
///
/// Constructor-injected wherever it is needed; there is no process-global
/// instance.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<Identity, Channel>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the entry for `identity`, returning the
    /// superseded channel if one existed. The caller is responsible for
    /// closing the superseded channel.
    pub fn register(&self, identity: Identity, channel: Channel) -> Option<Channel> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(identity, channel)
    }

    /// Removes the entry only if the stored channel is the same connection
    /// as `channel`. A stale handle from an earlier connection is a silent
    /// no-op, so a late disconnect cannot evict a newer reconnection.
    /// Returns whether an entry was removed.
    pub fn unregister(&self, identity: &Identity, channel: &Channel) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get(identity) {
            Some(stored) if stored.same_connection(channel) => {
                entries.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, identity: &Identity) -> Option<Channel> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(identity).cloned()
    }

    /// Copy-on-read snapshot for broadcast. Iterating the snapshot is safe
    /// while entries are concurrently added or removed.
    pub fn all(&self) -> Vec<(Identity, Channel)> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(identity, channel)| (identity.clone(), channel.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
