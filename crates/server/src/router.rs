use std::{collections::VecDeque, sync::Arc};

use shared::{
    domain::{Identity, PresenceState},
    protocol::{Event, EventKind},
};
use tracing::{debug, error, warn};

use crate::registry::{Channel, ConnectionRegistry};

/// Routes typed events to registered channels: unicast when the event has a
/// target, fan-out to a registry snapshot otherwise. Delivery is best
/// effort; a target that is not registered is a silent drop and offline
/// peers catch up through reconciliation polling.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
}

impl EventRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Never blocks and never fails from the caller's point of view. A
    /// write failure on one channel is logged, evicts that channel, and
    /// queues the resulting presence broadcast; it does not halt delivery
    /// to the remaining channels.
    pub fn send(&self, event: &Event) {
        let mut pending: VecDeque<Event> = VecDeque::new();
        pending.push_back(event.clone());

        // Cascading evictions (an offline broadcast can itself hit dead
        // channels) are handled iteratively through this queue.
        while let Some(event) = pending.pop_front() {
            // Serialized once per event, shared by every recipient.
            let text = match serde_json::to_string(&event.kind) {
                Ok(text) => text,
                Err(err) => {
                    error!(%err, "failed to serialize event; not delivered");
                    continue;
                }
            };

            let mut failed: Vec<(Identity, Channel)> = Vec::new();
            match &event.target {
                Some(target) => {
                    let Some(channel) = self.registry.lookup(target) else {
                        debug!(identity = %target, "target not registered; event dropped");
                        continue;
                    };
                    if let Err(reason) = channel.send_event(text) {
                        warn!(identity = %target, ?reason, "unicast write failed");
                        failed.push((target.clone(), channel));
                    }
                }
                None => {
                    for (identity, channel) in self.registry.all() {
                        if let Err(reason) = channel.send_event(text.clone()) {
                            warn!(%identity, ?reason, "broadcast write failed; skipping peer");
                            failed.push((identity, channel));
                        }
                    }
                }
            }

            // A failed write is an implicit disconnect. Unregister guards
            // on channel identity, so a peer that already reconnected with
            // a fresh channel is left alone.
            for (identity, channel) in failed {
                if self.registry.unregister(&identity, &channel) {
                    channel.close();
                    pending.push_back(Event::broadcast(EventKind::PresenceChanged {
                        identity,
                        state: PresenceState::Offline,
                    }));
                }
            }
        }
    }
}
