use std::sync::Arc;

use shared::{
    domain::{Identity, PresenceState},
    protocol::{Event, EventKind},
};
use tracing::{debug, info};

use crate::{
    registry::{Channel, ConnectionRegistry},
    router::EventRouter,
};

/// Derives online/offline transitions from registry membership changes and
/// broadcasts them through the router. There is no intermediate
/// "connecting" state; the transport handshake is atomic from here.
pub struct PresenceTracker {
    registry: Arc<ConnectionRegistry>,
    router: Arc<EventRouter>,
}

impl PresenceTracker {
    pub fn new(registry: Arc<ConnectionRegistry>, router: Arc<EventRouter>) -> Self {
        Self { registry, router }
    }

    /// Registers the channel. Emits an online broadcast only when the
    /// identity was previously offline; a reconnect replacing a live
    /// channel is not a transition, and the superseded channel is closed.
    pub fn connected(&self, identity: &Identity, channel: Channel) {
        match self.registry.register(identity.clone(), channel) {
            Some(superseded) => {
                debug!(%identity, "reconnect superseded prior channel");
                superseded.close();
            }
            None => {
                info!(%identity, "peer online");
                self.broadcast(identity, PresenceState::Online);
            }
        }
    }

    /// Unregisters the channel and emits an offline broadcast if the entry
    /// was actually removed. A stale channel handle changes nothing.
    pub fn disconnected(&self, identity: &Identity, channel: &Channel) {
        if self.registry.unregister(identity, channel) {
            info!(%identity, "peer offline");
            self.broadcast(identity, PresenceState::Offline);
        }
    }

    fn broadcast(&self, identity: &Identity, state: PresenceState) {
        self.router
            .send(&Event::broadcast(EventKind::PresenceChanged {
                identity: identity.clone(),
                state,
            }));
    }
}
