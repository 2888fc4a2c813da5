use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use shared::protocol::{EventKind, EventType};
use tracing::warn;

type Callback = Arc<dyn Fn(&EventKind) + Send + Sync>;

struct Registration {
    id: u64,
    callback: Callback,
}

/// Local publish/subscribe hub decoupling UI surfaces from the transport.
/// Purely in-process fan-out: the transport pushes each incoming event here
/// once, and every interested surface (chat pane, toasts, unread badge)
/// reacts without the transport knowing about any of them.
///
/// `emit` is synchronous and single-pass; nothing here touches the network.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<EventType, Vec<Registration>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a callback for one event type. Callbacks fire in
    /// registration order. The returned subscription must be kept alive;
    /// dropping it (or calling `unsubscribe`) removes the registration.
    pub fn on(
        self: &Arc<Self>,
        event_type: EventType,
        callback: impl Fn(&EventKind) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.entry(event_type).or_default().push(Registration {
            id,
            callback: Arc::new(callback),
        });
        Subscription {
            bus: Arc::clone(self),
            event_type,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Invokes every callback currently registered for the event's type.
    /// The subscriber list is snapshotted before iteration, so callbacks
    /// registered during this emit are not invoked for it. A panicking
    /// callback is logged and skipped; it does not stop delivery to the
    /// rest.
    pub fn emit(&self, event: &EventKind) {
        let snapshot: Vec<Callback> = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            subscribers
                .get(&event.event_type())
                .map(|registrations| {
                    registrations
                        .iter()
                        .map(|r| Arc::clone(&r.callback))
                        .collect()
                })
                .unwrap_or_default()
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(
                    event_type = ?event.event_type(),
                    "subscriber panicked during emit; continuing with remaining subscribers"
                );
            }
        }
    }

    /// Local injection point for tests and UI mocks.
    pub fn publish(&self, event: EventKind) {
        self.emit(&event);
    }

    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.get(&event_type).map_or(0, Vec::len)
    }

    fn remove(&self, event_type: EventType, id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(registrations) = subscribers.get_mut(&event_type) {
            registrations.retain(|r| r.id != id);
            if registrations.is_empty() {
                subscribers.remove(&event_type);
            }
        }
    }
}

/// Handle for one bus registration. `unsubscribe` is idempotent and removes
/// exactly that registration; the callback is never invoked afterwards.
pub struct Subscription {
    bus: Arc<EventBus>,
    event_type: EventType,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.bus.remove(self.event_type, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
