use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{Identity, NotificationKind, PresenceState},
    protocol::{
        ContactRequest, ContactSummary, EventKind, EventType, MessagePayload, NotificationPayload,
    },
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    bus::{EventBus, Subscription},
    reconcile::{spawn_poller, PollHandle, PollState, ReconciliationConfig},
    store::AuthoritativeStore,
};

type Delta<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Factory for the polling hook surface: each hook pairs one reconciliation
/// poller with bus subscriptions that apply real-time deltas in between.
/// Polls overwrite wholesale, so the store wins whenever the two disagree.
pub struct Hooks {
    bus: Arc<EventBus>,
    store: Arc<dyn AuthoritativeStore>,
    config: ReconciliationConfig,
}

impl Hooks {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<dyn AuthoritativeStore>,
        config: ReconciliationConfig,
    ) -> Self {
        Self { bus, store, config }
    }

    /// Unread badge. Bumped immediately on every delivered message,
    /// reconciled against the store on the badge cadence.
    pub fn unread_count(&self) -> HookHandle<u64> {
        let store = Arc::clone(&self.store);
        let poll = spawn_poller(self.config.badge_interval, move || {
            let store = Arc::clone(&store);
            async move { store.unread_count().await }
        });

        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let sub = self.bus.on(EventType::MessageDelivered, move |_| {
            let _ = delta_tx.send(Box::new(|count: &mut u64| *count += 1) as Delta<u64>);
        });

        HookHandle::merged(poll, delta_rx, vec![sub])
    }

    /// Last-message preview for one conversation.
    pub fn last_message(&self, contact: Identity) -> HookHandle<Option<MessagePayload>> {
        let store = Arc::clone(&self.store);
        let poll_contact = contact.clone();
        let poll = spawn_poller(self.config.active_interval, move || {
            let store = Arc::clone(&store);
            let contact = poll_contact.clone();
            async move { store.last_message(&contact).await }
        });

        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let sub = self.bus.on(EventType::MessageDelivered, move |event| {
            if let EventKind::MessageDelivered { message } = event {
                if message.sender == contact || message.receiver == contact {
                    let message = message.clone();
                    let _ = delta_tx.send(Box::new(move |last: &mut Option<MessagePayload>| {
                        *last = Some(message);
                    }) as Delta<Option<MessagePayload>>);
                }
            }
        });

        HookHandle::merged(poll, delta_rx, vec![sub])
    }

    /// Notification feed; real-time deliveries are prepended between polls.
    pub fn notifications(&self) -> HookHandle<Vec<NotificationPayload>> {
        let store = Arc::clone(&self.store);
        let poll = spawn_poller(self.config.passive_interval, move || {
            let store = Arc::clone(&store);
            async move { store.notifications().await }
        });

        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let sub = self.bus.on(EventType::NotificationDelivered, move |event| {
            if let EventKind::NotificationDelivered { notification } = event {
                let notification = notification.clone();
                let _ = delta_tx.send(Box::new(move |feed: &mut Vec<NotificationPayload>| {
                    feed.insert(0, notification);
                }) as Delta<Vec<NotificationPayload>>);
            }
        });

        HookHandle::merged(poll, delta_rx, vec![sub])
    }

    /// Contact list with live presence flags.
    pub fn contact_list(&self) -> HookHandle<Vec<ContactSummary>> {
        let store = Arc::clone(&self.store);
        let poll = spawn_poller(self.config.passive_interval, move || {
            let store = Arc::clone(&store);
            async move { store.contact_list().await }
        });

        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let sub = self.bus.on(EventType::PresenceChanged, move |event| {
            if let EventKind::PresenceChanged { identity, state } = event {
                let identity = identity.clone();
                let state = *state;
                let _ = delta_tx.send(Box::new(move |contacts: &mut Vec<ContactSummary>| {
                    if let Some(contact) = contacts.iter_mut().find(|c| c.identity == identity) {
                        contact.online = state == PresenceState::Online;
                        if state == PresenceState::Offline {
                            contact.last_active = Some(Utc::now());
                        }
                    }
                }) as Delta<Vec<ContactSummary>>);
            }
        });

        HookHandle::merged(poll, delta_rx, vec![sub])
    }

    /// Pending contact requests. A contact-request notification triggers an
    /// immediate reconciliation rather than patching locally, since the
    /// notification does not carry the full request record.
    pub fn pending_contact_requests(&self) -> HookHandle<Vec<ContactRequest>> {
        let store = Arc::clone(&self.store);
        let poll = spawn_poller(self.config.passive_interval, move || {
            let store = Arc::clone(&store);
            async move { store.pending_contact_requests().await }
        });

        let refetcher = poll.refetcher();
        let sub = self.bus.on(EventType::NotificationDelivered, move |event| {
            if let EventKind::NotificationDelivered { notification } = event {
                if notification.kind == NotificationKind::ContactRequest {
                    let _ = refetcher.try_send(());
                }
            }
        });

        let (_delta_tx, delta_rx) = mpsc::unbounded_channel::<Delta<Vec<ContactRequest>>>();
        HookHandle::merged(poll, delta_rx, vec![sub])
    }
}

/// One mounted hook: current value + loading/stale/error state, manual
/// refetch, and teardown on drop (bus subscriptions and both tasks).
pub struct HookHandle<T> {
    state: watch::Receiver<PollState<T>>,
    poll: PollHandle<T>,
    merge_task: JoinHandle<()>,
    _subs: Vec<Subscription>,
}

impl<T: Clone + Send + Sync + 'static> HookHandle<T> {
    fn merged(
        poll: PollHandle<T>,
        mut deltas: mpsc::UnboundedReceiver<Delta<T>>,
        subs: Vec<Subscription>,
    ) -> Self {
        let (merged_tx, merged_rx) = watch::channel(poll.current());
        let mut poll_rx = poll.watch();

        let merge_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = poll_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let snapshot = poll_rx.borrow_and_update().clone();
                        merged_tx.send_replace(snapshot);
                    }
                    delta = deltas.recv() => {
                        let Some(apply) = delta else { return };
                        merged_tx.send_modify(|state| {
                            // Nothing to patch until the first poll lands;
                            // that poll will carry the truth anyway.
                            if let Some(value) = state.value.as_mut() {
                                apply(value);
                            }
                        });
                    }
                }
            }
        });

        Self {
            state: merged_rx,
            poll,
            merge_task,
            _subs: subs,
        }
    }

    pub fn current(&self) -> PollState<T> {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PollState<T>> {
        self.state.clone()
    }

    pub fn refetch(&self) {
        self.poll.refetch();
    }
}

impl<T> Drop for HookHandle<T> {
    fn drop(&mut self) {
        self.merge_task.abort();
    }
}
