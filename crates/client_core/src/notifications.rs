use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{NotificationId, NotificationKind},
    protocol::{EventKind, EventType},
};
use tokio::sync::watch;

use crate::bus::{EventBus, Subscription};

/// Most-recent-first toast feed, capped so a long-lived session cannot
/// grow without bound.
const MAX_TOASTS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct Toast {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ToastFeed {
    pub toasts: Vec<Toast>,
    pub unread: usize,
}

/// Surfaces incoming events as dismissable toasts plus an unread badge.
/// Subscribes to notification and message deliveries on the local bus;
/// nothing here talks to the network.
pub struct NotificationCenter {
    feed: Arc<watch::Sender<ToastFeed>>,
    _subs: Vec<Subscription>,
}

impl NotificationCenter {
    pub fn new(bus: &Arc<EventBus>) -> Self {
        let feed = Arc::new(watch::channel(ToastFeed::default()).0);

        let on_notification = {
            let feed = Arc::clone(&feed);
            bus.on(EventType::NotificationDelivered, move |event| {
                if let EventKind::NotificationDelivered { notification } = event {
                    push_toast(
                        &feed,
                        Toast {
                            id: notification.notification_id,
                            kind: notification.kind,
                            title: notification.sender.to_string(),
                            body: notification.content.clone(),
                            read: notification.read,
                            created_at: notification.created_at,
                        },
                    );
                }
            })
        };

        let on_message = {
            let feed = Arc::clone(&feed);
            bus.on(EventType::MessageDelivered, move |event| {
                if let EventKind::MessageDelivered { message } = event {
                    push_toast(
                        &feed,
                        Toast {
                            id: NotificationId::generate(),
                            kind: NotificationKind::Message,
                            title: message.sender.to_string(),
                            body: message.preview(),
                            read: false,
                            created_at: message.sent_at,
                        },
                    );
                }
            })
        };

        Self {
            feed,
            _subs: vec![on_notification, on_message],
        }
    }

    pub fn snapshot(&self) -> ToastFeed {
        self.feed.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ToastFeed> {
        self.feed.subscribe()
    }

    pub fn mark_read(&self, ids: &[NotificationId]) {
        if ids.is_empty() {
            return;
        }
        self.feed.send_modify(|feed| {
            for toast in feed.toasts.iter_mut() {
                if ids.contains(&toast.id) {
                    toast.read = true;
                }
            }
            feed.unread = unread_count(&feed.toasts);
        });
    }

    pub fn dismiss(&self, id: NotificationId) {
        self.feed.send_modify(|feed| {
            feed.toasts.retain(|toast| toast.id != id);
            feed.unread = unread_count(&feed.toasts);
        });
    }
}

fn push_toast(feed: &watch::Sender<ToastFeed>, toast: Toast) {
    feed.send_modify(|feed| {
        feed.toasts.insert(0, toast);
        feed.toasts.truncate(MAX_TOASTS);
        feed.unread = unread_count(&feed.toasts);
    });
}

fn unread_count(toasts: &[Toast]) -> usize {
    toasts.iter().filter(|toast| !toast.read).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{domain::Identity, protocol::{MessagePayload, NotificationPayload}};

    fn notification(content: &str) -> EventKind {
        EventKind::NotificationDelivered {
            notification: NotificationPayload {
                notification_id: NotificationId::generate(),
                kind: NotificationKind::ContactRequest,
                sender: Identity::from("carol"),
                content: content.into(),
                read: false,
                created_at: Utc::now(),
            },
        }
    }

    #[test]
    fn delivered_notification_becomes_an_unread_toast() {
        let bus = EventBus::new();
        let center = NotificationCenter::new(&bus);

        bus.emit(&notification("carol wants to connect"));

        let feed = center.snapshot();
        assert_eq!(feed.toasts.len(), 1);
        assert_eq!(feed.unread, 1);
        assert_eq!(feed.toasts[0].title, "carol");
        assert_eq!(feed.toasts[0].kind, NotificationKind::ContactRequest);
    }

    #[test]
    fn message_delivery_surfaces_a_preview_toast() {
        let bus = EventBus::new();
        let center = NotificationCenter::new(&bus);

        bus.emit(&EventKind::MessageDelivered {
            message: MessagePayload::text("alice".into(), "me".into(), "lunch?"),
        });

        let feed = center.snapshot();
        assert_eq!(feed.toasts.len(), 1);
        assert_eq!(feed.toasts[0].title, "alice");
        assert_eq!(feed.toasts[0].body, "lunch?");
    }

    #[test]
    fn mark_read_and_dismiss_update_the_badge() {
        let bus = EventBus::new();
        let center = NotificationCenter::new(&bus);

        bus.emit(&notification("one"));
        bus.emit(&notification("two"));
        let feed = center.snapshot();
        assert_eq!(feed.unread, 2);

        let first_id = feed.toasts[0].id;
        center.mark_read(&[first_id]);
        assert_eq!(center.snapshot().unread, 1);

        center.dismiss(first_id);
        let feed = center.snapshot();
        assert_eq!(feed.toasts.len(), 1);
        assert_eq!(feed.unread, 1);
    }

    #[test]
    fn feed_is_capped_most_recent_first() {
        let bus = EventBus::new();
        let center = NotificationCenter::new(&bus);

        for i in 0..(MAX_TOASTS + 10) {
            bus.emit(&notification(&format!("n{i}")));
        }

        let feed = center.snapshot();
        assert_eq!(feed.toasts.len(), MAX_TOASTS);
        assert_eq!(feed.toasts[0].body, format!("n{}", MAX_TOASTS + 9));
    }

    #[test]
    fn unsubscribed_center_stops_reacting() {
        let bus = EventBus::new();
        let center = NotificationCenter::new(&bus);
        drop(center);
        // No subscribers left; emitting must not panic or leak callbacks.
        bus.emit(&notification("ignored"));
        assert_eq!(bus.subscriber_count(EventType::NotificationDelivered), 0);
    }
}
