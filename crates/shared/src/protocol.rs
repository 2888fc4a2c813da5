use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Identity, MessageId, NotificationId, NotificationKind, PresenceState};

/// Discriminant for the closed set of real-time event kinds. Used as the
/// subscription key on the client event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageDelivered,
    ReadReceipt,
    PresenceChanged,
    NotificationDelivered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    MessageDelivered {
        message: MessagePayload,
    },
    ReadReceipt {
        receipt: ReadReceiptPayload,
    },
    PresenceChanged {
        identity: Identity,
        state: PresenceState,
    },
    NotificationDelivered {
        notification: NotificationPayload,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::MessageDelivered { .. } => EventType::MessageDelivered,
            EventKind::ReadReceipt { .. } => EventType::ReadReceipt,
            EventKind::PresenceChanged { .. } => EventType::PresenceChanged,
            EventKind::NotificationDelivered { .. } => EventType::NotificationDelivered,
        }
    }
}

/// A routed event: one kind plus an optional target. Immutable once built;
/// no target means broadcast to every registered channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Identity>,
}

impl Event {
    pub fn unicast(kind: EventKind, target: Identity) -> Self {
        Self {
            kind,
            target: Some(target),
        }
    }

    pub fn broadcast(kind: EventKind) -> Self {
        Self { kind, target: None }
    }
}

/// Inbound client-to-server frames relayed into the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    PresenceUpdate {
        state: PresenceState,
    },
    MessageSent {
        message: MessagePayload,
    },
    /// `to` is the original sender of the message being acknowledged.
    ReadReceipt {
        to: Identity,
        receipt: ReadReceiptPayload,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        content: String,
    },
    /// Media carries the upload collaborator's stable URL, never raw bytes.
    Media {
        url: String,
        filename: String,
        size_bytes: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Voice {
        url: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        waveform: Vec<f32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender: Identity,
    pub receiver: Identity,
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default)]
    pub view_once: bool,
    pub sent_at: DateTime<Utc>,
}

impl MessagePayload {
    pub fn text(sender: Identity, receiver: Identity, content: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::generate(),
            sender,
            receiver,
            body: MessageBody::Text {
                content: content.into(),
            },
            view_once: false,
            sent_at: Utc::now(),
        }
    }

    /// One-line preview for chat lists and toasts.
    pub fn preview(&self) -> String {
        match &self.body {
            MessageBody::Text { content } => content.clone(),
            MessageBody::Media { filename, .. } => format!("sent {filename}"),
            MessageBody::Voice { duration_ms, .. } => {
                format!("voice message ({}s)", duration_ms / 1000)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadReceiptPayload {
    pub message_id: MessageId,
    /// Identity that read the message; the receipt routes back to the
    /// original sender.
    pub reader: Identity,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_id: NotificationId,
    pub kind: NotificationKind,
    pub sender: Identity,
    pub content: String,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactSummary {
    pub identity: Identity,
    pub display_name: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRequest {
    pub from: Identity,
    pub display_name: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_as_tagged_json() {
        let event = Event::unicast(
            EventKind::MessageDelivered {
                message: MessagePayload::text("alice".into(), "bob".into(), "hi"),
            },
            Identity::from("bob"),
        );
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"type\":\"message_delivered\""));

        let parsed: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.kind.event_type(), EventType::MessageDelivered);
        assert_eq!(parsed.target, Some(Identity::from("bob")));
    }

    #[test]
    fn presence_state_uses_snake_case_wire_names() {
        let json = serde_json::to_string(&PresenceState::Offline).expect("serialize");
        assert_eq!(json, "\"offline\"");
    }

    #[test]
    fn message_preview_summarizes_media() {
        let mut message = MessagePayload::text("alice".into(), "bob".into(), "hello");
        assert_eq!(message.preview(), "hello");

        message.body = MessageBody::Media {
            url: "https://cdn.example/abc".into(),
            filename: "photo.png".into(),
            size_bytes: 1024,
            mime_type: Some("image/png".into()),
        };
        assert_eq!(message.preview(), "sent photo.png");
    }

    #[test]
    fn client_message_tag_matches_protocol() {
        let frame = ClientMessage::PresenceUpdate {
            state: PresenceState::Online,
        };
        let json = serde_json::to_string(&frame).expect("serialize");
        assert!(json.contains("\"type\":\"presence_update\""));
    }
}
