//! WebSocket wire types: inbound frames, acknowledgements and server frames.
//!
//! Inbound frames are `{"type": ..., "payload": {...}}`. Events are written
//! as the serialized [`crate::domain::Event`] itself; everything else the
//! server sends is one of the types below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{MemberRole, MessageId, ReactionAction, TripId};
use crate::error::AppError;

/// Top-level inbound envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: Value,
}

/// Inbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// Send a chat message.
    ChatMessage,
    /// Add or remove a reaction.
    ChatReaction,
    /// Advance the read cursor.
    ReadReceipt,
    /// Typing indicator.
    Typing,
    /// Application-level ping.
    Ping,
}

impl InboundKind {
    /// Maps a wire name. `chat.message.sent` is accepted as an alias of
    /// `chat_message`.
    #[must_use]
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "chat_message" | "chat.message.sent" => Some(Self::ChatMessage),
            "chat_reaction" => Some(Self::ChatReaction),
            "read_receipt" => Some(Self::ReadReceipt),
            "typing" => Some(Self::Typing),
            "ping" => Some(Self::Ping),
            _ => None,
        }
    }
}

/// Payload of `chat_message`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessagePayload {
    /// Message body.
    #[serde(alias = "content")]
    pub text: String,
    /// Message being replied to.
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    /// Target trip; required on the multi-trip endpoint.
    #[serde(default, alias = "group_id")]
    pub trip_id: Option<TripId>,
}

/// Payload of `chat_reaction`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReactionPayload {
    /// Message reacted to.
    pub message_id: MessageId,
    /// Emoji.
    #[serde(alias = "emoji")]
    pub reaction: String,
    /// Add or remove.
    pub action: ReactionAction,
    /// Target trip; required on the multi-trip endpoint.
    #[serde(default, alias = "group_id")]
    pub trip_id: Option<TripId>,
}

/// Payload of `read_receipt`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadReceiptPayload {
    /// Newest message the client has seen.
    #[serde(alias = "message_id")]
    pub last_read_message_id: MessageId,
    /// Target trip; required on the multi-trip endpoint.
    #[serde(default, alias = "group_id")]
    pub trip_id: Option<TripId>,
}

/// Payload of `typing`.
#[derive(Debug, Clone, Deserialize)]
pub struct TypingPayload {
    /// Whether the user is typing.
    #[serde(default)]
    pub is_typing: bool,
    /// Target trip; required on the multi-trip endpoint.
    #[serde(default, alias = "group_id")]
    pub trip_id: Option<TripId>,
}

/// Which request an [`Ack`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckKind {
    /// Answer to `chat_message`.
    MessageAck,
    /// Answer to `chat_reaction`.
    ReactionAck,
    /// Answer to `read_receipt`.
    ReadReceiptAck,
}

/// Outcome carried by an [`Ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Message stored.
    Sent,
    /// Reaction or receipt applied.
    Processed,
    /// Rejected; see `reason` and `code`.
    Failed,
}

/// Acknowledgement of a chat request.
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    /// Ack type.
    #[serde(rename = "type")]
    pub kind: AckKind,
    /// Message concerned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    /// Outcome.
    pub status: AckStatus,
    /// Server time.
    pub timestamp: DateTime<Utc>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Machine code of the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Ack {
    /// Successful acknowledgement.
    #[must_use]
    pub fn ok(kind: AckKind, message_id: Option<MessageId>) -> Self {
        let status = match kind {
            AckKind::MessageAck => AckStatus::Sent,
            AckKind::ReactionAck | AckKind::ReadReceiptAck => AckStatus::Processed,
        };
        Self {
            kind,
            message_id,
            status,
            timestamp: Utc::now(),
            reason: None,
            code: None,
        }
    }

    /// Failed acknowledgement carrying `err`.
    #[must_use]
    pub fn failed(kind: AckKind, message_id: Option<MessageId>, err: &AppError) -> Self {
        Self {
            kind,
            message_id,
            status: AckStatus::Failed,
            timestamp: Utc::now(),
            reason: Some(err.to_string()),
            code: Some(err.code().to_string()),
        }
    }
}

/// Error frame for requests that have no ack type.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrame {
    /// Human-readable message.
    pub error: String,
    /// Machine code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<&AppError> for ErrorFrame {
    fn from(err: &AppError) -> Self {
        Self {
            error: err.to_string(),
            code: Some(err.code().to_string()),
        }
    }
}

/// Body of the welcome frame.
#[derive(Debug, Clone, Serialize)]
pub struct WelcomeData {
    /// Greeting.
    pub message: String,
    /// Trip of a single-trip connection.
    #[serde(rename = "tripID")]
    pub trip_id: Option<TripId>,
    /// Caller's role in that trip.
    pub role: Option<MemberRole>,
}

/// Non-event frames written by the server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once after a connection is attached.
    Welcome {
        /// Greeting body.
        data: WelcomeData,
    },
    /// Answer to an application-level ping.
    Pong {
        /// Server time, RFC 3339.
        time: String,
    },
}

impl ServerFrame {
    /// Welcome frame for a single-trip connection.
    #[must_use]
    pub fn welcome(trip_id: Option<TripId>, role: Option<MemberRole>) -> Self {
        let message = if trip_id.is_some() {
            "Connected to trip chat"
        } else {
            "Connected to trip events"
        };
        Self::Welcome {
            data: WelcomeData {
                message: message.to_string(),
                trip_id,
                role,
            },
        }
    }

    /// Pong stamped with the current time.
    #[must_use]
    pub fn pong() -> Self {
        Self::Pong {
            time: Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_aliases() {
        assert_eq!(InboundKind::parse("chat.message.sent"), Some(InboundKind::ChatMessage));
        assert_eq!(InboundKind::parse("read_receipt"), Some(InboundKind::ReadReceipt));
        assert_eq!(InboundKind::parse("subscribe"), None);

        let Ok(payload) = serde_json::from_value::<ChatMessagePayload>(json!({
            "content": "hi",
            "group_id": "6f1c2f8e-0d7a-4c43-9a51-8f0e3a3b2c11"
        })) else {
            panic!("payload should parse");
        };
        assert_eq!(payload.text, "hi");
        assert!(payload.trip_id.is_some());
    }

    #[test]
    fn ack_shapes() {
        let id = MessageId::new();
        let sent = serde_json::to_value(Ack::ok(AckKind::MessageAck, Some(id))).unwrap_or_default();
        assert_eq!(sent["type"], "message_ack");
        assert_eq!(sent["status"], "sent");
        assert_eq!(sent["message_id"], id.to_string());
        assert!(sent.get("code").is_none());

        let err = AppError::RateLimited { retry_after_secs: 4 };
        let failed =
            serde_json::to_value(Ack::failed(AckKind::ReactionAck, None, &err)).unwrap_or_default();
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["code"], "RATE_LIMITED");
        assert!(failed.get("message_id").is_none());

        let receipt = serde_json::to_value(Ack::ok(AckKind::ReadReceiptAck, None)).unwrap_or_default();
        assert_eq!(receipt["status"], "processed");
    }

    #[test]
    fn welcome_and_pong_shapes() {
        let trip = TripId::new();
        let welcome = serde_json::to_value(ServerFrame::welcome(Some(trip), Some(MemberRole::Admin)))
            .unwrap_or_default();
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["data"]["message"], "Connected to trip chat");
        assert_eq!(welcome["data"]["tripID"], trip.to_string());
        assert_eq!(welcome["data"]["role"], "ADMIN");

        let pong = serde_json::to_value(ServerFrame::pong()).unwrap_or_default();
        assert_eq!(pong["type"], "pong");
        assert!(pong["time"].as_str().is_some_and(|t| t.contains('T')));
    }
}
