//! Chat messages, reactions and read cursors.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, TripId, UserId};

/// Default content type for chat messages.
pub const CONTENT_TYPE_TEXT: &str = "text";

/// A persisted chat message.
///
/// Trip-wide chat: the chat group of a trip is the trip itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message identifier.
    pub id: MessageId,
    /// Trip the message belongs to.
    pub trip_id: TripId,
    /// Author.
    pub sender_id: UserId,
    /// Message body.
    pub content: String,
    /// Content type, `"text"` unless stated otherwise.
    pub content_type: String,
    /// Message this one replies to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// Server-assigned timestamp, strictly increasing per trip.
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Canonical per-trip order: `created_at`, then id.
    #[must_use]
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        (self.created_at, self.id).cmp(&(other.created_at, other.id))
    }

    /// Position of this message in the canonical order.
    #[must_use]
    pub const fn position(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

/// A single emoji reaction. `(message_id, user_id, emoji)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    /// Reacted-to message.
    pub message_id: MessageId,
    /// Reacting user.
    pub user_id: UserId,
    /// Emoji.
    pub emoji: String,
}

/// Add or remove a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    /// Add the reaction (no-op if present).
    Add,
    /// Remove the reaction (no-op if absent).
    Remove,
}

impl std::str::FromStr for ReactionAction {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            other => Err(crate::error::AppError::Validation(format!(
                "reaction action must be add or remove, got {other:?}"
            ))),
        }
    }
}

/// Per (trip, user) read position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadCursor {
    /// Trip.
    pub trip_id: TripId,
    /// Reader.
    pub user_id: UserId,
    /// Last message read.
    pub last_read_message_id: MessageId,
    /// `created_at` of that message; cursor order follows it.
    pub last_read_at: DateTime<Utc>,
}

/// Outcome of a cursor update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorUpdate {
    /// Whether the cursor moved forward.
    pub advanced: bool,
    /// Cursor after the update.
    pub cursor: ReadCursor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn msg_at(at: DateTime<Utc>, id: u128) -> ChatMessage {
        ChatMessage {
            id: MessageId::from_uuid(uuid::Uuid::from_u128(id)),
            trip_id: TripId::new(),
            sender_id: UserId::new(),
            content: "hi".to_string(),
            content_type: CONTENT_TYPE_TEXT.to_string(),
            reply_to_id: None,
            created_at: at,
        }
    }

    #[test]
    fn ordering_uses_time_then_id() {
        let now = Utc::now();
        let a = msg_at(now, 2);
        let b = msg_at(now + Duration::milliseconds(1), 1);
        let c = msg_at(now, 3);
        assert_eq!(a.canonical_cmp(&b), Ordering::Less);
        assert_eq!(a.canonical_cmp(&c), Ordering::Less);
    }

    #[test]
    fn reaction_action_parses() {
        assert_eq!("add".parse::<ReactionAction>().ok(), Some(ReactionAction::Add));
        assert!("toggle".parse::<ReactionAction>().is_err());
    }
}
