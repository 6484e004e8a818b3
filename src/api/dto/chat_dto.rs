//! Chat DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::common_dto::PaginationMeta;
use crate::domain::{ChatMessage, CursorUpdate, MessageId, TripId, UserId};

/// Request body for `POST /trips/{trip_id}/chat/messages`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SendMessageRequest {
    /// Message body, at most 4096 bytes after trimming.
    #[serde(alias = "text")]
    pub content: String,
    /// Message being replied to.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub reply_to_id: Option<MessageId>,
}

/// A stored chat message.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MessageDto {
    /// Message identifier.
    #[schema(value_type = String)]
    pub id: MessageId,
    /// Trip.
    #[schema(value_type = String)]
    pub trip_id: TripId,
    /// Author.
    #[schema(value_type = String)]
    pub sender_id: UserId,
    /// Body.
    pub content: String,
    /// Content type.
    pub content_type: String,
    /// Replied-to message.
    #[schema(value_type = Option<String>)]
    pub reply_to_id: Option<MessageId>,
    /// Server timestamp.
    pub created_at: DateTime<Utc>,
}

impl From<ChatMessage> for MessageDto {
    fn from(m: ChatMessage) -> Self {
        Self {
            id: m.id,
            trip_id: m.trip_id,
            sender_id: m.sender_id,
            content: m.content,
            content_type: m.content_type,
            reply_to_id: m.reply_to_id,
            created_at: m.created_at,
        }
    }
}

/// Page of messages, newest first.
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageListResponse {
    /// Messages.
    pub data: Vec<MessageDto>,
    /// Page bounds.
    pub pagination: PaginationMeta,
}

/// Request body for adding a reaction.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ReactionRequest {
    /// Emoji, 1 to 32 characters.
    #[serde(alias = "reaction")]
    pub emoji: String,
}

/// Result of a reaction change.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReactionResponse {
    /// Message reacted to.
    #[schema(value_type = String)]
    pub message_id: MessageId,
    /// Emoji.
    pub emoji: String,
    /// `add` or `remove`.
    pub action: String,
    /// Whether the reaction set changed.
    pub changed: bool,
}

/// Request body for `POST /trips/{trip_id}/chat/read`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ReadCursorRequest {
    /// Newest message seen.
    #[serde(alias = "last_read_message_id")]
    #[schema(value_type = String)]
    pub message_id: MessageId,
}

/// Read cursor after an update.
#[derive(Debug, Serialize, ToSchema)]
pub struct ReadCursorResponse {
    /// Last message read.
    #[schema(value_type = String)]
    pub last_read_message_id: MessageId,
    /// Its timestamp.
    pub last_read_at: DateTime<Utc>,
    /// Whether this request moved the cursor.
    pub advanced: bool,
}

impl From<CursorUpdate> for ReadCursorResponse {
    fn from(u: CursorUpdate) -> Self {
        Self {
            last_read_message_id: u.cursor.last_read_message_id,
            last_read_at: u.cursor.last_read_at,
            advanced: u.advanced,
        }
    }
}
