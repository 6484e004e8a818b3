//! Domain events published on the per-trip bus.
//!
//! Every state change in a trip produces an [`Event`]. Events are delivered
//! to WebSocket subscribers verbatim, so the serialized shape here is the
//! wire format: `{id, type, tripID, userID, timestamp, version,
//! metadata: {source}, payload}`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EventId, TripId, UserId};

/// Every event type the fabric knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A chat message was stored.
    #[serde(rename = "chat.message.sent")]
    ChatMessageSent,
    /// Someone started or stopped typing.
    #[serde(rename = "chat.typing")]
    ChatTyping,
    /// A reaction was added.
    #[serde(rename = "chat.reaction.added")]
    ChatReactionAdded,
    /// A reaction was removed.
    #[serde(rename = "chat.reaction.removed")]
    ChatReactionRemoved,
    /// A read cursor advanced.
    #[serde(rename = "chat.read_receipt")]
    ChatReadReceipt,
    /// Trip details or status changed.
    #[serde(rename = "trip.updated")]
    TripUpdated,
    /// A member joined.
    #[serde(rename = "trip.member.added")]
    TripMemberAdded,
    /// A member left or was removed.
    #[serde(rename = "trip.member.removed")]
    TripMemberRemoved,
    /// A member's role changed.
    #[serde(rename = "trip.member.role_changed")]
    TripMemberRoleChanged,
    /// An invitation was issued to a registered user.
    #[serde(rename = "trip.invitation.received")]
    TripInvitationReceived,
    /// A todo was created.
    #[serde(rename = "todo.created")]
    TodoCreated,
    /// A todo was updated.
    #[serde(rename = "todo.updated")]
    TodoUpdated,
    /// A todo was deleted.
    #[serde(rename = "todo.deleted")]
    TodoDeleted,
    /// A poll was created.
    #[serde(rename = "poll.created")]
    PollCreated,
    /// A vote was cast.
    #[serde(rename = "poll.voted")]
    PollVoted,
    /// A poll was closed.
    #[serde(rename = "poll.closed")]
    PollClosed,
    /// Weather for the destination changed.
    #[serde(rename = "weather.updated")]
    WeatherUpdated,
    /// A member shared a new location.
    #[serde(rename = "location.updated")]
    LocationUpdated,
    /// The node is draining connections.
    #[serde(rename = "server.shutting_down")]
    ServerShuttingDown,
}

impl EventType {
    /// Dotted wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChatMessageSent => "chat.message.sent",
            Self::ChatTyping => "chat.typing",
            Self::ChatReactionAdded => "chat.reaction.added",
            Self::ChatReactionRemoved => "chat.reaction.removed",
            Self::ChatReadReceipt => "chat.read_receipt",
            Self::TripUpdated => "trip.updated",
            Self::TripMemberAdded => "trip.member.added",
            Self::TripMemberRemoved => "trip.member.removed",
            Self::TripMemberRoleChanged => "trip.member.role_changed",
            Self::TripInvitationReceived => "trip.invitation.received",
            Self::TodoCreated => "todo.created",
            Self::TodoUpdated => "todo.updated",
            Self::TodoDeleted => "todo.deleted",
            Self::PollCreated => "poll.created",
            Self::PollVoted => "poll.voted",
            Self::PollClosed => "poll.closed",
            Self::WeatherUpdated => "weather.updated",
            Self::LocationUpdated => "location.updated",
            Self::ServerShuttingDown => "server.shutting_down",
        }
    }

    /// Lossy types may be dropped under backpressure regardless of the
    /// subscriber's overflow policy.
    #[must_use]
    pub const fn is_lossy(self) -> bool {
        matches!(self, Self::ChatTyping | Self::LocationUpdated)
    }

    /// Payload schema version for this type.
    #[must_use]
    pub const fn schema_version(self) -> u32 {
        1
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| crate::error::AppError::Validation(format!("unknown event type: {s}")))
    }
}

/// Where an event came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Producing subsystem, e.g. `"chat"` or `"invitation"`.
    pub source: String,
}

/// An immutable record published to a trip topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id; used for duplicate suppression across nodes.
    pub id: EventId,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Topic the event belongs to.
    #[serde(rename = "tripID")]
    pub trip_id: TripId,
    /// Acting user.
    #[serde(rename = "userID")]
    pub user_id: UserId,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Payload schema version.
    pub version: u32,
    /// Producer information.
    pub metadata: EventMetadata,
    /// Type-specific payload.
    pub payload: Value,
}

impl Event {
    /// Builds a new event with a fresh id and the current time.
    #[must_use]
    pub fn new(
        event_type: EventType,
        trip_id: TripId,
        user_id: UserId,
        source: &str,
        payload: Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            trip_id,
            user_id,
            timestamp: Utc::now(),
            version: event_type.schema_version(),
            metadata: EventMetadata {
                source: source.to_string(),
            },
            payload,
        }
    }

    /// Returns `true` if the event may be dropped under backpressure.
    #[must_use]
    pub const fn is_lossy(&self) -> bool {
        self.event_type.is_lossy()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_uses_original_field_names() {
        let trip = TripId::new();
        let user = UserId::new();
        let event = Event::new(
            EventType::ChatMessageSent,
            trip,
            user,
            "chat",
            json!({"text": "hi"}),
        );
        let Ok(value) = serde_json::to_value(&event) else {
            panic!("event should serialize");
        };
        assert_eq!(value["type"], "chat.message.sent");
        assert_eq!(value["tripID"], trip.to_string());
        assert_eq!(value["userID"], user.to_string());
        assert_eq!(value["metadata"]["source"], "chat");
        assert_eq!(value["payload"]["text"], "hi");
        assert_eq!(value["version"], 1);
    }

    #[test]
    fn round_trips_through_json() {
        let event = Event::new(
            EventType::TripMemberAdded,
            TripId::new(),
            UserId::new(),
            "invitation",
            json!({"role": "MEMBER"}),
        );
        let Ok(text) = serde_json::to_string(&event) else {
            panic!("serialize");
        };
        let Ok(back) = serde_json::from_str::<Event>(&text) else {
            panic!("deserialize");
        };
        assert_eq!(back, event);
    }

    #[test]
    fn only_typing_and_location_are_lossy() {
        assert!(EventType::ChatTyping.is_lossy());
        assert!(EventType::LocationUpdated.is_lossy());
        assert!(!EventType::ChatMessageSent.is_lossy());
        assert!(!EventType::TripMemberRemoved.is_lossy());
    }

    #[test]
    fn parses_dotted_names() {
        assert_eq!(
            "chat.read_receipt".parse::<EventType>().ok(),
            Some(EventType::ChatReadReceipt)
        );
        assert!("chat.unknown".parse::<EventType>().is_err());
        assert_eq!(EventType::PollVoted.to_string(), "poll.voted");
    }
}
