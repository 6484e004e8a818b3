//! Domain layer: identifiers, persisted entities and bus events.
//!
//! Everything here is plain data plus the invariants that can be checked
//! without I/O: trip status transitions, the role hierarchy, the
//! last-owner rule and invitation expiry.

pub mod chat;
pub mod event;
pub mod ids;
pub mod invitation;
pub mod membership;
pub mod trip;
pub mod user;

pub use chat::{CONTENT_TYPE_TEXT, ChatMessage, CursorUpdate, Reaction, ReactionAction, ReadCursor};
pub use event::{Event, EventMetadata, EventType};
pub use ids::{ConnectionId, EventId, InvitationId, MessageId, TripId, UserId};
pub use invitation::{Invitation, InvitationStatus};
pub use membership::{MemberRole, Membership, MembershipStatus, ensure_owner_survives};
pub use trip::{Destination, Trip, TripStatus};
pub use user::User;
