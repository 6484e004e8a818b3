//! Persistence contracts used by the collaboration core.
//!
//! The core never talks to a database directly. It goes through the traits
//! below, which are implemented by an in-memory backend ([`memory`], used
//! for tests and single-node development) and a PostgreSQL backend
//! ([`postgres`]). Every method returns [`AppError`] so callers can
//! propagate with `?`.
//!
//! Operations that must be atomic (invitation acceptance, membership
//! changes guarded by the last-owner rule, status compare-and-set) are
//! single trait methods so each backend can run them in one transaction.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    ChatMessage, CursorUpdate, Invitation, InvitationId, InvitationStatus, MemberRole, Membership,
    MembershipStatus, MessageId, Reaction, Trip, TripId, TripStatus, User, UserId,
};
use crate::error::AppError;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Registered users.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Looks a user up by id.
    async fn get_user(&self, id: UserId) -> Result<Option<User>, AppError>;

    /// Looks a user up by email, case-insensitively.
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError>;

    /// Looks a user up by identity-provider subject.
    async fn find_user_by_subject(&self, subject: &str) -> Result<Option<User>, AppError>;
}

/// Trips.
#[async_trait]
pub trait TripStore: Send + Sync {
    /// Looks a trip up by id.
    async fn get_trip(&self, id: TripId) -> Result<Option<Trip>, AppError>;

    /// Moves a trip from `from` to `to` if it is still in `from`.
    ///
    /// Returns the updated trip, or [`AppError::InvalidTransition`] if the
    /// stored status no longer equals `from`.
    async fn compare_and_set_trip_status(
        &self,
        id: TripId,
        from: TripStatus,
        to: TripStatus,
    ) -> Result<Trip, AppError>;
}

/// Trip memberships.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Membership of `user` in `trip`, in any status.
    async fn get_membership(
        &self,
        trip: TripId,
        user: UserId,
    ) -> Result<Option<Membership>, AppError>;

    /// Every membership row of a trip.
    async fn list_members(&self, trip: TripId) -> Result<Vec<Membership>, AppError>;

    /// Trips in which `user` holds an effective membership.
    async fn list_active_trips(&self, user: UserId) -> Result<Vec<TripId>, AppError>;

    /// Changes role and status of an existing membership, refusing changes
    /// that would leave the trip without an active owner.
    async fn update_membership(
        &self,
        trip: TripId,
        user: UserId,
        role: MemberRole,
        status: MembershipStatus,
    ) -> Result<Membership, AppError>;
}

/// Chat messages, reactions and read cursors.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persists a message. The caller assigns id and `created_at`.
    /// Writing the same message twice is a no-op, so the call can be
    /// retried.
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), AppError>;

    /// Looks a message up by id.
    async fn get_message(&self, id: MessageId) -> Result<Option<ChatMessage>, AppError>;

    /// Messages of a trip, newest first.
    async fn list_messages(
        &self,
        trip: TripId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>, AppError>;

    /// `created_at` of the newest message in a trip.
    async fn latest_message_at(&self, trip: TripId) -> Result<Option<DateTime<Utc>>, AppError>;

    /// Adds a reaction. Returns `false` if it was already present.
    async fn add_reaction(&self, reaction: &Reaction) -> Result<bool, AppError>;

    /// Removes a reaction. Returns `false` if it was absent.
    async fn remove_reaction(&self, reaction: &Reaction) -> Result<bool, AppError>;

    /// Reactions on a message.
    async fn list_reactions(&self, message: MessageId) -> Result<Vec<Reaction>, AppError>;

    /// Moves the read cursor to `message` unless it already points at an
    /// equal or later position.
    async fn advance_read_cursor(
        &self,
        trip: TripId,
        user: UserId,
        message: &ChatMessage,
    ) -> Result<CursorUpdate, AppError>;
}

/// Invitations.
#[async_trait]
pub trait InvitationStore: Send + Sync {
    /// Stores a new pending invitation.
    ///
    /// Fails with [`AppError::Conflict`] if a pending invitation already
    /// exists for the same trip and email.
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), AppError>;

    /// Looks an invitation up by id.
    async fn get_invitation(&self, id: InvitationId) -> Result<Option<Invitation>, AppError>;

    /// Invitations of a trip, newest first.
    async fn list_invitations(&self, trip: TripId) -> Result<Vec<Invitation>, AppError>;

    /// Atomically accepts a pending invitation on behalf of `user`.
    ///
    /// Within one transaction: re-reads the invitation and fails with
    /// [`AppError::NotPending`] unless it is still pending, fails with
    /// [`AppError::AlreadyMember`] if `user` already holds an effective
    /// membership, then marks it accepted and inserts (or reactivates) the
    /// membership with the invitation's role.
    async fn accept_invitation(
        &self,
        id: InvitationId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Invitation, Membership), AppError>;

    /// Moves a pending invitation to `to`, failing with
    /// [`AppError::NotPending`] if it already left `PENDING`.
    async fn finish_invitation(
        &self,
        id: InvitationId,
        to: InvitationStatus,
        now: DateTime<Utc>,
    ) -> Result<Invitation, AppError>;

    /// Marks every pending invitation whose expiry is before `now` as
    /// expired. Returns how many changed.
    async fn expire_pending(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Everything the core needs from persistence.
pub trait Store:
    UserStore + TripStore + MembershipStore + ChatStore + InvitationStore + std::fmt::Debug
{
}

impl<T> Store for T where
    T: UserStore + TripStore + MembershipStore + ChatStore + InvitationStore + std::fmt::Debug
{
}

/// Loads the effective membership of `user` in `trip` within `deadline`.
///
/// # Errors
///
/// Returns [`AppError::NotMember`] if there is none, or
/// [`AppError::Unavailable`] if the lookup misses the deadline.
pub async fn require_member(
    store: &dyn Store,
    trip: TripId,
    user: UserId,
    deadline: std::time::Duration,
) -> Result<Membership, AppError> {
    crate::retry::with_deadline(
        deadline,
        "membership lookup",
        crate::retry::retry_transient(|| store.get_membership(trip, user)),
    )
    .await?
        .filter(Membership::is_effective)
        .ok_or(AppError::NotMember)
}
