//! In-memory store backend.
//!
//! All tables live behind one [`tokio::sync::RwLock`], so every trait
//! method is trivially atomic. Used by tests and single-node development
//! (`PERSISTENCE_BACKEND=memory`).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{ChatStore, InvitationStore, MembershipStore, TripStore, UserStore};
use crate::domain::{
    ChatMessage, CursorUpdate, Invitation, InvitationId, InvitationStatus, MemberRole, Membership,
    MembershipStatus, MessageId, Reaction, ReadCursor, Trip, TripId, TripStatus, User, UserId,
    ensure_owner_survives,
};
use crate::error::AppError;

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    trips: HashMap<TripId, Trip>,
    memberships: BTreeMap<(TripId, UserId), Membership>,
    messages: HashMap<MessageId, ChatMessage>,
    reactions: HashSet<Reaction>,
    cursors: HashMap<(TripId, UserId), ReadCursor>,
    invitations: HashMap<InvitationId, Invitation>,
}

/// Store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    failing: AtomicBool,
    fail_next: AtomicU32,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with a persistence error until
    /// switched back off. Used to exercise outage paths.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes the next `calls` calls fail with a persistence error, then
    /// recovers on its own.
    pub fn fail_next(&self, calls: u32) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        let flaky = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flaky || self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Persistence("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Inserts or replaces a user.
    pub async fn put_user(&self, user: User) {
        self.tables.write().await.users.insert(user.id, user);
    }

    /// Inserts or replaces a trip.
    pub async fn put_trip(&self, trip: Trip) {
        self.tables.write().await.trips.insert(trip.id, trip);
    }

    /// Inserts or replaces a membership.
    pub async fn put_membership(&self, membership: Membership) {
        self.tables
            .write()
            .await
            .memberships
            .insert((membership.trip_id, membership.user_id), membership);
    }

    /// Overwrites an invitation row as-is. Test seeding only.
    pub async fn put_invitation(&self, invitation: Invitation) {
        self.tables
            .write()
            .await
            .invitations
            .insert(invitation.id, invitation);
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, id: UserId) -> Result<Option<User>, AppError> {
        self.check()?;
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.email_matches(email)).cloned())
    }

    async fn find_user_by_subject(&self, subject: &str) -> Result<Option<User>, AppError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.subject == subject).cloned())
    }
}

#[async_trait]
impl TripStore for MemoryStore {
    async fn get_trip(&self, id: TripId) -> Result<Option<Trip>, AppError> {
        self.check()?;
        Ok(self.tables.read().await.trips.get(&id).cloned())
    }

    async fn compare_and_set_trip_status(
        &self,
        id: TripId,
        from: TripStatus,
        to: TripStatus,
    ) -> Result<Trip, AppError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let trip = tables
            .trips
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("trip {id}")))?;
        if trip.status != from {
            return Err(AppError::InvalidTransition {
                from: trip.status.to_string(),
                to: to.to_string(),
            });
        }
        trip.status = to;
        trip.updated_at = Utc::now();
        Ok(trip.clone())
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn get_membership(
        &self,
        trip: TripId,
        user: UserId,
    ) -> Result<Option<Membership>, AppError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .memberships
            .get(&(trip, user))
            .cloned())
    }

    async fn list_members(&self, trip: TripId) -> Result<Vec<Membership>, AppError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .memberships
            .values()
            .filter(|m| m.trip_id == trip)
            .cloned()
            .collect())
    }

    async fn list_active_trips(&self, user: UserId) -> Result<Vec<TripId>, AppError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .memberships
            .values()
            .filter(|m| m.user_id == user && m.is_effective())
            .map(|m| m.trip_id)
            .collect())
    }

    async fn update_membership(
        &self,
        trip: TripId,
        user: UserId,
        role: MemberRole,
        status: MembershipStatus,
    ) -> Result<Membership, AppError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let members: Vec<Membership> = tables
            .memberships
            .values()
            .filter(|m| m.trip_id == trip)
            .cloned()
            .collect();
        if !members.iter().any(|m| m.user_id == user) {
            return Err(AppError::NotFound(format!("member {user} in trip {trip}")));
        }
        ensure_owner_survives(&members, user, role, status)?;
        let membership = tables
            .memberships
            .get_mut(&(trip, user))
            .ok_or_else(|| AppError::NotFound(format!("member {user} in trip {trip}")))?;
        membership.role = role;
        membership.status = status;
        membership.updated_at = Utc::now();
        Ok(membership.clone())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn insert_message(&self, message: &ChatMessage) -> Result<(), AppError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        match tables.messages.get(&message.id) {
            Some(existing) if existing == message => return Ok(()),
            Some(_) => return Err(AppError::Conflict(format!("message {} exists", message.id))),
            None => {}
        }
        tables.messages.insert(message.id, message.clone());
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<ChatMessage>, AppError> {
        self.check()?;
        Ok(self.tables.read().await.messages.get(&id).cloned())
    }

    async fn list_messages(
        &self,
        trip: TripId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>, AppError> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut messages: Vec<ChatMessage> = tables
            .messages
            .values()
            .filter(|m| m.trip_id == trip)
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.canonical_cmp(a));
        Ok(messages
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn latest_message_at(&self, trip: TripId) -> Result<Option<DateTime<Utc>>, AppError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .values()
            .filter(|m| m.trip_id == trip)
            .map(|m| m.created_at)
            .max())
    }

    async fn add_reaction(&self, reaction: &Reaction) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.tables.write().await.reactions.insert(reaction.clone()))
    }

    async fn remove_reaction(&self, reaction: &Reaction) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.tables.write().await.reactions.remove(reaction))
    }

    async fn list_reactions(&self, message: MessageId) -> Result<Vec<Reaction>, AppError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .reactions
            .iter()
            .filter(|r| r.message_id == message)
            .cloned()
            .collect())
    }

    async fn advance_read_cursor(
        &self,
        trip: TripId,
        user: UserId,
        message: &ChatMessage,
    ) -> Result<CursorUpdate, AppError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let candidate = ReadCursor {
            trip_id: trip,
            user_id: user,
            last_read_message_id: message.id,
            last_read_at: message.created_at,
        };
        match tables.cursors.get(&(trip, user)) {
            Some(current)
                if (current.last_read_at, current.last_read_message_id)
                    >= (candidate.last_read_at, candidate.last_read_message_id) =>
            {
                Ok(CursorUpdate {
                    advanced: false,
                    cursor: current.clone(),
                })
            }
            _ => {
                tables.cursors.insert((trip, user), candidate.clone());
                Ok(CursorUpdate {
                    advanced: true,
                    cursor: candidate,
                })
            }
        }
    }
}

#[async_trait]
impl InvitationStore for MemoryStore {
    async fn insert_invitation(&self, invitation: &Invitation) -> Result<(), AppError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let duplicate = tables.invitations.values().any(|i| {
            i.trip_id == invitation.trip_id
                && i.status == InvitationStatus::Pending
                && i.invitee_email == invitation.invitee_email
        });
        if duplicate {
            return Err(AppError::Conflict(format!(
                "a pending invitation for {} already exists",
                invitation.invitee_email
            )));
        }
        tables.invitations.insert(invitation.id, invitation.clone());
        Ok(())
    }

    async fn get_invitation(&self, id: InvitationId) -> Result<Option<Invitation>, AppError> {
        self.check()?;
        Ok(self.tables.read().await.invitations.get(&id).cloned())
    }

    async fn list_invitations(&self, trip: TripId) -> Result<Vec<Invitation>, AppError> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut list: Vec<Invitation> = tables
            .invitations
            .values()
            .filter(|i| i.trip_id == trip)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }

    async fn accept_invitation(
        &self,
        id: InvitationId,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<(Invitation, Membership), AppError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let invitation = tables
            .invitations
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("invitation {id}")))?;
        if invitation.status != InvitationStatus::Pending {
            return Err(AppError::NotPending(invitation.status));
        }
        let key = (invitation.trip_id, user);
        if tables.memberships.get(&key).is_some_and(Membership::is_effective) {
            return Err(AppError::AlreadyMember);
        }

        let membership = match tables.memberships.get_mut(&key) {
            Some(existing) => {
                existing.role = invitation.role;
                existing.status = MembershipStatus::Active;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let mut fresh = Membership::active(invitation.trip_id, user, invitation.role);
                fresh.created_at = now;
                fresh.updated_at = now;
                tables.memberships.insert(key, fresh.clone());
                fresh
            }
        };
        let stored = tables
            .invitations
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("invitation {id}")))?;
        stored.status = InvitationStatus::Accepted;
        stored.invitee_id = Some(user);
        stored.updated_at = now;
        Ok((stored.clone(), membership))
    }

    async fn finish_invitation(
        &self,
        id: InvitationId,
        to: InvitationStatus,
        now: DateTime<Utc>,
    ) -> Result<Invitation, AppError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let invitation = tables
            .invitations
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("invitation {id}")))?;
        if invitation.status != InvitationStatus::Pending {
            return Err(AppError::NotPending(invitation.status));
        }
        invitation.status = to;
        invitation.updated_at = now;
        Ok(invitation.clone())
    }

    async fn expire_pending(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let mut expired = 0;
        for invitation in tables.invitations.values_mut() {
            if invitation.is_expired_at(now) {
                invitation.status = InvitationStatus::Expired;
                invitation.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn invitation(trip: TripId, email: &str, expires_at: DateTime<Utc>) -> Invitation {
        let now = Utc::now();
        Invitation {
            id: InvitationId::new(),
            trip_id: trip,
            inviter_id: UserId::new(),
            invitee_email: email.to_string(),
            invitee_id: None,
            role: MemberRole::Member,
            status: InvitationStatus::Pending,
            token: None,
            expires_at,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn second_pending_invitation_conflicts() {
        let store = MemoryStore::new();
        let trip = TripId::new();
        let later = Utc::now() + Duration::days(7);
        let first = invitation(trip, "a@example.com", later);
        assert!(store.insert_invitation(&first).await.is_ok());
        let second = invitation(trip, "a@example.com", later);
        let result = store.insert_invitation(&second).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn accept_is_single_winner() {
        let store = MemoryStore::new();
        let trip = TripId::new();
        let inv = invitation(trip, "a@example.com", Utc::now() + Duration::days(1));
        let Ok(()) = store.insert_invitation(&inv).await else {
            panic!("insert failed");
        };
        let user = UserId::new();
        let first = store.accept_invitation(inv.id, user, Utc::now()).await;
        let Ok((accepted, membership)) = first else {
            panic!("first accept should win");
        };
        assert_eq!(accepted.status, InvitationStatus::Accepted);
        assert_eq!(membership.role, MemberRole::Member);

        let second = store.accept_invitation(inv.id, user, Utc::now()).await;
        assert_eq!(
            second.err(),
            Some(AppError::NotPending(InvitationStatus::Accepted))
        );
    }

    #[tokio::test]
    async fn accept_rejects_existing_member() {
        let store = MemoryStore::new();
        let trip = TripId::new();
        let user = UserId::new();
        store
            .put_membership(Membership::active(trip, user, MemberRole::Member))
            .await;
        let inv = invitation(trip, "a@example.com", Utc::now() + Duration::days(1));
        let Ok(()) = store.insert_invitation(&inv).await else {
            panic!("insert failed");
        };
        let result = store.accept_invitation(inv.id, user, Utc::now()).await;
        assert_eq!(result.err(), Some(AppError::AlreadyMember));
        let Ok(Some(still)) = store.get_invitation(inv.id).await else {
            panic!("invitation vanished");
        };
        assert_eq!(still.status, InvitationStatus::Pending);
    }

    #[tokio::test]
    async fn expire_pending_only_touches_overdue() {
        let store = MemoryStore::new();
        let trip = TripId::new();
        let now = Utc::now();
        let overdue = invitation(trip, "a@example.com", now - Duration::minutes(1));
        let fresh = invitation(trip, "b@example.com", now + Duration::days(1));
        let _ = store.insert_invitation(&overdue).await;
        let _ = store.insert_invitation(&fresh).await;
        assert_eq!(store.expire_pending(now).await.ok(), Some(1));
        let Ok(Some(after)) = store.get_invitation(overdue.id).await else {
            panic!("missing");
        };
        assert_eq!(after.status, InvitationStatus::Expired);
        assert_eq!(store.expire_pending(now).await.ok(), Some(0));
    }

    #[tokio::test]
    async fn read_cursor_never_moves_backwards() {
        let store = MemoryStore::new();
        let trip = TripId::new();
        let user = UserId::new();
        let now = Utc::now();
        let older = ChatMessage {
            id: MessageId::new(),
            trip_id: trip,
            sender_id: user,
            content: "one".to_string(),
            content_type: "text".to_string(),
            reply_to_id: None,
            created_at: now,
        };
        let newer = ChatMessage {
            id: MessageId::new(),
            created_at: now + Duration::seconds(1),
            content: "two".to_string(),
            ..older.clone()
        };
        let Ok(first) = store.advance_read_cursor(trip, user, &newer).await else {
            panic!("advance failed");
        };
        assert!(first.advanced);
        let Ok(second) = store.advance_read_cursor(trip, user, &older).await else {
            panic!("advance failed");
        };
        assert!(!second.advanced);
        assert_eq!(second.cursor.last_read_message_id, newer.id);
    }

    #[tokio::test]
    async fn reactions_have_set_semantics() {
        let store = MemoryStore::new();
        let reaction = Reaction {
            message_id: MessageId::new(),
            user_id: UserId::new(),
            emoji: "👍".to_string(),
        };
        assert_eq!(store.add_reaction(&reaction).await.ok(), Some(true));
        assert_eq!(store.add_reaction(&reaction).await.ok(), Some(false));
        assert_eq!(store.remove_reaction(&reaction).await.ok(), Some(true));
        assert_eq!(store.remove_reaction(&reaction).await.ok(), Some(false));
    }

    #[tokio::test]
    async fn last_owner_cannot_leave() {
        let store = MemoryStore::new();
        let trip = TripId::new();
        let owner = UserId::new();
        store
            .put_membership(Membership::active(trip, owner, MemberRole::Owner))
            .await;
        let result = store
            .update_membership(trip, owner, MemberRole::Owner, MembershipStatus::Inactive)
            .await;
        assert_eq!(result.err(), Some(AppError::LastOwner));
    }

    #[tokio::test]
    async fn failing_switch_surfaces_persistence_errors() {
        let store = MemoryStore::new();
        store.set_failing(true);
        let result = store.get_user(UserId::new()).await;
        assert!(matches!(result, Err(AppError::Persistence(_))));
        store.set_failing(false);
        assert!(store.get_user(UserId::new()).await.is_ok());

        store.fail_next(2);
        assert!(store.get_user(UserId::new()).await.is_err());
        assert!(store.get_user(UserId::new()).await.is_err());
        assert!(store.get_user(UserId::new()).await.is_ok());
    }
}
