//! Invitation lifecycle: create, accept, decline, revoke, expire.
//!
//! ```text
//! PENDING ──accept──▶ ACCEPTED
//!    │ ├──decline/revoke──▶ DECLINED
//!    │ └──expiry (sweeper or lazy check)──▶ EXPIRED
//! ```
//!
//! Terminal states absorb. Acceptance flips the invitation and inserts the
//! membership in one store transaction, so of two racing accepts exactly
//! one wins and the other sees `NOT_PENDING` or `ALREADY_MEMBER`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::notifier::{Notifier, notify_detached};
use super::token::InvitationTokens;
use crate::bus::EventBus;
use crate::domain::{
    Event, EventType, Invitation, InvitationId, InvitationStatus, MemberRole, Membership, Trip,
    TripId, User, UserId,
};
use crate::error::AppError;
use crate::retry::{retry_transient, with_deadline};
use crate::session::SessionRegistry;
use crate::store::{Store, require_member};

const EVENT_SOURCE: &str = "invitations";

/// Tunables for [`InvitationService`].
#[derive(Debug, Clone)]
pub struct InvitationSettings {
    /// Lifetime of a new invitation.
    pub ttl: chrono::Duration,
    /// Frontend base URL for deep-link redirects, without trailing slash.
    pub frontend_url: String,
    /// Bound on the notification side effect.
    pub notify_timeout: Duration,
    /// Bound on individual store lookups.
    pub lookup_timeout: Duration,
}

impl Default for InvitationSettings {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::days(7),
            frontend_url: "http://localhost:3000".to_string(),
            notify_timeout: Duration::from_secs(30),
            lookup_timeout: Duration::from_secs(5),
        }
    }
}

/// Public view of an invitation for the join page.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationDetails {
    /// The invitation, without its token.
    pub invitation: Invitation,
    /// Trip being joined.
    pub trip: Trip,
    /// Who sent it, if the account still exists.
    pub inviter: Option<User>,
    /// Active members of the trip.
    pub member_count: usize,
}

/// Invitation state machine.
#[derive(Debug)]
pub struct InvitationService {
    store: Arc<dyn Store>,
    bus: EventBus,
    registry: Arc<SessionRegistry>,
    tokens: InvitationTokens,
    notifier: Arc<dyn Notifier>,
    settings: InvitationSettings,
}

impl InvitationService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        bus: EventBus,
        registry: Arc<SessionRegistry>,
        tokens: InvitationTokens,
        notifier: Arc<dyn Notifier>,
        settings: InvitationSettings,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            tokens,
            notifier,
            settings,
        }
    }

    /// Invites `email` to `trip` with `role`.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`] if the trip does not exist.
    /// - [`AppError::NotMember`] / [`AppError::Forbidden`] unless the
    ///   inviter is an active ADMIN or OWNER.
    /// - [`AppError::Validation`] for a malformed email, a self-invite or a
    ///   role other than ADMIN or MEMBER.
    /// - [`AppError::AlreadyMember`] if the email belongs to a member.
    /// - [`AppError::Conflict`] if a pending invitation already exists.
    pub async fn create(
        &self,
        trip_id: TripId,
        inviter: &User,
        email: &str,
        role: MemberRole,
    ) -> Result<Invitation, AppError> {
        let trip = self.trip(trip_id).await?;
        let membership = self.member(trip_id, inviter.id).await?;
        if !membership.role.is_authorized_for(MemberRole::Admin) {
            return Err(AppError::Forbidden(
                "only trip owners and admins can send invitations".to_string(),
            ));
        }
        if !matches!(role, MemberRole::Admin | MemberRole::Member) {
            return Err(AppError::Validation(
                "invitation role must be ADMIN or MEMBER".to_string(),
            ));
        }
        let email = Invitation::normalize_email(email);
        if !looks_like_email(&email) {
            return Err(AppError::Validation(format!("{email:?} is not an email address")));
        }
        if inviter.email_matches(&email) {
            return Err(AppError::Validation("you cannot invite yourself".to_string()));
        }

        let invitee = retry_transient(|| self.store.find_user_by_email(&email)).await?;
        if let Some(user) = &invitee
            && retry_transient(|| self.store.get_membership(trip_id, user.id))
                .await?
                .is_some_and(|m| m.is_effective())
        {
            return Err(AppError::AlreadyMember);
        }

        let now = Utc::now();
        let mut invitation = Invitation {
            id: InvitationId::new(),
            trip_id,
            inviter_id: inviter.id,
            invitee_email: email,
            invitee_id: invitee.as_ref().map(|u| u.id),
            role,
            status: InvitationStatus::Pending,
            token: None,
            expires_at: now + self.settings.ttl,
            created_at: now,
            updated_at: now,
        };
        let token = self.tokens.issue(&invitation, now)?;
        invitation.token = Some(token.clone());
        self.store.insert_invitation(&invitation).await?;

        tracing::info!(
            invitation_id = %invitation.id,
            trip_id = %trip_id,
            inviter_id = %inviter.id,
            %role,
            "invitation created"
        );

        // Unregistered invitees hear about it out of band.
        if let Some(recipient) = invitation.invitee_id {
            let event = Event::new(
                EventType::TripInvitationReceived,
                trip_id,
                recipient,
                EVENT_SOURCE,
                json!({
                    "invitationId": invitation.id,
                    "tripId": trip_id,
                    "tripName": trip.name,
                    "inviterId": inviter.id,
                    "inviterName": inviter.label(),
                    "inviteeEmail": invitation.invitee_email,
                    "inviteeId": invitation.invitee_id,
                    "role": role,
                    "expiresAt": invitation.expires_at,
                    "token": token,
                }),
            );
            drop(notify_detached(
                Arc::clone(&self.notifier),
                event,
                self.settings.notify_timeout,
            ));
        }
        Ok(invitation)
    }

    /// Accepts the invitation named by `token` on behalf of `user`.
    ///
    /// Checks run in this order: token, existence, pending (expiring
    /// lazily), bound invitee, email, existing membership.
    ///
    /// # Errors
    ///
    /// `AUTHN_FAILED`, `NOT_FOUND`, `NOT_PENDING`, `AUTH_MISMATCH`,
    /// `EMAIL_MISMATCH` or `ALREADY_MEMBER`, in that order of precedence.
    pub async fn accept(&self, token: &str, user: &User) -> Result<Membership, AppError> {
        let invitation = self.from_token(token).await?;
        self.accept_checked(invitation, user).await
    }

    /// Accepts an invitation by id for an authenticated invitee.
    ///
    /// # Errors
    ///
    /// As [`InvitationService::accept`], without the token step.
    pub async fn accept_by_id(&self, id: InvitationId, user: &User) -> Result<Membership, AppError> {
        let invitation = self.load(id).await?;
        self.accept_checked(invitation, user).await
    }

    /// Declines the invitation named by `token`.
    ///
    /// # Errors
    ///
    /// As [`InvitationService::accept`], minus `ALREADY_MEMBER`.
    pub async fn decline(&self, token: &str, user: &User) -> Result<Invitation, AppError> {
        let invitation = self.from_token(token).await?;
        self.decline_checked(invitation, user).await
    }

    /// Declines an invitation by id.
    ///
    /// # Errors
    ///
    /// As [`InvitationService::decline`], without the token step.
    pub async fn decline_by_id(&self, id: InvitationId, user: &User) -> Result<Invitation, AppError> {
        let invitation = self.load(id).await?;
        self.decline_checked(invitation, user).await
    }

    /// Withdraws a pending invitation. The invitation ends up DECLINED.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`] if it does not belong to `trip_id`.
    /// - [`AppError::Forbidden`] unless `actor` is an ADMIN or OWNER.
    /// - [`AppError::NotPending`] if it already left PENDING.
    pub async fn revoke(
        &self,
        trip_id: TripId,
        id: InvitationId,
        actor: &User,
    ) -> Result<Invitation, AppError> {
        let invitation = self.load(id).await?;
        if invitation.trip_id != trip_id {
            return Err(AppError::NotFound("invitation".to_string()));
        }
        let membership = self.member(trip_id, actor.id).await?;
        if !membership.role.is_authorized_for(MemberRole::Admin) {
            return Err(AppError::Forbidden(
                "only trip owners and admins can revoke invitations".to_string(),
            ));
        }
        if invitation.status != InvitationStatus::Pending {
            return Err(AppError::NotPending(invitation.status));
        }
        let revoked = self
            .store
            .finish_invitation(id, InvitationStatus::Declined, Utc::now())
            .await?;
        tracing::info!(invitation_id = %id, %trip_id, actor_id = %actor.id, "invitation revoked");
        Ok(revoked)
    }

    /// Invitations of a trip for one of its members. Tokens are only shown
    /// to ADMIN and OWNER.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotMember`] if `actor` is not an active member.
    pub async fn list_for_trip(&self, trip_id: TripId, actor: &User) -> Result<Vec<Invitation>, AppError> {
        let membership = self.member(trip_id, actor.id).await?;
        let mut invitations = self.store.list_invitations(trip_id).await?;
        if !membership.role.is_admin() {
            for inv in &mut invitations {
                inv.token = None;
            }
        }
        Ok(invitations)
    }

    /// Public details behind a token for the join page.
    ///
    /// # Errors
    ///
    /// [`AppError::AuthnFailed`] for a bad token, [`AppError::NotFound`]
    /// if the invitation or its trip is gone.
    pub async fn details(&self, token: &str) -> Result<InvitationDetails, AppError> {
        let mut invitation = self.from_token(token).await?;
        let now = Utc::now();
        if invitation.is_expired_at(now) {
            invitation.status = self.expire(invitation.id, now).await?;
        }
        invitation.token = None;
        let trip = self.trip(invitation.trip_id).await?;
        let inviter = self.store.get_user(invitation.inviter_id).await?;
        let member_count = self
            .store
            .list_members(invitation.trip_id)
            .await?
            .iter()
            .filter(|m| m.is_effective())
            .count();
        Ok(InvitationDetails {
            invitation,
            trip,
            inviter,
            member_count,
        })
    }

    /// Where the frontend should send someone who opened an invitation
    /// link. Never fails; every problem becomes an `error` query value.
    pub async fn resolve_deep_link(&self, token: Option<&str>) -> String {
        let base = self.settings.frontend_url.as_str();
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return format!("{base}/join-trip?error=missing_token");
        };
        let Ok(claims) = self.tokens.verify(token) else {
            return format!("{base}/join-trip?error=invalid_token");
        };
        let invitation = match self.store.get_invitation(claims.invitation_id).await {
            Ok(Some(inv)) if inv.trip_id == claims.trip_id => inv,
            Ok(_) => return format!("{base}/join-trip?error=invitation_not_found"),
            Err(e) => {
                tracing::warn!(invitation_id = %claims.invitation_id, error = %e, "deep link lookup failed");
                return format!("{base}/join-trip?error=invitation_not_found");
            }
        };

        let now = Utc::now();
        let status = if invitation.is_expired_at(now) {
            self.expire(invitation.id, now)
                .await
                .unwrap_or(InvitationStatus::Expired)
        } else {
            invitation.status
        };
        match status {
            InvitationStatus::Pending => format!("{base}/join-trip?token={token}"),
            InvitationStatus::Accepted => {
                format!("{base}/trips/{}?message=already_joined", invitation.trip_id)
            }
            other => format!("{base}/join-trip?error=invitation_processed&status={other}"),
        }
    }

    /// Expires every overdue pending invitation. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        self.store.expire_pending(now).await
    }

    /// Spawns the periodic expiry sweeper.
    #[must_use]
    pub fn spawn_sweeper(&self, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match store.expire_pending(Utc::now()).await {
                        Ok(0) => {}
                        Ok(expired) => tracing::info!(expired, "expired pending invitations"),
                        Err(e) => tracing::warn!(error = %e, "invitation sweep failed"),
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn trip(&self, id: TripId) -> Result<Trip, AppError> {
        with_deadline(
            self.settings.lookup_timeout,
            "trip lookup",
            retry_transient(|| self.store.get_trip(id)),
        )
        .await?
            .ok_or_else(|| AppError::NotFound("trip".to_string()))
    }

    async fn member(&self, trip: TripId, user: UserId) -> Result<Membership, AppError> {
        require_member(self.store.as_ref(), trip, user, self.settings.lookup_timeout).await
    }

    async fn load(&self, id: InvitationId) -> Result<Invitation, AppError> {
        with_deadline(
            self.settings.lookup_timeout,
            "invitation lookup",
            retry_transient(|| self.store.get_invitation(id)),
        )
        .await?
        .ok_or_else(|| AppError::NotFound("invitation".to_string()))
    }

    async fn from_token(&self, token: &str) -> Result<Invitation, AppError> {
        let claims = self.tokens.verify(token)?;
        let invitation = self.load(claims.invitation_id).await?;
        if invitation.trip_id != claims.trip_id {
            return Err(AppError::AuthnFailed(
                "token does not match its invitation".to_string(),
            ));
        }
        Ok(invitation)
    }

    /// Marks an overdue invitation EXPIRED and returns the resulting status.
    async fn expire(&self, id: InvitationId, now: DateTime<Utc>) -> Result<InvitationStatus, AppError> {
        match self
            .store
            .finish_invitation(id, InvitationStatus::Expired, now)
            .await
        {
            Ok(inv) => {
                tracing::debug!(invitation_id = %id, "invitation expired on access");
                Ok(inv.status)
            }
            Err(AppError::NotPending(status)) => Ok(status),
            Err(e) => Err(e),
        }
    }

    /// Pending, addressed to `user`.
    async fn ensure_actionable(&self, invitation: &Invitation, user: &User) -> Result<(), AppError> {
        let now = Utc::now();
        if invitation.is_expired_at(now) {
            let status = self.expire(invitation.id, now).await?;
            return Err(AppError::NotPending(status));
        }
        if invitation.status != InvitationStatus::Pending {
            return Err(AppError::NotPending(invitation.status));
        }
        if let Some(bound) = invitation.invitee_id
            && bound != user.id
        {
            return Err(AppError::AuthMismatch);
        }
        if !user.email_matches(&invitation.invitee_email) {
            return Err(AppError::EmailMismatch);
        }
        Ok(())
    }

    async fn accept_checked(&self, invitation: Invitation, user: &User) -> Result<Membership, AppError> {
        self.ensure_actionable(&invitation, user).await?;
        let (accepted, membership) = self
            .store
            .accept_invitation(invitation.id, user.id, Utc::now())
            .await?;
        tracing::info!(
            invitation_id = %accepted.id,
            trip_id = %accepted.trip_id,
            user_id = %user.id,
            role = %membership.role,
            "invitation accepted"
        );

        let event = Event::new(
            EventType::TripMemberAdded,
            accepted.trip_id,
            user.id,
            EVENT_SOURCE,
            json!({
                "userId": user.id,
                "username": user.username,
                "role": membership.role,
                "invitationId": accepted.id,
            }),
        );
        self.registry.announce(&self.bus, event).await;
        Ok(membership)
    }

    async fn decline_checked(&self, invitation: Invitation, user: &User) -> Result<Invitation, AppError> {
        self.ensure_actionable(&invitation, user).await?;
        let declined = self
            .store
            .finish_invitation(invitation.id, InvitationStatus::Declined, Utc::now())
            .await?;
        tracing::info!(invitation_id = %declined.id, user_id = %user.id, "invitation declined");
        Ok(declined)
    }
}

/// Cheap structural check; deliverability is the mail provider's problem.
fn looks_like_email(email: &str) -> bool {
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, SubscribeOptions};
    use crate::store::{InvitationStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, event: &Event) -> Result<(), AppError> {
            if let Ok(mut events) = self.events.lock() {
                events.push(event.clone());
            }
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: EventBus,
        service: Arc<InvitationService>,
        notifier: Arc<Recorder>,
        trip: Trip,
        owner: User,
        bo: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dyn_store = Arc::clone(&store) as Arc<dyn Store>;
        let bus = EventBus::new(BusConfig::default());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&dyn_store), Duration::from_secs(1)));
        let notifier = Arc::new(Recorder::default());
        let service = Arc::new(InvitationService::new(
            dyn_store,
            bus.clone(),
            registry,
            InvitationTokens::new("test-secret"),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            InvitationSettings {
                frontend_url: "https://app.test".to_string(),
                ..InvitationSettings::default()
            },
        ));

        let owner = User::new("ana@example.com", "ana");
        let bo = User::new("Bo@Example.com", "bo");
        let trip = Trip::new("Lisbon", owner.id);
        store.put_user(owner.clone()).await;
        store.put_user(bo.clone()).await;
        store.put_trip(trip.clone()).await;
        store
            .put_membership(Membership::active(trip.id, owner.id, MemberRole::Owner))
            .await;
        Fixture {
            store,
            bus,
            service,
            notifier,
            trip,
            owner,
            bo,
        }
    }

    async fn invite_bo(f: &Fixture) -> Invitation {
        let Ok(inv) = f
            .service
            .create(f.trip.id, &f.owner, " BO@example.com ", MemberRole::Member)
            .await
        else {
            panic!("create should succeed");
        };
        inv
    }

    fn token(inv: &Invitation) -> String {
        inv.token.clone().unwrap_or_default()
    }

    #[test]
    fn email_shape() {
        assert!(looks_like_email("a@b.co"));
        assert!(!looks_like_email("a@b"));
        assert!(!looks_like_email("@b.co"));
        assert!(!looks_like_email("a b@c.co"));
        assert!(!looks_like_email("a@b@c.co"));
    }

    #[tokio::test]
    async fn create_normalizes_binds_and_notifies() {
        let f = fixture().await;
        let inv = invite_bo(&f).await;
        assert_eq!(inv.invitee_email, "bo@example.com");
        assert_eq!(inv.invitee_id, Some(f.bo.id));
        assert_eq!(inv.status, InvitationStatus::Pending);
        assert!(inv.token.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let recorded = f.notifier.events.lock().map(|e| e.clone()).unwrap_or_default();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded.first().map(|e| e.event_type), Some(EventType::TripInvitationReceived));
        assert_eq!(recorded.first().map(|e| e.user_id), Some(f.bo.id));
    }

    #[tokio::test]
    async fn unregistered_invitee_gets_no_notification() {
        let f = fixture().await;
        let Ok(inv) = f
            .service
            .create(f.trip.id, &f.owner, "nobody@example.com", MemberRole::Member)
            .await
        else {
            panic!("create should succeed");
        };
        assert_eq!(inv.invitee_id, None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let recorded = f.notifier.events.lock().map(|e| e.len()).unwrap_or_default();
        assert_eq!(recorded, 0);
    }

    #[tokio::test]
    async fn create_survives_transient_store_failures() {
        let f = fixture().await;
        f.store.fail_next(2);
        let inv = invite_bo(&f).await;
        let Ok(Some(stored)) = f.store.get_invitation(inv.id).await else {
            panic!("invitation should be stored");
        };
        assert_eq!(stored.status, InvitationStatus::Pending);
    }

    #[tokio::test]
    async fn create_rules() {
        let f = fixture().await;
        let _ = invite_bo(&f).await;
        let dup = f
            .service
            .create(f.trip.id, &f.owner, "bo@example.com", MemberRole::Admin)
            .await;
        assert!(matches!(dup, Err(AppError::Conflict(_))));

        let owner_role = f
            .service
            .create(f.trip.id, &f.owner, "cy@example.com", MemberRole::Owner)
            .await;
        assert!(matches!(owner_role, Err(AppError::Validation(_))));

        let bad_email = f
            .service
            .create(f.trip.id, &f.owner, "not-an-email", MemberRole::Member)
            .await;
        assert!(matches!(bad_email, Err(AppError::Validation(_))));

        let outsider = f
            .service
            .create(f.trip.id, &f.bo, "cy@example.com", MemberRole::Member)
            .await;
        assert_eq!(outsider.map(|i| i.id), Err(AppError::NotMember));

        let plain = User::new("dee@example.com", "dee");
        f.store
            .put_membership(Membership::active(f.trip.id, plain.id, MemberRole::Member))
            .await;
        let member = f
            .service
            .create(f.trip.id, &plain, "cy@example.com", MemberRole::Member)
            .await;
        assert!(matches!(member, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn accept_adds_member_and_publishes() {
        let f = fixture().await;
        let inv = invite_bo(&f).await;
        let Ok(sub) = f
            .bus
            .subscribe(f.trip.id, f.owner.id, SubscribeOptions::default())
            .await
        else {
            panic!("subscribe failed");
        };

        let Ok(membership) = f.service.accept(&token(&inv), &f.bo).await else {
            panic!("accept should succeed");
        };
        assert_eq!(membership.role, MemberRole::Member);
        let Some(event) = sub.recv().await else {
            panic!("member.added missing");
        };
        assert_eq!(event.event_type, EventType::TripMemberAdded);
        assert_eq!(event.user_id, f.bo.id);

        assert_eq!(
            f.service.accept(&token(&inv), &f.bo).await.map(|m| m.role),
            Err(AppError::NotPending(InvitationStatus::Accepted))
        );
    }

    #[tokio::test]
    async fn racing_accepts_have_one_winner() {
        let f = fixture().await;
        let inv = invite_bo(&f).await;
        let t = token(&inv);
        let a = {
            let (service, t, bo) = (Arc::clone(&f.service), t.clone(), f.bo.clone());
            tokio::spawn(async move { service.accept(&t, &bo).await })
        };
        let b = {
            let (service, t, bo) = (Arc::clone(&f.service), t.clone(), f.bo.clone());
            tokio::spawn(async move { service.accept(&t, &bo).await })
        };
        let (Ok(a), Ok(b)) = (a.await, b.await) else {
            panic!("tasks panicked");
        };
        let wins = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(
            loser,
            Err(AppError::NotPending(_) | AppError::AlreadyMember)
        ));
    }

    #[tokio::test]
    async fn accept_error_precedence() {
        let f = fixture().await;
        assert!(matches!(
            f.service.accept("garbage", &f.bo).await,
            Err(AppError::AuthnFailed(_))
        ));

        let inv = invite_bo(&f).await;
        let intruder = User::new("bo@example.com", "impostor");
        assert_eq!(
            f.service.accept(&token(&inv), &intruder).await.map(|m| m.role),
            Err(AppError::AuthMismatch)
        );

        let unbound = f
            .service
            .create(f.trip.id, &f.owner, "new@example.com", MemberRole::Member)
            .await;
        let Ok(unbound) = unbound else {
            panic!("create should succeed");
        };
        assert_eq!(
            f.service.accept(&token(&unbound), &f.bo).await.map(|m| m.role),
            Err(AppError::EmailMismatch)
        );
    }

    #[tokio::test]
    async fn overdue_invitation_expires_lazily() {
        let f = fixture().await;
        let mut inv = invite_bo(&f).await;
        inv.expires_at = Utc::now() - chrono::Duration::minutes(1);
        f.store.put_invitation(inv.clone()).await;

        assert_eq!(
            f.service.accept(&token(&inv), &f.bo).await.map(|m| m.role),
            Err(AppError::NotPending(InvitationStatus::Expired))
        );
        let Ok(Some(stored)) = f.store.get_invitation(inv.id).await else {
            panic!("invitation should exist");
        };
        assert_eq!(stored.status, InvitationStatus::Expired);
    }

    #[tokio::test]
    async fn decline_and_revoke() {
        let f = fixture().await;
        let inv = invite_bo(&f).await;
        let Ok(declined) = f.service.decline(&token(&inv), &f.bo).await else {
            panic!("decline should succeed");
        };
        assert_eq!(declined.status, InvitationStatus::Declined);
        assert_eq!(
            f.service.revoke(f.trip.id, inv.id, &f.owner).await.map(|i| i.status),
            Err(AppError::NotPending(InvitationStatus::Declined))
        );

        let Ok(second) = f
            .service
            .create(f.trip.id, &f.owner, "bo@example.com", MemberRole::Member)
            .await
        else {
            panic!("re-invite after decline should succeed");
        };
        assert!(matches!(
            f.service.revoke(TripId::new(), second.id, &f.owner).await,
            Err(AppError::NotFound(_))
        ));
        let Ok(revoked) = f.service.revoke(f.trip.id, second.id, &f.owner).await else {
            panic!("revoke should succeed");
        };
        assert_eq!(revoked.status, InvitationStatus::Declined);
    }

    #[tokio::test]
    async fn deep_links() {
        let f = fixture().await;
        assert_eq!(
            f.service.resolve_deep_link(None).await,
            "https://app.test/join-trip?error=missing_token"
        );
        assert_eq!(
            f.service.resolve_deep_link(Some("nope")).await,
            "https://app.test/join-trip?error=invalid_token"
        );

        let inv = invite_bo(&f).await;
        let t = token(&inv);
        assert_eq!(
            f.service.resolve_deep_link(Some(&t)).await,
            format!("https://app.test/join-trip?token={t}")
        );
        let _ = f.service.accept(&t, &f.bo).await;
        assert_eq!(
            f.service.resolve_deep_link(Some(&t)).await,
            format!("https://app.test/trips/{}?message=already_joined", f.trip.id)
        );

        let Ok(other) = f
            .service
            .create(f.trip.id, &f.owner, "zed@example.com", MemberRole::Member)
            .await
        else {
            panic!("create should succeed");
        };
        let _ = f.service.revoke(f.trip.id, other.id, &f.owner).await;
        assert_eq!(
            f.service.resolve_deep_link(Some(&token(&other))).await,
            "https://app.test/join-trip?error=invitation_processed&status=DECLINED"
        );
    }

    #[tokio::test]
    async fn details_and_listing() {
        let f = fixture().await;
        let inv = invite_bo(&f).await;
        let Ok(details) = f.service.details(&token(&inv)).await else {
            panic!("details should succeed");
        };
        assert_eq!(details.trip.id, f.trip.id);
        assert_eq!(details.inviter.map(|u| u.id), Some(f.owner.id));
        assert_eq!(details.member_count, 1);
        assert!(details.invitation.token.is_none());

        let Ok(listed) = f.service.list_for_trip(f.trip.id, &f.owner).await else {
            panic!("owner can list");
        };
        assert_eq!(listed.len(), 1);
        assert!(matches!(
            f.service.list_for_trip(f.trip.id, &f.bo).await,
            Err(AppError::NotMember)
        ));
    }

    #[tokio::test]
    async fn sweep_expires_overdue() {
        let f = fixture().await;
        let _ = invite_bo(&f).await;
        let later = Utc::now() + chrono::Duration::days(8);
        assert_eq!(f.service.sweep(later).await, Ok(1));
        assert_eq!(f.service.sweep(later).await, Ok(0));
    }
}
