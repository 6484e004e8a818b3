//! Membership changes that must reach live sessions: role changes, member
//! removal and trip status transitions.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::bus::EventBus;
use crate::domain::{
    Event, EventType, MemberRole, Membership, MembershipStatus, Trip, TripId, TripStatus, User,
    UserId,
};
use crate::error::AppError;
use crate::retry::{retry_transient, with_deadline};
use crate::session::SessionRegistry;
use crate::store::{Store, require_member};
use crate::ws::connection::release_trip;

const EVENT_SOURCE: &str = "members";

/// Orchestrates membership and trip-status changes.
///
/// Every mutation follows the same pattern: authorize the actor, apply the
/// change in the store (which enforces the last-owner rule), then announce
/// it through the bus and the session registry.
#[derive(Debug)]
pub struct MembershipService {
    store: Arc<dyn Store>,
    bus: EventBus,
    registry: Arc<SessionRegistry>,
    lookup_timeout: Duration,
}

impl MembershipService {
    /// Creates a new `MembershipService`.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        bus: EventBus,
        registry: Arc<SessionRegistry>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            lookup_timeout,
        }
    }

    /// Changes `target`'s role in `trip`.
    ///
    /// ADMIN and OWNER may change roles; granting or taking away OWNER
    /// requires the actor to be an OWNER.
    ///
    /// # Errors
    ///
    /// - [`AppError::Validation`] for the `NONE` role.
    /// - [`AppError::NotMember`] / [`AppError::Forbidden`] for an
    ///   unauthorized actor.
    /// - [`AppError::NotFound`] if `target` is not an active member.
    /// - [`AppError::LastOwner`] if the trip would lose its last owner.
    pub async fn change_role(
        &self,
        trip: TripId,
        actor: &User,
        target: UserId,
        role: MemberRole,
    ) -> Result<Membership, AppError> {
        if role == MemberRole::None {
            return Err(AppError::Validation(
                "role must be OWNER, ADMIN or MEMBER; remove the member instead".to_string(),
            ));
        }
        let actor_role = self.admin_role(trip, actor.id).await?;
        let current = self.active_member(trip, target).await?;
        if (role == MemberRole::Owner || current.role == MemberRole::Owner)
            && actor_role != MemberRole::Owner
        {
            return Err(AppError::Forbidden(
                "only owners can grant or revoke ownership".to_string(),
            ));
        }
        if current.role == role {
            return Ok(current);
        }

        let updated = self
            .store
            .update_membership(trip, target, role, MembershipStatus::Active)
            .await?;
        tracing::info!(%trip, user_id = %target, from = %current.role, to = %role, actor_id = %actor.id, "member role changed");

        let event = Event::new(
            EventType::TripMemberRoleChanged,
            trip,
            target,
            EVENT_SOURCE,
            json!({
                "userId": target,
                "oldRole": current.role,
                "newRole": role,
                "changedBy": actor.id,
            }),
        );
        self.registry.announce(&self.bus, event).await;
        Ok(updated)
    }

    /// Removes `target` from `trip`, or lets a member leave when `actor`
    /// is `target`. The removed user's live connections lose the trip.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotFound`] if `target` is not an active member.
    /// - [`AppError::Forbidden`] unless the actor is leaving, or is ADMIN
    ///   (OWNER for removing an owner).
    /// - [`AppError::LastOwner`] if the trip would lose its last owner.
    pub async fn remove_member(
        &self,
        trip: TripId,
        actor: &User,
        target: UserId,
    ) -> Result<Membership, AppError> {
        let current = self.active_member(trip, target).await?;
        let leaving = actor.id == target;
        if !leaving {
            let actor_role = self.admin_role(trip, actor.id).await?;
            if current.role == MemberRole::Owner && actor_role != MemberRole::Owner {
                return Err(AppError::Forbidden("only owners can remove an owner".to_string()));
            }
        }

        let removed = self
            .store
            .update_membership(trip, target, current.role, MembershipStatus::Inactive)
            .await?;
        tracing::info!(%trip, user_id = %target, actor_id = %actor.id, leaving, "member removed");

        let event = Event::new(
            EventType::TripMemberRemoved,
            trip,
            target,
            EVENT_SOURCE,
            json!({
                "userId": target,
                "removedBy": actor.id,
                "left": leaving,
            }),
        );
        self.registry.announce(&self.bus, event).await;

        for conn in self.registry.evict(trip, target).await {
            release_trip(&self.registry, &self.bus, &conn, trip).await;
        }
        Ok(removed)
    }

    /// Moves `trip` to `next` along the status DAG.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotMember`] / [`AppError::Forbidden`] unless the actor
    ///   is ADMIN or OWNER.
    /// - [`AppError::NotFound`] if the trip does not exist.
    /// - [`AppError::InvalidTransition`] for an edge outside the DAG or a
    ///   concurrent change.
    pub async fn update_trip_status(
        &self,
        trip_id: TripId,
        actor: &User,
        next: TripStatus,
    ) -> Result<Trip, AppError> {
        self.admin_role(trip_id, actor.id).await?;
        let trip = with_deadline(
            self.lookup_timeout,
            "trip lookup",
            retry_transient(|| self.store.get_trip(trip_id)),
        )
        .await?
        .ok_or_else(|| AppError::NotFound("trip".to_string()))?;
        let previous = trip.status;
        previous.transition(next)?;
        let updated = self
            .store
            .compare_and_set_trip_status(trip_id, previous, next)
            .await?;
        tracing::info!(trip_id = %trip_id, from = %previous, to = %next, actor_id = %actor.id, "trip status changed");

        let event = Event::new(
            EventType::TripUpdated,
            trip_id,
            actor.id,
            EVENT_SOURCE,
            json!({
                "status": next,
                "previousStatus": previous,
                "updatedBy": actor.id,
            }),
        );
        if let Err(e) = self.bus.publish(event).await {
            tracing::warn!(%trip_id, error = %e, "trip.updated publish failed");
        }
        Ok(updated)
    }

    async fn admin_role(&self, trip: TripId, user: UserId) -> Result<MemberRole, AppError> {
        let membership = require_member(self.store.as_ref(), trip, user, self.lookup_timeout).await?;
        if !membership.role.is_admin() {
            return Err(AppError::Forbidden(
                "only trip owners and admins can manage members".to_string(),
            ));
        }
        Ok(membership.role)
    }

    async fn active_member(&self, trip: TripId, user: UserId) -> Result<Membership, AppError> {
        with_deadline(
            self.lookup_timeout,
            "membership lookup",
            retry_transient(|| self.store.get_membership(trip, user)),
        )
        .await?
        .filter(Membership::is_effective)
        .ok_or_else(|| AppError::NotFound("member".to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, SubscribeOptions};
    use crate::store::{MembershipStore, MemoryStore};
    use crate::ws::connection::{CloseReason, Connection, ConnectionScope};

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: EventBus,
        registry: Arc<SessionRegistry>,
        service: MembershipService,
        trip: Trip,
        owner: User,
        admin: User,
        member: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dyn_store = Arc::clone(&store) as Arc<dyn Store>;
        let bus = EventBus::new(BusConfig::default());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&dyn_store), Duration::from_secs(1)));
        let service = MembershipService::new(dyn_store, bus.clone(), Arc::clone(&registry), Duration::from_secs(1));

        let owner = User::new("owner@example.com", "owner");
        let admin = User::new("admin@example.com", "admin");
        let member = User::new("member@example.com", "member");
        let trip = Trip::new("Kyoto", owner.id);
        store.put_trip(trip.clone()).await;
        for (user, role) in [
            (&owner, MemberRole::Owner),
            (&admin, MemberRole::Admin),
            (&member, MemberRole::Member),
        ] {
            store.put_user(user.clone()).await;
            store.put_membership(Membership::active(trip.id, user.id, role)).await;
        }
        Fixture {
            store,
            bus,
            registry,
            service,
            trip,
            owner,
            admin,
            member,
        }
    }

    #[tokio::test]
    async fn admin_promotes_member_and_event_is_published() {
        let f = fixture().await;
        let Ok(sub) = f
            .bus
            .subscribe(f.trip.id, f.owner.id, SubscribeOptions::default())
            .await
        else {
            panic!("subscribe failed");
        };
        let Ok(updated) = f
            .service
            .change_role(f.trip.id, &f.admin, f.member.id, MemberRole::Admin)
            .await
        else {
            panic!("role change should succeed");
        };
        assert_eq!(updated.role, MemberRole::Admin);
        let Some(event) = sub.recv().await else {
            panic!("no event");
        };
        assert_eq!(event.event_type, EventType::TripMemberRoleChanged);
        assert_eq!(event.payload["newRole"], "ADMIN");
    }

    #[tokio::test]
    async fn ownership_needs_an_owner() {
        let f = fixture().await;
        assert!(matches!(
            f.service
                .change_role(f.trip.id, &f.admin, f.member.id, MemberRole::Owner)
                .await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            f.service
                .change_role(f.trip.id, &f.member, f.admin.id, MemberRole::Member)
                .await,
            Err(AppError::Forbidden(_))
        ));
        assert_eq!(
            f.service
                .change_role(f.trip.id, &f.owner, f.owner.id, MemberRole::Admin)
                .await
                .map(|m| m.role),
            Err(AppError::LastOwner)
        );
    }

    #[tokio::test]
    async fn last_owner_cannot_leave() {
        let f = fixture().await;
        assert_eq!(
            f.service
                .remove_member(f.trip.id, &f.owner, f.owner.id)
                .await
                .map(|m| m.status),
            Err(AppError::LastOwner)
        );
        let Ok(left) = f.service.remove_member(f.trip.id, &f.member, f.member.id).await else {
            panic!("member can leave");
        };
        assert_eq!(left.status, MembershipStatus::Inactive);
    }

    #[tokio::test]
    async fn removal_closes_trip_bound_sockets() {
        let f = fixture().await;
        let (conn, _rx) = Connection::new(
            f.member.id,
            ConnectionScope::Trip(f.trip.id),
            8,
            Duration::from_millis(50),
        );
        let Ok(_) = f.registry.attach(f.trip.id, &conn).await else {
            panic!("attach failed");
        };

        let Ok(_) = f.service.remove_member(f.trip.id, &f.admin, f.member.id).await else {
            panic!("removal should succeed");
        };
        assert_eq!(conn.close_reason(), Some(CloseReason::NotMember));
        assert!(!f.registry.is_attached(f.trip.id, f.member.id).await);
        let Ok(Some(m)) = f.store.get_membership(f.trip.id, f.member.id).await else {
            panic!("membership row should remain");
        };
        assert!(!m.is_effective());
    }

    #[tokio::test]
    async fn trip_status_follows_the_dag() {
        let f = fixture().await;
        let Ok(active) = f
            .service
            .update_trip_status(f.trip.id, &f.owner, TripStatus::Active)
            .await
        else {
            panic!("PLANNING -> ACTIVE is allowed");
        };
        assert_eq!(active.status, TripStatus::Active);
        assert!(matches!(
            f.service
                .update_trip_status(f.trip.id, &f.owner, TripStatus::Planning)
                .await,
            Err(AppError::InvalidTransition { .. })
        ));
        assert!(matches!(
            f.service
                .update_trip_status(f.trip.id, &f.member, TripStatus::Completed)
                .await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn status_change_rides_out_transient_store_failures() {
        let f = fixture().await;
        f.store.fail_next(2);
        let Ok(active) = f
            .service
            .update_trip_status(f.trip.id, &f.owner, TripStatus::Active)
            .await
        else {
            panic!("two transient failures should be absorbed");
        };
        assert_eq!(active.status, TripStatus::Active);
    }
}
