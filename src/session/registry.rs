//! Which connections are attached to which trip.
//!
//! The registry is the direct path to every device of every member of a
//! trip. It carries what must reach members regardless of their bus
//! filters: membership changes, typing indicators and forced disconnects.
//! It is process-local and starts empty.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::RwLock;

use crate::bus::EventBus;
use crate::domain::{ConnectionId, Event, MemberRole, Membership, TripId, UserId};
use crate::error::AppError;
use crate::retry::with_deadline;
use crate::store::Store;
use crate::ws::connection::Connection;

type Devices = HashMap<UserId, Vec<Arc<Connection>>>;

/// Trip → user → connections.
#[derive(Debug)]
pub struct SessionRegistry {
    store: Arc<dyn Store>,
    lookup_timeout: Duration,
    sessions: RwLock<HashMap<TripId, Devices>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, lookup_timeout: Duration) -> Self {
        Self {
            store,
            lookup_timeout,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `conn` under `trip` after checking that its user holds an
    /// active membership. Registering the same connection twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotMember`] without an effective membership, or
    /// [`AppError::Unavailable`] if the lookup misses its deadline.
    pub async fn attach(&self, trip: TripId, conn: &Arc<Connection>) -> Result<MemberRole, AppError> {
        let user = conn.user_id();
        let membership = with_deadline(
            self.lookup_timeout,
            "membership lookup",
            self.store.get_membership(trip, user),
        )
        .await?;
        let Some(membership) = membership.filter(Membership::is_effective) else {
            return Err(AppError::NotMember);
        };

        let mut sessions = self.sessions.write().await;
        let devices = sessions.entry(trip).or_default().entry(user).or_default();
        if !devices.iter().any(|c| c.id() == conn.id()) {
            devices.push(Arc::clone(conn));
        }
        Ok(membership.role)
    }

    /// Removes one connection. Idempotent; returns `false` if it was not
    /// registered.
    pub async fn detach(&self, trip: TripId, user: UserId, conn: ConnectionId) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(devices) = sessions.get_mut(&trip) else {
            return false;
        };
        let Some(conns) = devices.get_mut(&user) else {
            return false;
        };
        let before = conns.len();
        conns.retain(|c| c.id() != conn);
        let removed = conns.len() != before;
        if conns.is_empty() {
            devices.remove(&user);
        }
        if devices.is_empty() {
            sessions.remove(&trip);
        }
        removed
    }

    /// Removes every connection of `user` from `trip` and returns them so
    /// the caller can release or close them.
    pub async fn evict(&self, trip: TripId, user: UserId) -> Vec<Arc<Connection>> {
        let mut sessions = self.sessions.write().await;
        let Some(devices) = sessions.get_mut(&trip) else {
            return Vec::new();
        };
        let evicted = devices.remove(&user).unwrap_or_default();
        if devices.is_empty() {
            sessions.remove(&trip);
        }
        evicted
    }

    /// Delivers `event` to every connection attached to its trip.
    /// Returns how many accepted it.
    pub async fn fanout(&self, event: &Event) -> usize {
        let targets = self.targets(event.trip_id, None).await;
        Self::deliver(&targets, event).await
    }

    /// Delivers `event` to every connection of its trip except those of
    /// `sender`.
    pub async fn broadcast_except(&self, sender: UserId, event: &Event) -> usize {
        let targets = self.targets(event.trip_id, Some(sender)).await;
        Self::deliver(&targets, event).await
    }

    /// Publishes `event` on the bus and fans it out through the registry.
    /// A bus failure is logged; local members are still reached.
    pub async fn announce(&self, bus: &EventBus, event: Event) -> usize {
        if let Err(e) = bus.publish(event.clone()).await {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                trip_id = %event.trip_id,
                error = %e,
                "event publish failed"
            );
        }
        self.fanout(&event).await
    }

    /// Number of connections attached to `trip`.
    pub async fn connection_count(&self, trip: TripId) -> usize {
        self.sessions
            .read()
            .await
            .get(&trip)
            .map_or(0, |devices| devices.values().map(Vec::len).sum())
    }

    /// Returns `true` if `user` has at least one connection on `trip`.
    pub async fn is_attached(&self, trip: TripId, user: UserId) -> bool {
        self.sessions
            .read()
            .await
            .get(&trip)
            .is_some_and(|devices| devices.contains_key(&user))
    }

    async fn targets(&self, trip: TripId, except: Option<UserId>) -> Vec<Arc<Connection>> {
        let sessions = self.sessions.read().await;
        let Some(devices) = sessions.get(&trip) else {
            return Vec::new();
        };
        devices
            .iter()
            .filter(|(user, _)| Some(**user) != except)
            .flat_map(|(_, conns)| conns.iter().map(Arc::clone))
            .collect()
    }

    async fn deliver(targets: &[Arc<Connection>], event: &Event) -> usize {
        join_all(targets.iter().map(|c| c.deliver(event)))
            .await
            .into_iter()
            .filter(|delivered| *delivered)
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{EventType, MembershipStatus};
    use crate::store::MemoryStore;
    use crate::ws::connection::ConnectionScope;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: SessionRegistry,
        trip: TripId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = SessionRegistry::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Duration::from_secs(1),
        );
        Fixture {
            store,
            registry,
            trip: TripId::new(),
        }
    }

    async fn member(f: &Fixture, role: MemberRole) -> UserId {
        let user = UserId::new();
        f.store
            .put_membership(Membership::active(f.trip, user, role))
            .await;
        user
    }

    fn connect(user: UserId, trip: TripId) -> (Arc<Connection>, mpsc::Receiver<String>) {
        Connection::new(user, ConnectionScope::Trip(trip), 8, Duration::from_millis(50))
    }

    fn typing(trip: TripId, user: UserId) -> Event {
        Event::new(EventType::ChatTyping, trip, user, "chat", serde_json::json!({"isTyping": true}))
    }

    #[tokio::test]
    async fn attach_requires_effective_membership() {
        let f = fixture().await;
        let stranger = UserId::new();
        let (conn, _rx) = connect(stranger, f.trip);
        assert_eq!(f.registry.attach(f.trip, &conn).await, Err(AppError::NotMember));

        let mut inactive = Membership::active(f.trip, stranger, MemberRole::Member);
        inactive.status = MembershipStatus::Inactive;
        f.store.put_membership(inactive).await;
        assert_eq!(f.registry.attach(f.trip, &conn).await, Err(AppError::NotMember));

        let none = UserId::new();
        f.store
            .put_membership(Membership::active(f.trip, none, MemberRole::None))
            .await;
        let (conn, _rx) = connect(none, f.trip);
        assert_eq!(f.registry.attach(f.trip, &conn).await, Err(AppError::NotMember));
    }

    #[tokio::test]
    async fn attach_is_exactly_once_and_detach_idempotent() {
        let f = fixture().await;
        let user = member(&f, MemberRole::Admin).await;
        let (conn, _rx) = connect(user, f.trip);
        assert_eq!(f.registry.attach(f.trip, &conn).await, Ok(MemberRole::Admin));
        assert_eq!(f.registry.attach(f.trip, &conn).await, Ok(MemberRole::Admin));
        assert_eq!(f.registry.connection_count(f.trip).await, 1);

        assert!(f.registry.detach(f.trip, user, conn.id()).await);
        assert!(!f.registry.detach(f.trip, user, conn.id()).await);
        assert_eq!(f.registry.connection_count(f.trip).await, 0);
        assert!(!f.registry.is_attached(f.trip, user).await);
    }

    #[tokio::test]
    async fn fanout_reaches_every_device_and_except_skips_sender() {
        let f = fixture().await;
        let alice = member(&f, MemberRole::Owner).await;
        let bob = member(&f, MemberRole::Member).await;
        let (phone, mut phone_rx) = connect(alice, f.trip);
        let (laptop, mut laptop_rx) = connect(alice, f.trip);
        let (bob_conn, mut bob_rx) = connect(bob, f.trip);
        for c in [&phone, &laptop, &bob_conn] {
            assert!(f.registry.attach(f.trip, c).await.is_ok());
        }

        assert_eq!(f.registry.fanout(&typing(f.trip, bob)).await, 3);
        assert!(phone_rx.try_recv().is_ok());
        assert!(laptop_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_ok());

        assert_eq!(f.registry.broadcast_except(alice, &typing(f.trip, alice)).await, 1);
        assert!(phone_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn evict_returns_all_devices() {
        let f = fixture().await;
        let user = member(&f, MemberRole::Member).await;
        let (a, _ra) = connect(user, f.trip);
        let (b, _rb) = connect(user, f.trip);
        assert!(f.registry.attach(f.trip, &a).await.is_ok());
        assert!(f.registry.attach(f.trip, &b).await.is_ok());
        assert_eq!(f.registry.evict(f.trip, user).await.len(), 2);
        assert_eq!(f.registry.connection_count(f.trip).await, 0);
    }

    #[tokio::test]
    async fn lookup_failure_is_not_a_membership_verdict() {
        let f = fixture().await;
        let user = member(&f, MemberRole::Member).await;
        f.store.set_failing(true);
        let (conn, _rx) = connect(user, f.trip);
        assert!(matches!(
            f.registry.attach(f.trip, &conn).await,
            Err(AppError::Persistence(_))
        ));
    }
}
