//! Tracks live connections and runs the graceful drain.
//!
//! Shutdown order: stop accepting, announce `server.shutting_down` on every
//! active topic, wait (bounded) for bus queues and outbound queues to
//! empty, close every connection with 1001, wait (bounded) for each one to
//! finish its exit procedure, then shut the bus down.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::connection::{CloseReason, Connection};
use crate::bus::EventBus;
use crate::domain::{ConnectionId, Event, EventType, UserId};
use crate::error::AppError;

const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Registry of live connections on this node.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    accepting: AtomicBool,
    drain: Duration,
}

impl ConnectionSupervisor {
    /// Creates a supervisor that waits at most `drain` for queues to empty
    /// on shutdown.
    #[must_use]
    pub fn new(drain: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            drain,
        }
    }

    /// Whether new connections are admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Tracks `conn`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Unavailable`] once shutdown has begun.
    pub async fn register(&self, conn: &Arc<Connection>) -> Result<(), AppError> {
        if !self.is_accepting() {
            return Err(AppError::Unavailable("server is shutting down".to_string()));
        }
        self.connections
            .write()
            .await
            .insert(conn.id(), Arc::clone(conn));
        Ok(())
    }

    /// Stops tracking `id`. Returns whether it was tracked.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        self.connections.write().await.remove(&id).is_some()
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Handles to every live connection.
    pub async fn live(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Drains and closes every connection, then shuts `bus` down.
    pub async fn shutdown(&self, bus: &EventBus) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        let topics = bus.active_topics().await;
        let connections = self.count().await;
        tracing::info!(
            connections,
            topics = topics.len(),
            "draining websocket connections"
        );
        for trip in topics {
            let notice = Event::new(
                EventType::ServerShuttingDown,
                trip,
                UserId::from_uuid(uuid::Uuid::nil()),
                "supervisor",
                json!({ "reason": "server_shutdown" }),
            );
            if let Err(e) = bus.publish(notice).await {
                tracing::warn!(%trip, error = %e, "failed to announce shutdown");
            }
        }

        let deadline = Instant::now() + self.drain;
        loop {
            let backlog = bus.backlog().await;
            let pending: usize = self
                .live()
                .await
                .iter()
                .map(|c| c.outbound_pending())
                .sum();
            if backlog == 0 && pending == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(backlog, pending, "drain deadline reached; closing anyway");
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let connections = self.live().await;
        for conn in &connections {
            conn.close(CloseReason::ServerShutdown);
        }
        let wait_all = join_all(connections.iter().map(|c| c.terminated()));
        if tokio::time::timeout(self.drain, wait_all).await.is_err() {
            let remaining = self.count().await;
            tracing::warn!(remaining, "connections still exiting at drain deadline");
        }
        bus.shutdown().await;
        tracing::info!("websocket drain complete");
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use crate::domain::TripId;
    use crate::ws::connection::{ConnectionScope, ConnectionState};

    fn conn() -> Arc<Connection> {
        let (conn, _rx) = Connection::new(
            UserId::new(),
            ConnectionScope::Trip(TripId::new()),
            4,
            Duration::from_millis(50),
        );
        conn
    }

    #[tokio::test]
    async fn register_and_remove() {
        let supervisor = ConnectionSupervisor::new(Duration::from_millis(100));
        let c = conn();
        assert!(supervisor.register(&c).await.is_ok());
        assert_eq!(supervisor.count().await, 1);
        assert!(supervisor.remove(c.id()).await);
        assert!(!supervisor.remove(c.id()).await);
        assert_eq!(supervisor.count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_refuses_new_connections() {
        let supervisor = Arc::new(ConnectionSupervisor::new(Duration::from_millis(200)));
        let bus = EventBus::new(BusConfig::default());
        let c = conn();
        let Ok(()) = supervisor.register(&c).await else {
            panic!("register failed");
        };

        // Stand-in for the connection's own exit procedure.
        let exiting = {
            let c = Arc::clone(&c);
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                c.closed().await;
                supervisor.remove(c.id()).await;
                c.mark_closed();
            })
        };

        supervisor.shutdown(&bus).await;
        assert_eq!(c.close_reason(), Some(CloseReason::ServerShutdown));
        assert_eq!(c.state(), ConnectionState::Closed);
        assert_eq!(supervisor.count().await, 0);
        assert!(exiting.await.is_ok());
        assert!(!supervisor.is_accepting());
        assert!(bus.is_shut_down());
        assert!(matches!(
            supervisor.register(&conn()).await,
            Err(AppError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_is_bounded_when_a_connection_never_exits() {
        let supervisor = Arc::new(ConnectionSupervisor::new(Duration::from_millis(100)));
        let bus = EventBus::new(BusConfig::default());
        let c = conn();
        let Ok(()) = supervisor.register(&c).await else {
            panic!("register failed");
        };

        // Spawning requires the drain future to be Send, as it is in main.
        let started = Instant::now();
        let drain = {
            let bus = bus.clone();
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.shutdown(&bus).await })
        };
        assert!(drain.await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(c.state(), ConnectionState::Closing);
        assert!(bus.is_shut_down());
    }
}
