//! Shared application state injected into all Axum handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::{IdentityVerifier, JwtVerifier};
use crate::bus::{BusConfig, EventBus, OverflowPolicy, RedisBroker, SubscribeOptions};
use crate::chat::ChatPipeline;
use crate::config::{AppConfig, PersistenceBackend, SocketOverflow};
use crate::error::AppError;
use crate::invitation::{InvitationService, InvitationSettings, InvitationTokens, TracingNotifier};
use crate::limiter::{RateLimiter, RedisCounterStore};
use crate::service::MembershipService;
use crate::session::SessionRegistry;
use crate::store::{MemoryStore, PostgresStore, Store};
use crate::ws::ConnectionSupervisor;

const BROKER_PREFIX: &str = "tripwire:trip";

/// Shared application state available to all handlers via Axum's
/// `State` extractor. Built once at startup; cloning is cheap.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Loaded configuration.
    pub config: Arc<AppConfig>,
    /// Persistence backend.
    pub store: Arc<dyn Store>,
    /// Per-trip event bus.
    pub bus: EventBus,
    /// Live sessions per trip.
    pub registry: Arc<SessionRegistry>,
    /// Admission control for WebSocket actions.
    pub limiter: RateLimiter,
    /// Bearer token verification.
    pub identity: Arc<dyn IdentityVerifier>,
    /// Chat persistence and delivery.
    pub chat: Arc<ChatPipeline>,
    /// Invitation lifecycle.
    pub invitations: Arc<InvitationService>,
    /// Role changes, removals and trip status.
    pub members: Arc<MembershipService>,
    /// Live connections on this node.
    pub supervisor: Arc<ConnectionSupervisor>,
}

impl AppState {
    /// Connects the configured backends and wires every component.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Persistence`] if the database cannot be opened,
    /// or [`AppError::Unavailable`] if a configured Redis is unreachable.
    pub async fn build(config: AppConfig) -> Result<Self, AppError> {
        let store: Arc<dyn Store> = match config.persistence_backend {
            PersistenceBackend::Memory => {
                tracing::warn!("using in-memory store; data is lost on restart");
                Arc::new(MemoryStore::new())
            }
            PersistenceBackend::Postgres => Arc::new(
                PostgresStore::connect(
                    &config.database_url,
                    config.database_max_connections,
                    config.database_min_connections,
                    Duration::from_secs(config.database_connect_timeout_secs),
                )
                .await?,
            ),
        };

        let bus = match config.event_broker_url.as_deref() {
            Some(url) => {
                let broker = RedisBroker::connect(url, BROKER_PREFIX)
                    .await
                    .map_err(|e| AppError::Unavailable(format!("event broker: {e}")))?;
                EventBus::with_broker(bus_config(&config), Arc::new(broker))
            }
            None => EventBus::new(bus_config(&config)),
        };

        let limiter = match config.rate_limit_store_url.as_deref() {
            Some(url) => {
                let counters = RedisCounterStore::connect(url)
                    .await
                    .map_err(|e| AppError::Unavailable(format!("rate limit store: {e}")))?;
                RateLimiter::new(Arc::new(counters))
            }
            None => RateLimiter::in_memory(),
        };

        Ok(Self::assemble(config, store, bus, limiter))
    }

    /// Single-node state over `store`: local bus, in-memory limiter.
    #[must_use]
    pub fn with_store(config: AppConfig, store: Arc<dyn Store>) -> Self {
        let bus = EventBus::new(bus_config(&config));
        Self::assemble(config, store, bus, RateLimiter::in_memory())
    }

    /// Replaces the rate limiter.
    #[must_use]
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    fn assemble(config: AppConfig, store: Arc<dyn Store>, bus: EventBus, limiter: RateLimiter) -> Self {
        let lookup = config.ws.lookup_timeout;
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&store), lookup));
        let identity: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(
            &config.identity_jwt_secret,
            config.identity_jwt_issuer.as_deref(),
            Arc::clone(&store),
            lookup,
        ));
        let chat = Arc::new(ChatPipeline::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&registry),
            lookup,
        ));
        let invitations = Arc::new(InvitationService::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&registry),
            InvitationTokens::new(&config.invitation_token_secret),
            Arc::new(TracingNotifier),
            InvitationSettings {
                ttl: config.invitation_ttl(),
                frontend_url: config.frontend_url.trim_end_matches('/').to_string(),
                notify_timeout: Duration::from_secs(config.notification_timeout_secs),
                lookup_timeout: lookup,
            },
        ));
        let members = Arc::new(MembershipService::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&registry),
            lookup,
        ));
        let supervisor = Arc::new(ConnectionSupervisor::new(Duration::from_secs(
            config.shutdown_drain_secs,
        )));
        Self {
            config: Arc::new(config),
            store,
            bus,
            registry,
            limiter,
            identity,
            chat,
            invitations,
            members,
            supervisor,
        }
    }

    /// Subscription parameters for WebSocket delivery.
    #[must_use]
    pub fn subscribe_options(&self) -> SubscribeOptions {
        let bus = &self.config.event_bus;
        let policy = match self.config.ws.overflow {
            SocketOverflow::Block => OverflowPolicy::BlockPublisher {
                deadline: bus.block_deadline,
            },
            SocketOverflow::DropOldest => OverflowPolicy::DropOldest,
            SocketOverflow::Disconnect => OverflowPolicy::DisconnectSubscriber,
        };
        SubscribeOptions::default()
            .with_capacity(bus.subscriber_capacity)
            .with_policy(policy)
    }

    /// Starts the background tasks: topic reaper, broker fan-in,
    /// invitation sweeper and limiter purge. All stop when `shutdown`
    /// flips to `true`.
    #[must_use]
    pub fn spawn_background(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.bus.spawn_reaper(shutdown.clone())];
        if let Some(fan_in) = self.bus.spawn_fan_in(shutdown.clone()) {
            tasks.push(fan_in);
        }
        tasks.push(self.invitations.spawn_sweeper(
            Duration::from_secs(self.config.invitation_sweep_interval_secs),
            shutdown.clone(),
        ));
        tasks.push(self.limiter.spawn_purge(
            Duration::from_secs(self.config.limiter_purge_interval_secs),
            shutdown.clone(),
        ));
        tasks.push(self.chat.spawn_pruner(
            self.config.event_bus.reaper_interval,
            self.config.event_bus.topic_grace,
            shutdown.clone(),
        ));
        tasks
    }
}

fn bus_config(config: &AppConfig) -> BusConfig {
    BusConfig {
        reaper_interval: config.event_bus.reaper_interval,
        topic_grace: config.event_bus.topic_grace,
        dedup_capacity: config.event_bus.dedup_capacity,
        ..BusConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(overflow: SocketOverflow) -> AppState {
        let mut config = AppConfig::default();
        config.ws.overflow = overflow;
        AppState::with_store(config, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn socket_subscriptions_follow_the_configured_overflow() {
        let block = state_with(SocketOverflow::Block).subscribe_options();
        assert_eq!(
            block.policy,
            OverflowPolicy::BlockPublisher {
                deadline: Duration::from_millis(50)
            }
        );
        assert_eq!(block.capacity, 256);
        assert_eq!(
            state_with(SocketOverflow::DropOldest).subscribe_options().policy,
            OverflowPolicy::DropOldest
        );
        assert_eq!(
            state_with(SocketOverflow::Disconnect).subscribe_options().policy,
            OverflowPolicy::DisconnectSubscriber
        );
    }
}
