//! Sliding-window admission control for WebSocket actions.
//!
//! Every admission-controlled action is checked against a per-user quota
//! under the key `ws:<action>:<user_id>`. Counting is delegated to a
//! [`CounterStore`]: an in-process sliding log ([`MemoryCounterStore`]) or a
//! Redis sorted set shared by all nodes ([`RedisCounterStore`]).
//!
//! The limiter fails open. A store error is retried with backoff; if it
//! keeps failing the request is admitted and a warning is logged, so a
//! counter outage never takes chat down with it.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::UserId;
use crate::retry::{RetryPolicy, retry_with_backoff};

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

/// Admission-controlled actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Opening a WebSocket.
    Connect,
    /// Sending a chat message.
    ChatMessage,
    /// Adding or removing a reaction.
    ChatReaction,
    /// Advancing a read cursor.
    ChatReadReceipt,
    /// Typing indicator.
    ChatTyping,
}

impl Action {
    /// Every action, for building quota tables.
    pub const ALL: [Self; 5] = [
        Self::Connect,
        Self::ChatMessage,
        Self::ChatReaction,
        Self::ChatReadReceipt,
        Self::ChatTyping,
    ];

    /// Key segment for this action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::ChatMessage => "chat_message",
            Self::ChatReaction => "chat_reaction",
            Self::ChatReadReceipt => "chat_read_receipt",
            Self::ChatTyping => "chat_typing",
        }
    }

    /// Built-in quota: connect 5, message 10, reaction 20, read receipt 30,
    /// typing 50, all per 60 seconds.
    #[must_use]
    pub const fn default_quota(self) -> Quota {
        let limit = match self {
            Self::Connect => 5,
            Self::ChatMessage => 10,
            Self::ChatReaction => 20,
            Self::ChatReadReceipt => 30,
            Self::ChatTyping => 50,
        };
        Quota::per_minute(limit)
    }

    /// Counter key for `user`.
    #[must_use]
    pub fn key(self, user: UserId) -> String {
        format!("ws:{}:{user}", self.as_str())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `limit` hits per sliding `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Maximum hits inside the window.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
}

impl Quota {
    /// `limit` hits per 60 seconds.
    #[must_use]
    pub const fn per_minute(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
        }
    }

    /// Window length in milliseconds.
    #[must_use]
    pub fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the hit was admitted (and counted).
    pub allowed: bool,
    /// How long until the next hit would be admitted; zero when allowed.
    pub retry_after: Duration,
    /// Hits left in the current window after this one.
    pub remaining: u32,
}

impl RateDecision {
    /// An admitted hit.
    #[must_use]
    pub const fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            remaining,
        }
    }

    /// A rejected hit.
    #[must_use]
    pub const fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
            remaining: 0,
        }
    }

    /// `retry_after` rounded up to whole seconds, at least 1 when denied.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 || secs == 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Counter store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    /// The backing store could not be reached or refused the command.
    #[error("rate limit store unavailable: {0}")]
    Store(String),
}

/// Sliding-window hit counter.
#[async_trait]
pub trait CounterStore: Send + Sync + fmt::Debug {
    /// Records a hit at `now_ms` if `key` is under `quota`, and reports the
    /// decision. Rejected hits are not counted.
    async fn hit(&self, key: &str, quota: Quota, now_ms: u64) -> Result<RateDecision, LimiterError>;

    /// Drops bookkeeping older than `max_window_ms`. Returns how many keys
    /// were released. Stores with native expiry need not override this.
    async fn purge(&self, _now_ms: u64, _max_window_ms: u64) -> usize {
        0
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Quota-aware front end over a [`CounterStore`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    quotas: HashMap<Action, Quota>,
    retry: RetryPolicy,
}

impl RateLimiter {
    /// Creates a limiter with the built-in quotas.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        let quotas = Action::ALL
            .into_iter()
            .map(|a| (a, a.default_quota()))
            .collect();
        Self {
            store,
            quotas,
            retry: RetryPolicy::default(),
        }
    }

    /// Limiter over an in-process store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCounterStore::new()))
    }

    /// Overrides the quota of one action.
    #[must_use]
    pub fn with_quota(mut self, action: Action, quota: Quota) -> Self {
        self.quotas.insert(action, quota);
        self
    }

    /// Quota in force for `action`.
    #[must_use]
    pub fn quota(&self, action: Action) -> Quota {
        self.quotas
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.default_quota())
    }

    /// Checks and records a hit for `key` now.
    pub async fn check(&self, key: &str, quota: Quota) -> RateDecision {
        self.check_at(key, quota, now_ms()).await
    }

    /// Checks and records a hit for `key` at `now_ms`.
    pub async fn check_at(&self, key: &str, quota: Quota, now_ms: u64) -> RateDecision {
        let result = retry_with_backoff(self.retry, || self.store.hit(key, quota, now_ms)).await;
        match result {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::debug!(key, retry_after_secs = decision.retry_after_secs(), "rate limited");
                }
                decision
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "rate limit store failing; admitting request");
                RateDecision::allow(quota.limit)
            }
        }
    }

    /// Checks `action` for `user` against its configured quota.
    pub async fn check_action(&self, action: Action, user: UserId) -> RateDecision {
        self.check(&action.key(user), self.quota(action)).await
    }

    /// Spawns a task that periodically purges stale counters.
    #[must_use]
    pub fn spawn_purge(&self, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let max_window_ms = self
            .quotas
            .values()
            .map(Quota::window_ms)
            .max()
            .unwrap_or(60_000);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = store.purge(now_ms(), max_window_ms).await;
                        if purged > 0 {
                            tracing::debug!(purged, "purged stale rate limit keys");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Default)]
    struct FailingStore {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn hit(&self, _: &str, _: Quota, _: u64) -> Result<RateDecision, LimiterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LimiterError::Store("connection refused".to_string()))
        }
    }

    #[test]
    fn keys_are_namespaced_by_action() {
        let user = UserId::new();
        assert_eq!(Action::ChatMessage.key(user), format!("ws:chat_message:{user}"));
        assert_eq!(Action::Connect.key(user), format!("ws:connect:{user}"));
    }

    #[test]
    fn default_quotas() {
        assert_eq!(Action::Connect.default_quota().limit, 5);
        assert_eq!(Action::ChatMessage.default_quota().limit, 10);
        assert_eq!(Action::ChatReaction.default_quota().limit, 20);
        assert_eq!(Action::ChatReadReceipt.default_quota().limit, 30);
        assert_eq!(Action::ChatTyping.default_quota().limit, 50);
        assert_eq!(Action::ChatTyping.default_quota().window, Duration::from_secs(60));
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(RateDecision::deny(Duration::from_millis(1500)).retry_after_secs(), 2);
        assert_eq!(RateDecision::deny(Duration::ZERO).retry_after_secs(), 1);
        assert_eq!(RateDecision::allow(3).retry_after_secs(), 0);
    }

    #[tokio::test]
    async fn store_failure_fails_open_after_retries() {
        let store = Arc::new(FailingStore::default());
        let limiter = RateLimiter::new(Arc::clone(&store) as Arc<dyn CounterStore>);
        let decision = limiter.check("ws:chat_message:x", Quota::per_minute(1)).await;
        assert!(decision.allowed);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn eleventh_message_in_a_minute_is_denied() {
        let limiter = RateLimiter::in_memory();
        let user = UserId::new();
        for _ in 0..10 {
            assert!(limiter.check_action(Action::ChatMessage, user).await.allowed);
        }
        let denied = limiter.check_action(Action::ChatMessage, user).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after > Duration::ZERO);
        assert!(limiter.check_action(Action::ChatReaction, user).await.allowed);
    }
}
