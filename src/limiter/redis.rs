//! Redis sorted-set counter store shared across nodes.
//!
//! Each key is a sorted set of hit members scored by their timestamp in
//! milliseconds. One atomic pipeline trims the window, counts, records the
//! hit and refreshes the TTL; a rejected hit is removed again afterwards.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{CounterStore, LimiterError, Quota, RateDecision};

/// Counter store backed by Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connects to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterError::Store`] if the URL is invalid or the
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, LimiterError> {
        let client = redis::Client::open(url)
            .map_err(|e| LimiterError::Store(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| LimiterError::Store(e.to_string()))?;
        tracing::info!("redis rate limit store connected");
        Ok(Self { conn })
    }

    fn redis_key(key: &str) -> String {
        format!("tripwire:rl:{key}")
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn hit(&self, key: &str, quota: Quota, now_ms: u64) -> Result<RateDecision, LimiterError> {
        let mut conn = self.conn.clone();
        let redis_key = Self::redis_key(key);
        let window_ms = quota.window_ms();
        let window_start = now_ms.saturating_sub(window_ms);
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());

        let (count, oldest): (u64, Vec<(String, u64)>) = redis::pipe()
            .atomic()
            .zrembyscore(&redis_key, 0, window_start)
            .ignore()
            .zcard(&redis_key)
            .zrange_withscores(&redis_key, 0, 0)
            .zadd(&redis_key, &member, now_ms)
            .ignore()
            .pexpire(&redis_key, i64::try_from(window_ms).unwrap_or(i64::MAX))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| LimiterError::Store(e.to_string()))?;

        if count >= u64::from(quota.limit) {
            let _removed: u64 = conn
                .zrem(&redis_key, &member)
                .await
                .map_err(|e| LimiterError::Store(e.to_string()))?;
            let retry_after = oldest
                .first()
                .map_or(window_ms, |(_, score)| (score + window_ms).saturating_sub(now_ms));
            return Ok(RateDecision::deny(Duration::from_millis(retry_after)));
        }

        let used = u32::try_from(count).unwrap_or(u32::MAX);
        Ok(RateDecision::allow(quota.limit.saturating_sub(used + 1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        assert_eq!(
            RedisCounterStore::redis_key("ws:connect:abc"),
            "tripwire:rl:ws:connect:abc"
        );
    }
}
