//! In-process sliding-log counter store.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CounterStore, LimiterError, Quota, RateDecision};

/// Keeps one log of hit timestamps per key. Exact, single-node only.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    logs: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl MemoryCounterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked keys.
    pub async fn key_count(&self) -> usize {
        self.logs.lock().await.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit(&self, key: &str, quota: Quota, now_ms: u64) -> Result<RateDecision, LimiterError> {
        let window_ms = quota.window_ms();
        let window_start = now_ms.saturating_sub(window_ms);
        let mut logs = self.logs.lock().await;
        let log = logs.entry(key.to_string()).or_default();
        while log.front().is_some_and(|&t| t <= window_start) {
            log.pop_front();
        }

        let used = u32::try_from(log.len()).unwrap_or(u32::MAX);
        if used >= quota.limit {
            let retry_after = log
                .front()
                .map_or(window_ms, |&oldest| (oldest + window_ms).saturating_sub(now_ms));
            return Ok(RateDecision::deny(Duration::from_millis(retry_after)));
        }
        log.push_back(now_ms);
        Ok(RateDecision::allow(quota.limit - used - 1))
    }

    async fn purge(&self, now_ms: u64, max_window_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(max_window_ms);
        let mut logs = self.logs.lock().await;
        let before = logs.len();
        logs.retain(|_, log| log.back().is_some_and(|&t| t > cutoff));
        before - logs.len()
    }
}
