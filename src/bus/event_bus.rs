//! Per-trip publish/subscribe fabric.
//!
//! [`EventBus`] keeps one topic per trip. Publication on a topic is
//! serialized by a per-topic lock, so every subscriber observes a
//! subsequence of the topic's publication order. Each subscriber has its own
//! bounded queue with an [`OverflowPolicy`]; a slow subscriber can delay a
//! publisher by at most its `BlockPublisher` deadline, after which it is
//! evicted and its stream ends with [`ClosedBy::SlowConsumer`].
//!
//! With a [`Broker`] configured, every publish is also forwarded to the
//! broker, and [`EventBus::spawn_fan_in`] feeds events from other nodes into
//! local topics. A bounded recently-seen cache of event ids suppresses
//! duplicates, including echoes of this node's own events.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::broker::Broker;
use super::subscription::{
    ClosedBy, OverflowPolicy, PushOutcome, SubscribeOptions, SubscriberQueue, Subscription,
    SubscriptionHandle,
};
use crate::domain::{Event, EventId, TripId, UserId};
use crate::error::AppError;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Bus failures visible to publishers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The bus no longer accepts events.
    #[error("event bus is shut down")]
    ShutDown,
    /// The broker rejected the event after all retries.
    #[error("broker rejected event: {0}")]
    Broker(String),
}

impl From<BusError> for AppError {
    fn from(err: BusError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How often the reaper looks for idle topics.
    pub reaper_interval: Duration,
    /// How long a topic may stay empty before it is reclaimed.
    pub topic_grace: Duration,
    /// Size of the recently-seen event id cache.
    pub dedup_capacity: usize,
    /// Retry policy for broker publishes.
    pub broker_retry: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(15),
            topic_grace: Duration::from_secs(60),
            dedup_capacity: 4096,
            broker_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct Topic {
    publish_lock: tokio::sync::Mutex<()>,
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    empty_since: Mutex<Option<Instant>>,
}

impl Topic {
    fn new() -> Self {
        Self {
            publish_lock: tokio::sync::Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            empty_since: Mutex::new(None),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Arc<SubscriberQueue>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn empty_since(&self) -> MutexGuard<'_, Option<Instant>> {
        self.empty_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, queue: Arc<SubscriberQueue>) {
        self.subscribers().push(queue);
        *self.empty_since() = None;
    }

    fn remove(&self, id: u64) -> Option<Arc<SubscriberQueue>> {
        let mut subs = self.subscribers();
        let idx = subs.iter().position(|q| q.handle().id == id)?;
        let removed = subs.swap_remove(idx);
        if subs.is_empty() {
            *self.empty_since() = Some(Instant::now());
        }
        Some(removed)
    }

    fn snapshot(&self) -> Vec<Arc<SubscriberQueue>> {
        self.subscribers().clone()
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        if !self.subscribers().is_empty() {
            return None;
        }
        self.empty_since().map(|since| now.duration_since(since))
    }
}

/// Bounded set of recently seen event ids, evicting oldest first.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<EventId>,
    set: HashSet<EventId>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            set: HashSet::new(),
        }
    }

    /// Returns `true` if the id was not seen before.
    fn insert(&mut self, id: EventId) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }
}

#[derive(Debug)]
struct Inner {
    topics: RwLock<HashMap<TripId, Arc<Topic>>>,
    shut_down: AtomicBool,
    broker: Option<Arc<dyn Broker>>,
    seen: Mutex<RecentIds>,
    config: BusConfig,
}

/// Process-wide event bus keyed by trip.
///
/// Cheap to clone; all clones share the same topics.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// Creates a single-node bus.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self::build(config, None)
    }

    /// Creates a bus that mirrors events through `broker`.
    #[must_use]
    pub fn with_broker(config: BusConfig, broker: Arc<dyn Broker>) -> Self {
        Self::build(config, Some(broker))
    }

    fn build(config: BusConfig, broker: Option<Arc<dyn Broker>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: RwLock::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
                broker,
                seen: Mutex::new(RecentIds::new(config.dedup_capacity)),
                config,
            }),
        }
    }

    fn remember(&self, id: EventId) -> bool {
        self.inner
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    /// Returns `true` once [`EventBus::shutdown`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Subscribes `user_id` to the topic of `trip_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ShutDown`] after shutdown.
    pub async fn subscribe(
        &self,
        trip_id: TripId,
        user_id: UserId,
        options: SubscribeOptions,
    ) -> Result<Subscription, BusError> {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        let handle = SubscriptionHandle::next(trip_id);
        let queue = Arc::new(SubscriberQueue::new(handle, user_id, options));
        let mut topics = self.inner.topics.write().await;
        let topic = topics
            .entry(trip_id)
            .or_insert_with(|| Arc::new(Topic::new()));
        topic.add(Arc::clone(&queue));
        tracing::debug!(%trip_id, %user_id, subscription = handle.id, "subscribed");
        Ok(Subscription::new(queue))
    }

    /// Removes a subscription. Idempotent; returns `false` if it was
    /// already gone.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let topic = self.inner.topics.read().await.get(&handle.trip_id).cloned();
        let Some(removed) = topic.and_then(|t| t.remove(handle.id)) else {
            return false;
        };
        removed.close(ClosedBy::Unsubscribed);
        tracing::debug!(trip_id = %handle.trip_id, subscription = handle.id, "unsubscribed");
        true
    }

    /// Publishes an event to the topic of `event.trip_id`.
    ///
    /// Returns how many local subscribers received it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ShutDown`] after shutdown, or
    /// [`BusError::Broker`] if the broker rejects the event after retries.
    /// Local delivery has already happened in the latter case.
    pub async fn publish(&self, event: Event) -> Result<usize, BusError> {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        self.remember(event.id);
        let delivered = self.deliver_local(&event).await;

        if let Some(broker) = &self.inner.broker {
            retry_with_backoff(self.inner.config.broker_retry, || broker.publish(&event))
                .await
                .map_err(|e| BusError::Broker(e.to_string()))?;
        }
        Ok(delivered)
    }

    async fn deliver_local(&self, event: &Event) -> usize {
        let topic = self.inner.topics.read().await.get(&event.trip_id).cloned();
        let Some(topic) = topic else {
            return 0;
        };

        let _serialized = topic.publish_lock.lock().await;
        let mut delivered = 0;
        for queue in topic.snapshot() {
            match queue.try_push(event) {
                PushOutcome::Queued | PushOutcome::ReplacedOldest => delivered += 1,
                PushOutcome::Skipped | PushOutcome::Closed => {}
                PushOutcome::Full => match queue.policy() {
                    OverflowPolicy::BlockPublisher { deadline } => {
                        match tokio::time::timeout(deadline, queue.push_waiting(event)).await {
                            Ok(PushOutcome::Queued | PushOutcome::ReplacedOldest) => {
                                delivered += 1;
                            }
                            Ok(_) => {}
                            Err(_) => Self::evict(&topic, &queue, event),
                        }
                    }
                    OverflowPolicy::DisconnectSubscriber | OverflowPolicy::DropOldest => {
                        Self::evict(&topic, &queue, event);
                    }
                },
            }
        }
        delivered
    }

    fn evict(topic: &Topic, queue: &SubscriberQueue, event: &Event) {
        let handle = queue.handle();
        topic.remove(handle.id);
        if queue.close(ClosedBy::SlowConsumer) {
            tracing::warn!(
                trip_id = %handle.trip_id,
                user_id = %queue.user_id(),
                subscription = handle.id,
                event_type = %event.event_type,
                "evicting slow consumer"
            );
        }
    }

    /// Trips that currently have at least one subscriber.
    pub async fn active_topics(&self) -> Vec<TripId> {
        self.inner
            .topics
            .read()
            .await
            .iter()
            .filter(|(_, t)| !t.subscribers().is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of topics, including idle ones awaiting reclamation.
    pub async fn topic_count(&self) -> usize {
        self.inner.topics.read().await.len()
    }

    /// Number of live subscriptions on a topic.
    pub async fn subscriber_count(&self, trip_id: TripId) -> usize {
        self.inner
            .topics
            .read()
            .await
            .get(&trip_id)
            .map_or(0, |t| t.subscribers().len())
    }

    /// Events queued across all subscribers and not yet received.
    pub async fn backlog(&self) -> usize {
        self.inner
            .topics
            .read()
            .await
            .values()
            .map(|t| t.subscribers().iter().map(|q| q.len()).sum::<usize>())
            .sum()
    }

    /// Drops topics that have been empty for longer than the grace period.
    /// Returns how many were reclaimed.
    pub async fn reap_idle(&self, now: Instant) -> usize {
        let grace = self.inner.config.topic_grace;
        let mut topics = self.inner.topics.write().await;
        let before = topics.len();
        topics.retain(|_, topic| topic.idle_for(now).is_none_or(|idle| idle < grace));
        let reaped = before - topics.len();
        if reaped > 0 {
            tracing::debug!(reaped, remaining = topics.len(), "reclaimed idle topics");
        }
        reaped
    }

    /// Spawns the idle-topic reaper. Stops when `shutdown` flips to `true`.
    #[must_use]
    pub fn spawn_reaper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let bus = self.clone();
        let period = self.inner.config.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        bus.reap_idle(Instant::now()).await;
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

    /// Spawns the broker fan-in task, if a broker is configured.
    ///
    /// The task resubscribes after a broker disconnect and stops when
    /// `shutdown` flips to `true`.
    #[must_use]
    pub fn spawn_fan_in(&self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let broker = self.inner.broker.clone()?;
        let bus = self.clone();
        Some(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                let mut events = match broker.subscribe().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "broker subscribe failed; retrying");
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_secs(1)) => continue,
                            changed = shutdown.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                continue;
                            }
                        }
                    }
                };
                tracing::info!("broker fan-in attached");
                loop {
                    tokio::select! {
                        next = events.next() => match next {
                            Some(event) => {
                                if bus.remember(event.id) {
                                    bus.deliver_local(&event).await;
                                }
                            }
                            None => {
                                tracing::warn!("broker stream ended; resubscribing");
                                break;
                            }
                        },
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }))
    }

    /// Stops accepting publishes and closes every subscription.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let topics = self.inner.topics.read().await;
        for topic in topics.values() {
            for queue in topic.snapshot() {
                queue.close(ClosedBy::ShutDown);
            }
        }
        tracing::info!(topics = topics.len(), "event bus shut down");
    }
}
