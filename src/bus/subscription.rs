//! Per-subscriber bounded queues.
//!
//! Each subscription owns a [`SubscriberQueue`] shared between the bus
//! (producer) and the [`Subscription`] handed to the subscriber (consumer).
//! The queue is a `VecDeque` behind a short-lived mutex plus two
//! [`Notify`]s, one per direction. Both sides have a single waiter at a time
//! (publication is serialized per topic, and a subscription has exactly one
//! consumer), so `notify_one` never loses a wakeup.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::domain::{Event, EventType, TripId, UserId};

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default `BlockPublisher` deadline.
pub const DEFAULT_BLOCK_DEADLINE: Duration = Duration::from_millis(50);

/// What to do when a subscriber's queue is full.
///
/// Lossy event types (`chat.typing`, `location.updated`) are always
/// handled as [`OverflowPolicy::DropOldest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest queued event to make room.
    DropOldest,
    /// Wait up to `deadline` for room; evict the subscriber after that.
    BlockPublisher {
        /// Maximum wait per event.
        deadline: Duration,
    },
    /// Evict the subscriber immediately.
    DisconnectSubscriber,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::BlockPublisher {
            deadline: DEFAULT_BLOCK_DEADLINE,
        }
    }
}

/// Subscription parameters.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Event types to receive; empty means all.
    pub filter: HashSet<EventType>,
    /// Queue capacity.
    pub capacity: usize,
    /// Overflow behaviour.
    pub policy: OverflowPolicy,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            filter: HashSet::new(),
            capacity: DEFAULT_QUEUE_CAPACITY,
            policy: OverflowPolicy::default(),
        }
    }
}

impl SubscribeOptions {
    /// Restricts delivery to the given types.
    #[must_use]
    pub fn with_filter(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.filter = types.into_iter().collect();
        self
    }

    /// Overrides the queue capacity.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Overrides the overflow policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Why a subscription stopped delivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    /// The subscriber unsubscribed.
    Unsubscribed,
    /// The subscriber could not keep up and was evicted.
    SlowConsumer,
    /// The bus shut down.
    ShutDown,
}

/// Opaque handle identifying one subscription on one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Topic.
    pub trip_id: TripId,
    /// Process-unique subscription number.
    pub id: u64,
}

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

impl SubscriptionHandle {
    pub(crate) fn next(trip_id: TripId) -> Self {
        Self {
            trip_id,
            id: NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Event queued.
    Queued,
    /// Event queued after discarding the oldest one.
    ReplacedOldest,
    /// Event filtered out.
    Skipped,
    /// Queue full under a non-lossy policy.
    Full,
    /// Subscription already closed.
    Closed,
}

#[derive(Debug)]
struct QueueState {
    buf: VecDeque<Event>,
    closed: Option<ClosedBy>,
    dropped: u64,
}

/// Bounded event queue shared by the bus and one subscriber.
#[derive(Debug)]
pub struct SubscriberQueue {
    handle: SubscriptionHandle,
    user_id: UserId,
    filter: HashSet<EventType>,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
    shut: Notify,
}

impl SubscriberQueue {
    pub(crate) fn new(handle: SubscriptionHandle, user_id: UserId, options: SubscribeOptions) -> Self {
        let capacity = options.capacity.max(1);
        Self {
            handle,
            user_id,
            filter: options.filter,
            capacity,
            policy: options.policy,
            state: Mutex::new(QueueState {
                buf: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
                closed: None,
                dropped: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            shut: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscription handle.
    #[must_use]
    pub const fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Subscribing user.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Overflow policy.
    #[must_use]
    pub const fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Whether the filter admits this event type.
    #[must_use]
    pub fn accepts(&self, event_type: EventType) -> bool {
        self.filter.is_empty() || self.filter.contains(&event_type)
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded by `DropOldest` so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Why the queue closed, if it did.
    #[must_use]
    pub fn closed_by(&self) -> Option<ClosedBy> {
        self.lock().closed
    }

    pub(crate) fn try_push(&self, event: &Event) -> PushOutcome {
        if !self.accepts(event.event_type) {
            return PushOutcome::Skipped;
        }
        let mut state = self.lock();
        if state.closed.is_some() {
            return PushOutcome::Closed;
        }
        let outcome = if state.buf.len() < self.capacity {
            state.buf.push_back(event.clone());
            PushOutcome::Queued
        } else if event.is_lossy() || self.policy == OverflowPolicy::DropOldest {
            state.buf.pop_front();
            state.buf.push_back(event.clone());
            state.dropped += 1;
            PushOutcome::ReplacedOldest
        } else {
            return PushOutcome::Full;
        };
        drop(state);
        self.readable.notify_one();
        outcome
    }

    /// Enqueues, waiting for room as long as the queue is full.
    pub(crate) async fn push_waiting(&self, event: &Event) -> PushOutcome {
        loop {
            match self.try_push(event) {
                PushOutcome::Full => self.writable.notified().await,
                other => return other,
            }
        }
    }

    /// Closes the queue. Only the first cause is kept.
    pub(crate) fn close(&self, cause: ClosedBy) -> bool {
        let mut state = self.lock();
        if state.closed.is_some() {
            return false;
        }
        state.closed = Some(cause);
        drop(state);
        self.readable.notify_one();
        self.writable.notify_one();
        self.shut.notify_waiters();
        true
    }

    async fn wait_closed(&self) -> ClosedBy {
        loop {
            let notified = self.shut.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(cause) = self.closed_by() {
                return cause;
            }
            notified.await;
        }
    }

    async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut state = self.lock();
                if let Some(event) = state.buf.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(event);
                }
                if state.closed.is_some() {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }
}

/// Receiving side of a subscription.
///
/// Dropping it does not unsubscribe; call
/// [`EventBus::unsubscribe`](super::EventBus::unsubscribe) with the handle.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    pub(crate) const fn new(queue: Arc<SubscriberQueue>) -> Self {
        Self { queue }
    }

    /// Handle for unsubscribing.
    #[must_use]
    pub fn handle(&self) -> SubscriptionHandle {
        self.queue.handle()
    }

    /// Next event in publication order.
    ///
    /// Returns `None` once the subscription is closed and drained; see
    /// [`Subscription::closed_by`] for why. Queued events are still
    /// delivered after an unsubscribe, but not after an eviction.
    pub async fn recv(&self) -> Option<Event> {
        if self.queue.closed_by() == Some(ClosedBy::SlowConsumer) {
            return None;
        }
        self.queue.pop().await
    }

    /// Why the subscription closed, if it did.
    #[must_use]
    pub fn closed_by(&self) -> Option<ClosedBy> {
        self.queue.closed_by()
    }

    /// Resolves once the bus evicts this subscriber as a slow consumer.
    /// Never resolves if the subscription closes for any other reason.
    pub async fn evicted(&self) {
        if self.queue.wait_closed().await != ClosedBy::SlowConsumer {
            std::future::pending::<()>().await;
        }
    }

    /// Number of events waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Events discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: EventType, n: u64) -> Event {
        Event::new(event_type, TripId::new(), UserId::new(), "test", json!({ "n": n }))
    }

    fn queue(options: SubscribeOptions) -> SubscriberQueue {
        SubscriberQueue::new(SubscriptionHandle::next(TripId::new()), UserId::new(), options)
    }

    #[test]
    fn filter_skips_other_types() {
        let q = queue(SubscribeOptions::default().with_filter([EventType::ChatMessageSent]));
        assert_eq!(q.try_push(&event(EventType::ChatTyping, 0)), PushOutcome::Skipped);
        assert_eq!(q.try_push(&event(EventType::ChatMessageSent, 0)), PushOutcome::Queued);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn drop_oldest_keeps_newest() {
        let q = queue(
            SubscribeOptions::default()
                .with_capacity(2)
                .with_policy(OverflowPolicy::DropOldest),
        );
        for n in 0..3 {
            q.try_push(&event(EventType::ChatMessageSent, n));
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn lossy_events_never_report_full() {
        let q = queue(
            SubscribeOptions::default()
                .with_capacity(1)
                .with_policy(OverflowPolicy::DisconnectSubscriber),
        );
        assert_eq!(q.try_push(&event(EventType::ChatMessageSent, 0)), PushOutcome::Queued);
        assert_eq!(
            q.try_push(&event(EventType::ChatTyping, 1)),
            PushOutcome::ReplacedOldest
        );
        assert_eq!(
            q.try_push(&event(EventType::ChatMessageSent, 2)),
            PushOutcome::Full
        );
    }

    #[tokio::test]
    async fn eviction_wakes_a_waiting_subscriber() {
        let q = Arc::new(queue(SubscribeOptions::default()));
        let sub = Subscription::new(Arc::clone(&q));
        let waiter = tokio::spawn(async move { sub.evicted().await });
        tokio::task::yield_now().await;
        assert!(q.close(ClosedBy::SlowConsumer));
        let Ok(joined) = tokio::time::timeout(Duration::from_secs(1), waiter).await else {
            panic!("eviction was not observed");
        };
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_is_not_an_eviction() {
        let q = Arc::new(queue(SubscribeOptions::default()));
        let sub = Subscription::new(Arc::clone(&q));
        assert!(q.close(ClosedBy::Unsubscribed));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.evicted())
                .await
                .is_err()
        );
    }

    #[test]
    fn close_is_idempotent_and_keeps_first_cause() {
        let q = queue(SubscribeOptions::default());
        assert!(q.close(ClosedBy::SlowConsumer));
        assert!(!q.close(ClosedBy::Unsubscribed));
        assert_eq!(q.closed_by(), Some(ClosedBy::SlowConsumer));
        assert_eq!(q.try_push(&event(EventType::ChatMessageSent, 0)), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn unsubscribed_queue_drains_then_ends() {
        let q = Arc::new(queue(SubscribeOptions::default()));
        q.try_push(&event(EventType::ChatMessageSent, 7));
        q.close(ClosedBy::Unsubscribed);
        let sub = Subscription::new(Arc::clone(&q));
        let Some(first) = sub.recv().await else {
            panic!("queued event should still be delivered");
        };
        assert_eq!(first.payload["n"], 7);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn blocked_push_resumes_when_consumer_reads() {
        let q = Arc::new(queue(SubscribeOptions::default().with_capacity(1)));
        q.try_push(&event(EventType::ChatMessageSent, 0));
        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push_waiting(&event(EventType::ChatMessageSent, 1)).await })
        };
        let sub = Subscription::new(Arc::clone(&q));
        assert!(sub.recv().await.is_some());
        let Ok(outcome) = producer.await else {
            panic!("producer task failed");
        };
        assert_eq!(outcome, PushOutcome::Queued);
        assert_eq!(sub.pending(), 1);
    }
}
