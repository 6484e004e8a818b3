//! Chat delivery: validate, persist, then publish.
//!
//! Messages of one trip pass through a per-trip sequencer. Inside it the
//! message gets a `created_at` strictly after the previous one, is written
//! to the store and is published on the bus, so bus order, timestamp order
//! and storage order agree. A publish failure after a successful write is
//! logged and the message still counts as sent.
//!
//! Sequencers of trips that have been quiet for a while are dropped by
//! [`ChatPipeline::spawn_pruner`]; the next message reloads the last
//! timestamp from the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bus::EventBus;
use crate::domain::{
    CONTENT_TYPE_TEXT, ChatMessage, CursorUpdate, Event, EventType, MessageId, Reaction,
    ReactionAction, TripId, UserId,
};
use crate::error::AppError;
use crate::retry::{retry_transient, with_deadline};
use crate::session::SessionRegistry;
use crate::store::{Store, require_member};

/// Largest accepted message body, in bytes after trimming.
pub const MAX_CONTENT_BYTES: usize = 4096;

/// Page size when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Largest page a caller may ask for.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Longest accepted reaction, in characters.
pub const MAX_EMOJI_CHARS: usize = 32;

const EVENT_SOURCE: &str = "chat";

#[derive(Debug)]
struct SequencerState {
    last: Option<DateTime<Utc>>,
    used: Instant,
}

impl Default for SequencerState {
    fn default() -> Self {
        Self {
            last: None,
            used: Instant::now(),
        }
    }
}

type Sequencer = Arc<tokio::sync::Mutex<SequencerState>>;

/// Chat operations shared by the WebSocket and HTTP edges.
#[derive(Debug)]
pub struct ChatPipeline {
    store: Arc<dyn Store>,
    bus: EventBus,
    registry: Arc<SessionRegistry>,
    lookup_timeout: Duration,
    sequencers: Mutex<HashMap<TripId, Sequencer>>,
}

impl ChatPipeline {
    /// Creates a pipeline.
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
            sequencers: Mutex::new(HashMap::new()),
        }
    }

    fn sequencer(&self, trip: TripId) -> Sequencer {
        let mut map = self.sequencers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(trip).or_default())
    }

    /// Drops sequencers nobody holds that were last used more than `idle`
    /// ago. Returns how many were dropped.
    pub fn prune_idle(&self, idle: Duration) -> usize {
        let mut map = self.sequencers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        // Clones are only handed out under the map lock, so a count of one
        // means no sender is inside the sequencer.
        map.retain(|_, seq| {
            Arc::strong_count(seq) > 1
                || seq.try_lock().map_or(true, |state| state.used.elapsed() < idle)
        });
        before - map.len()
    }

    /// Number of trips with a live sequencer.
    #[must_use]
    pub fn sequencer_count(&self) -> usize {
        self.sequencers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Spawns a task pruning idle sequencers every `every`, until
    /// `shutdown` flips to `true`.
    #[must_use]
    pub fn spawn_pruner(
        self: &Arc<Self>,
        every: Duration,
        idle: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let chat = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pruned = chat.prune_idle(idle);
                        if pruned > 0 {
                            tracing::debug!(pruned, "dropped idle chat sequencers");
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

    async fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(event.clone()).await {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                trip_id = %event.trip_id,
                error = %e,
                "chat event not published"
            );
        }
    }

    /// Stores a message from `sender` and publishes `chat.message.sent`.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotMember`] if `sender` is not an active member.
    /// - [`AppError::Validation`] for empty or oversized content, or a reply
    ///   target outside the trip.
    /// - [`AppError::Persistence`] / [`AppError::Unavailable`] if the store
    ///   fails; nothing is published then.
    pub async fn send_message(
        &self,
        trip: TripId,
        sender: UserId,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<ChatMessage, AppError> {
        require_member(self.store.as_ref(), trip, sender, self.lookup_timeout).await?;
        let content = validate_content(content)?;
        if let Some(target) = reply_to {
            let found = with_deadline(
                self.lookup_timeout,
                "message lookup",
                retry_transient(|| self.store.get_message(target)),
            )
            .await?;
            if !found.is_some_and(|m| m.trip_id == trip) {
                return Err(AppError::Validation("reply target is not in this trip".to_string()));
            }
        }

        let sequencer = self.sequencer(trip);
        let mut seq = sequencer.lock().await;
        seq.used = Instant::now();
        if seq.last.is_none() {
            seq.last = retry_transient(|| self.store.latest_message_at(trip)).await?;
        }
        let created_at = next_timestamp(seq.last, Utc::now());
        let message = ChatMessage {
            id: MessageId::new(),
            trip_id: trip,
            sender_id: sender,
            content,
            content_type: CONTENT_TYPE_TEXT.to_string(),
            reply_to_id: reply_to,
            created_at,
        };
        retry_transient(|| self.store.insert_message(&message)).await?;
        seq.last = Some(created_at);

        let payload = serde_json::to_value(&message).unwrap_or_default();
        self.publish(Event::new(EventType::ChatMessageSent, trip, sender, EVENT_SOURCE, payload))
            .await;
        drop(seq);

        tracing::debug!(%trip, %sender, message_id = %message.id, "chat message stored");
        Ok(message)
    }

    /// Adds or removes a reaction. Publishes only when the reaction set
    /// actually changed; returns whether it did.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotMember`] if `user` is not an active member.
    /// - [`AppError::NotFound`] if the message is not in the trip.
    /// - [`AppError::Validation`] for an empty or overlong emoji.
    pub async fn react(
        &self,
        trip: TripId,
        user: UserId,
        message_id: MessageId,
        emoji: &str,
        action: ReactionAction,
    ) -> Result<bool, AppError> {
        require_member(self.store.as_ref(), trip, user, self.lookup_timeout).await?;
        let emoji = validate_reaction(emoji)?;
        self.message_in_trip(trip, message_id).await?;

        let reaction = Reaction {
            message_id,
            user_id: user,
            emoji: emoji.to_string(),
        };
        let (changed, event_type) = match action {
            ReactionAction::Add => (
                self.store.add_reaction(&reaction).await?,
                EventType::ChatReactionAdded,
            ),
            ReactionAction::Remove => (
                self.store.remove_reaction(&reaction).await?,
                EventType::ChatReactionRemoved,
            ),
        };
        if changed {
            let payload = json!({
                "messageId": message_id,
                "userId": user,
                "emoji": reaction.emoji,
                "action": action,
            });
            self.publish(Event::new(event_type, trip, user, EVENT_SOURCE, payload))
                .await;
        }
        Ok(changed)
    }

    /// Moves `user`'s read cursor to `message_id` if that is further
    /// along. Publishes `chat.read_receipt` only when it moved.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotMember`] if `user` is not an active member.
    /// - [`AppError::NotFound`] if the message is not in the trip.
    pub async fn mark_read(
        &self,
        trip: TripId,
        user: UserId,
        message_id: MessageId,
    ) -> Result<CursorUpdate, AppError> {
        require_member(self.store.as_ref(), trip, user, self.lookup_timeout).await?;
        let message = self.message_in_trip(trip, message_id).await?;
        let update =
            retry_transient(|| self.store.advance_read_cursor(trip, user, &message)).await?;
        if update.advanced {
            let payload = json!({
                "userId": user,
                "lastReadMessageId": update.cursor.last_read_message_id,
                "lastReadAt": update.cursor.last_read_at,
            });
            self.publish(Event::new(EventType::ChatReadReceipt, trip, user, EVENT_SOURCE, payload))
                .await;
        }
        Ok(update)
    }

    /// Relays a typing indicator to the other members' connections.
    /// Nothing is stored. Returns how many connections received it.
    pub async fn typing(&self, trip: TripId, user: UserId, is_typing: bool) -> usize {
        let event = Event::new(
            EventType::ChatTyping,
            trip,
            user,
            EVENT_SOURCE,
            json!({ "userId": user, "isTyping": is_typing }),
        );
        self.registry.broadcast_except(user, &event).await
    }

    /// Messages of a trip, newest first. `limit` defaults to 50 and is
    /// capped at 100.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotMember`] if `user` is not an active member.
    pub async fn list_messages(
        &self,
        trip: TripId,
        user: UserId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<ChatMessage>, AppError> {
        require_member(self.store.as_ref(), trip, user, self.lookup_timeout).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0);
        retry_transient(|| self.store.list_messages(trip, limit, offset)).await
    }

    async fn message_in_trip(&self, trip: TripId, id: MessageId) -> Result<ChatMessage, AppError> {
        with_deadline(
            self.lookup_timeout,
            "message lookup",
            retry_transient(|| self.store.get_message(id)),
        )
        .await?
            .filter(|m| m.trip_id == trip)
            .ok_or_else(|| AppError::NotFound("message".to_string()))
    }
}

/// Trims `content` and checks it is non-empty and within
/// [`MAX_CONTENT_BYTES`].
///
/// # Errors
///
/// [`AppError::Validation`] when either rule fails.
pub fn validate_content(content: &str) -> Result<String, AppError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(AppError::Validation("message content cannot be empty".to_string()));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(AppError::Validation(format!(
            "message content exceeds {MAX_CONTENT_BYTES} bytes"
        )));
    }
    Ok(content.to_string())
}

/// Trims a reaction and checks it is 1 to [`MAX_EMOJI_CHARS`] characters.
///
/// # Errors
///
/// [`AppError::Validation`] otherwise.
pub fn validate_reaction(emoji: &str) -> Result<&str, AppError> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
        return Err(AppError::Validation(format!(
            "reaction must be 1 to {MAX_EMOJI_CHARS} characters"
        )));
    }
    Ok(emoji)
}

/// Next per-trip timestamp: `now` at microsecond precision, or one
/// microsecond after `last` if the clock has not moved past it.
fn next_timestamp(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
    match last {
        Some(prev) if now <= prev => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, SubscribeOptions};
    use crate::domain::{MemberRole, Membership};
    use crate::store::{ChatStore, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: EventBus,
        chat: ChatPipeline,
        trip: TripId,
        alice: UserId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dyn_store = Arc::clone(&store) as Arc<dyn Store>;
        let bus = EventBus::new(BusConfig::default());
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&dyn_store), Duration::from_secs(1)));
        let chat = ChatPipeline::new(dyn_store, bus.clone(), registry, Duration::from_secs(1));
        let trip = TripId::new();
        let alice = UserId::new();
        store
            .put_membership(Membership::active(trip, alice, MemberRole::Owner))
            .await;
        Fixture {
            store,
            bus,
            chat,
            trip,
            alice,
        }
    }

    #[test]
    fn timestamps_strictly_increase() {
        let now = Utc::now();
        let later = next_timestamp(Some(now + chrono::Duration::seconds(5)), now);
        assert!(later > now + chrono::Duration::seconds(5));
        let fresh = next_timestamp(None, now);
        assert_eq!(fresh.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn content_rules() {
        assert!(validate_content("   ").is_err());
        assert_eq!(validate_content("  hi  ").ok().as_deref(), Some("hi"));
        assert!(validate_content(&"x".repeat(MAX_CONTENT_BYTES)).is_ok());
        assert!(validate_content(&"x".repeat(MAX_CONTENT_BYTES + 1)).is_err());
    }

    #[tokio::test]
    async fn sent_messages_are_stored_then_published_in_order() {
        let f = fixture().await;
        let Ok(sub) = f
            .bus
            .subscribe(f.trip, UserId::new(), SubscribeOptions::default())
            .await
        else {
            panic!("subscribe failed");
        };
        let mut sent = Vec::new();
        for n in 0..5 {
            let Ok(msg) = f.chat.send_message(f.trip, f.alice, &format!("m{n}"), None).await else {
                panic!("send failed");
            };
            sent.push(msg);
        }
        for pair in sent.windows(2) {
            let [a, b] = pair else { panic!("window of two") };
            assert!(a.created_at < b.created_at);
        }
        for msg in &sent {
            let Some(event) = sub.recv().await else {
                panic!("missing event");
            };
            assert_eq!(event.event_type, EventType::ChatMessageSent);
            assert_eq!(event.payload["id"], msg.id.to_string());
        }
        let Ok(listed) = f.chat.list_messages(f.trip, f.alice, None, None).await else {
            panic!("list failed");
        };
        assert_eq!(listed.first().map(|m| m.id), sent.last().map(|m| m.id));
    }

    #[tokio::test]
    async fn store_failure_publishes_nothing() {
        let f = fixture().await;
        let Ok(sub) = f
            .bus
            .subscribe(f.trip, UserId::new(), SubscribeOptions::default())
            .await
        else {
            panic!("subscribe failed");
        };
        f.store.set_failing(true);
        assert!(f.chat.send_message(f.trip, f.alice, "hi", None).await.is_err());
        assert_eq!(sub.pending(), 0);
    }

    #[tokio::test]
    async fn non_members_cannot_send() {
        let f = fixture().await;
        assert_eq!(
            f.chat.send_message(f.trip, UserId::new(), "hi", None).await,
            Err(AppError::NotMember)
        );
    }

    #[tokio::test]
    async fn reactions_publish_only_on_change() {
        let f = fixture().await;
        let Ok(msg) = f.chat.send_message(f.trip, f.alice, "hi", None).await else {
            panic!("send failed");
        };
        let Ok(sub) = f
            .bus
            .subscribe(f.trip, UserId::new(), SubscribeOptions::default())
            .await
        else {
            panic!("subscribe failed");
        };
        assert_eq!(f.chat.react(f.trip, f.alice, msg.id, "👍", ReactionAction::Add).await, Ok(true));
        assert_eq!(f.chat.react(f.trip, f.alice, msg.id, "👍", ReactionAction::Add).await, Ok(false));
        assert_eq!(f.chat.react(f.trip, f.alice, msg.id, "👍", ReactionAction::Remove).await, Ok(true));
        assert_eq!(f.chat.react(f.trip, f.alice, msg.id, "👍", ReactionAction::Remove).await, Ok(false));
        assert_eq!(sub.pending(), 2);

        let missing = f
            .chat
            .react(f.trip, f.alice, MessageId::new(), "👍", ReactionAction::Add)
            .await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn read_cursor_only_moves_forward() {
        let f = fixture().await;
        let Ok(first) = f.chat.send_message(f.trip, f.alice, "one", None).await else {
            panic!("send failed");
        };
        let Ok(second) = f.chat.send_message(f.trip, f.alice, "two", None).await else {
            panic!("send failed");
        };
        let Ok(sub) = f
            .bus
            .subscribe(f.trip, UserId::new(), SubscribeOptions::default())
            .await
        else {
            panic!("subscribe failed");
        };
        assert!(f.chat.mark_read(f.trip, f.alice, second.id).await.is_ok_and(|u| u.advanced));
        let Ok(back) = f.chat.mark_read(f.trip, f.alice, first.id).await else {
            panic!("older receipt should be accepted");
        };
        assert!(!back.advanced);
        assert_eq!(back.cursor.last_read_message_id, second.id);
        assert_eq!(sub.pending(), 1);
    }

    #[tokio::test]
    async fn reply_must_stay_in_trip() {
        let f = fixture().await;
        let other = TripId::new();
        f.store
            .put_membership(Membership::active(other, f.alice, MemberRole::Owner))
            .await;
        let Ok(elsewhere) = f.chat.send_message(other, f.alice, "there", None).await else {
            panic!("send failed");
        };
        assert!(matches!(
            f.chat.send_message(f.trip, f.alice, "re", Some(elsewhere.id)).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let f = fixture().await;
        f.store.fail_next(2);
        let Ok(msg) = f.chat.send_message(f.trip, f.alice, "flaky", None).await else {
            panic!("two transient failures should be absorbed");
        };
        let Ok(Some(stored)) = f.store.get_message(msg.id).await else {
            panic!("message should be stored");
        };
        assert_eq!(stored.content, "flaky");

        f.store.fail_next(3);
        assert!(matches!(
            f.chat.send_message(f.trip, f.alice, "down", None).await,
            Err(AppError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn idle_sequencers_are_pruned_and_order_survives() {
        let f = fixture().await;
        let Ok(first) = f.chat.send_message(f.trip, f.alice, "before", None).await else {
            panic!("send failed");
        };
        assert_eq!(f.chat.sequencer_count(), 1);
        assert_eq!(f.chat.prune_idle(Duration::from_secs(60)), 0);
        assert_eq!(f.chat.prune_idle(Duration::ZERO), 1);
        assert_eq!(f.chat.sequencer_count(), 0);

        let Ok(second) = f.chat.send_message(f.trip, f.alice, "after", None).await else {
            panic!("send failed");
        };
        assert!(second.created_at > first.created_at);
        assert_eq!(f.chat.sequencer_count(), 1);
    }

    #[tokio::test]
    async fn list_clamps_page_size() {
        let f = fixture().await;
        for n in 0..3 {
            let _ = f.chat.send_message(f.trip, f.alice, &format!("m{n}"), None).await;
        }
        assert!(f.chat.list_messages(f.trip, f.alice, Some(0), None).await.is_ok_and(|m| m.len() == 1));
        assert!(f.chat.list_messages(f.trip, f.alice, Some(500), None).await.is_ok_and(|m| m.len() == 3));
        assert!(f.chat.list_messages(f.trip, f.alice, None, Some(2)).await.is_ok_and(|m| m.len() == 1));
    }
}
