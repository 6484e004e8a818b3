//! External broker seam for multi-node deployments.
//!
//! A [`Broker`] carries events between nodes. Each node publishes every
//! locally produced event to the broker and runs one fan-in task that feeds
//! broker messages back into its local topics. Echoes of a node's own
//! events are suppressed by the bus's recently-seen cache, not here.

use std::fmt;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;

use crate::domain::Event;

/// Stream of events arriving from the broker.
pub type EventStream = BoxStream<'static, Event>;

/// Broker failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// Could not reach the broker or it refused the command.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// Event could not be encoded.
    #[error("broker codec error: {0}")]
    Codec(String),
}

/// Cross-node event transport.
#[async_trait]
pub trait Broker: Send + Sync + fmt::Debug {
    /// Sends one event to every node.
    async fn publish(&self, event: &Event) -> Result<(), BrokerError>;

    /// Opens a stream of events published by any node, this one included.
    async fn subscribe(&self) -> Result<EventStream, BrokerError>;
}

/// Redis pub/sub broker. One channel per trip under a common prefix.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
}

impl fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBroker")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connects to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unavailable`] if the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)
            .map_err(|e| BrokerError::Unavailable(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let prefix = prefix.into();
        tracing::info!(%prefix, "redis event broker connected");
        Ok(Self {
            client,
            conn,
            prefix,
        })
    }

    fn channel(&self, event: &Event) -> String {
        format!("{}:trip:{}", self.prefix, event.trip_id)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, event: &Event) -> Result<(), BrokerError> {
        let payload =
            serde_json::to_string(event).map_err(|e| BrokerError::Codec(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _receivers: i64 = conn
            .publish(self.channel(event), payload)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, BrokerError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        pubsub
            .psubscribe(format!("{}:trip:*", self.prefix))
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        let events = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable broker payload");
                    return None;
                }
            };
            match serde_json::from_str::<Event>(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "malformed event from broker");
                    None
                }
            }
        });
        Ok(Box::pin(events))
    }
}

/// In-process broker. Lets several buses in one process behave like
/// separate nodes sharing a broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    sender: broadcast::Sender<Event>,
}

impl MemoryBroker {
    /// Creates a broker buffering up to `capacity` events per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, event: &Event) -> Result<(), BrokerError> {
        // No receivers is not an error: no other node is listening yet.
        let _ = self.sender.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<EventStream, BrokerError> {
        let rx = self.sender.subscribe();
        let events = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "memory broker receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{EventType, TripId, UserId};
    use serde_json::json;

    #[tokio::test]
    async fn memory_broker_delivers_to_every_subscriber() {
        let broker = MemoryBroker::new(16);
        let Ok(mut a) = broker.subscribe().await else {
            panic!("subscribe a");
        };
        let Ok(mut b) = broker.subscribe().await else {
            panic!("subscribe b");
        };
        let event = Event::new(
            EventType::TripUpdated,
            TripId::new(),
            UserId::new(),
            "test",
            json!({}),
        );
        assert!(broker.publish(&event).await.is_ok());
        assert_eq!(a.next().await.map(|e| e.id), Some(event.id));
        assert_eq!(b.next().await.map(|e| e.id), Some(event.id));
    }
}
