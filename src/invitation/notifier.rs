//! Out-of-band invitation notifications.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Event;
use crate::error::AppError;

/// Delivers `trip.invitation.received` events to the push or email
/// provider.
#[async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Hands one event to the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider refuses it.
    async fn notify(&self, event: &Event) -> Result<(), AppError>;
}

/// Writes notifications to the log. The default when no provider is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: &Event) -> Result<(), AppError> {
        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            trip_id = %event.trip_id,
            payload = %event.payload,
            "invitation notification"
        );
        Ok(())
    }
}

/// Runs `notifier` for `event` on a detached task bounded by `timeout`.
/// Failures are logged and never reach the caller.
pub fn notify_detached(
    notifier: Arc<dyn Notifier>,
    event: Event,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, notifier.notify(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(event_id = %event.id, error = %e, "invitation notification failed");
            }
            Err(_) => {
                tracing::warn!(
                    event_id = %event.id,
                    timeout_secs = timeout.as_secs(),
                    "invitation notification timed out"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, TripId, UserId};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Default)]
    struct Slow {
        finished: AtomicU32,
    }

    #[async_trait]
    impl Notifier for Slow {
        async fn notify(&self, _: &Event) -> Result<(), AppError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_provider_is_cut_off() {
        let slow = Arc::new(Slow::default());
        let event = Event::new(
            EventType::TripInvitationReceived,
            TripId::new(),
            UserId::new(),
            "test",
            serde_json::json!({}),
        );
        let handle = notify_detached(
            Arc::clone(&slow) as Arc<dyn Notifier>,
            event,
            Duration::from_millis(20),
        );
        assert!(handle.await.is_ok());
        assert_eq!(slow.finished.load(Ordering::SeqCst), 0);
    }
}
