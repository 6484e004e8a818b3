//! Bounded retries and deadlines for calls into external collaborators.
//!
//! Broker publishes and rate-limit store calls use [`retry_with_backoff`]
//! (3 attempts, exponential 10 ms to 200 ms). Idempotent store calls use
//! [`retry_transient`], which retries only errors that
//! [`AppError::is_transient`] accepts. Store lookups made on behalf of a
//! live connection go through [`with_deadline`] so they can never block a
//! handler indefinitely.

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the given zero-based failed attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds or the policy's attempts run out.
///
/// # Errors
///
/// Returns the last error produced by `operation`.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(policy, operation, |_| true).await
}

/// Retries an idempotent store call with the default policy while it
/// fails with a transient error.
///
/// # Errors
///
/// Returns the first non-transient error, or the last transient one once
/// attempts run out.
pub async fn retry_transient<F, Fut, T>(operation: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    retry_if(RetryPolicy::default(), operation, AppError::is_transient).await
}

/// Like [`retry_with_backoff`], but gives up at once on errors for which
/// `retryable` returns `false`.
///
/// # Errors
///
/// Returns the last error produced by `operation`.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !retryable(&err) => return Err(err),
            Err(err) if attempt + 1 >= attempts => {
                tracing::warn!(attempts, error = %err, "retries exhausted");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying after failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Bounds a fallible store call with a deadline.
///
/// # Errors
///
/// Returns [`AppError::Unavailable`] naming `what` when the deadline
/// elapses, otherwise whatever the future returned.
pub async fn with_deadline<T, Fut>(deadline: Duration, what: &str, fut: Fut) -> Result<T, AppError>
where
    Fut: Future<Output = Result<T, AppError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Unavailable(format!(
            "{what} timed out after {}ms",
            deadline.as_millis()
        ))),
    }
}
