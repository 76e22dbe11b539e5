//! Retry logic with exponential backoff
//!
//! This module provides utilities for retrying operations with configurable
//! retry policies, exponential backoff and jitter.

use crate::Result;
use crate::error::MCPError;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound of the random jitter, as a fraction of the computed delay
const JITTER_FRACTION: f64 = 0.1;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier (typically 2.0 for exponential backoff)
    pub backoff_multiplier: f64,

    /// Add up to 10% random jitter to every delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy without jitter
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Create a policy with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Create a policy with fast retries (for testing)
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Unjittered delay after failed attempt `attempt` (1-based)
    ///
    /// `min(initial × multiplier^(attempt-1), max)`, floored to whole milliseconds.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let cap_ms = self.max_backoff.as_millis() as f64;

        Duration::from_millis(backoff_ms.min(cap_ms).floor() as u64)
    }

    /// Delay after failed attempt `attempt`, with jitter when enabled
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }

        let base_ms = base.as_millis() as f64;
        let jitter_ms = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION) * base_ms;
        Duration::from_millis((base_ms + jitter_ms).floor() as u64)
    }

    /// Execute an async operation with retry logic
    ///
    /// Errors are retried when [`MCPError::is_retryable`] says so.
    ///
    /// # Arguments
    ///
    /// * `operation_name` - Name of the operation (for logging)
    /// * `operation` - Async operation to execute
    ///
    /// # Returns
    ///
    /// Result of the operation, or the last error if all attempts fail
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute_with(operation_name, MCPError::is_retryable, None, operation)
            .await
    }

    /// Execute with a custom retryability predicate and an optional cancellation token
    ///
    /// Cancelling the token during a backoff wait returns [`MCPError::Cancelled`]
    /// without waiting out the delay.
    pub async fn execute_with<F, Fut, T, P>(
        &self,
        operation_name: &str,
        is_retryable: P,
        cancel: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
        P: Fn(&MCPError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(MCPError::Cancelled);
            }

            debug!(
                "Attempt {}/{} for operation: {}",
                attempt, max_attempts, operation_name
            );

            let error = match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(
                            "Operation '{}' succeeded after {} retries",
                            operation_name,
                            attempt - 1
                        );
                    }
                    return Ok(result);
                }
                Err(e) => e,
            };

            if !is_retryable(&error) {
                debug!("Operation '{}' failed with non-retryable error", operation_name);
                return Err(error);
            }

            if attempt >= max_attempts {
                warn!(
                    "Operation '{}' failed after {} attempts: {}",
                    operation_name, max_attempts, error
                );
                return Err(error);
            }

            let backoff = self.delay_for_attempt(attempt);
            warn!(
                "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                operation_name, attempt, max_attempts, error, backoff
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = token.cancelled() => {
                            debug!("Operation '{}' cancelled during backoff", operation_name);
                            return Err(MCPError::Cancelled);
                        }
                        () = sleep(backoff) => {}
                    }
                }
                None => sleep(backoff).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(10));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert!(policy.jitter);
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_secs(10), 2.0);

        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(5), 2.0);

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new(10, Duration::from_millis(150), Duration::from_secs(30), 1.5)
            .with_jitter(true);

        for attempt in 1..=8 {
            let base = policy.base_delay(attempt);
            let upper = Duration::from_millis((base.as_millis() * 11 / 10) as u64);
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay >= base, "{delay:?} < {base:?}");
                assert!(delay <= upper, "{delay:?} > {upper:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_execute_success_first_try() {
        let policy = RetryPolicy::fast();
        let attempts = Arc::new(AtomicU32::new(0));
        let count = attempts.clone();

        let result = policy
            .execute("test_op", || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok::<i32, MCPError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_success_after_retry() {
        let policy = RetryPolicy::fast();
        let attempts = Arc::new(AtomicU32::new(0));
        let count = attempts.clone();

        let result = policy
            .execute("test_op", || {
                let count = count.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(MCPError::ConnectionFailed("test".to_string()))
                    } else {
                        Ok::<i32, MCPError>(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_all_attempts_fail() {
        let policy = RetryPolicy::fast();
        let attempts = Arc::new(AtomicU32::new(0));
        let count = attempts.clone();

        let result = policy
            .execute("test_op", || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, MCPError>(MCPError::Transport(format!(
                        "attempt {}",
                        count.load(Ordering::SeqCst)
                    )))
                }
            })
            .await;

        // The last error is propagated
        assert_eq!(result.unwrap_err().to_string(), "Transport error: attempt 3");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_non_retryable_error() {
        let policy = RetryPolicy::fast();
        let attempts = Arc::new(AtomicU32::new(0));
        let count = attempts.clone();

        let result = policy
            .execute("test_op", || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, MCPError>(MCPError::Validation("test".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(MCPError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1); // Should not retry
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let policy = RetryPolicy::fast();
        let attempts = Arc::new(AtomicU32::new(0));
        let count = attempts.clone();

        let result = policy
            .execute_with(
                "test_op",
                |e| matches!(e, MCPError::Validation(_)),
                None,
                || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Err::<(), MCPError>(MCPError::Validation("flaky".to_string()))
                    }
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60), 1.0);
        let token = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let count = attempts.clone();
        let started = tokio::time::Instant::now();
        let result = policy
            .execute_with("test_op", MCPError::is_retryable, Some(&token), || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err::<(), MCPError>(MCPError::NotConnected)
                }
            })
            .await;

        assert!(matches!(result, Err(MCPError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
