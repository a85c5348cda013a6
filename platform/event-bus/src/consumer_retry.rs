//! Consumer retry logic with exponential backoff
//!
//! Provides retry functionality for event consumers to handle transient failures
//! before events are sent to the Dead Letter Queue (DLQ).

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Hard cap on the `x-delay` header the delayed exchange will honor
/// (§4.2.4). A policy that would schedule past this is clamped, with a
/// warning logged at the clamp site.
pub const MAX_DELAY_MS: i64 = 3_600_000;

/// The retry-scheduling policy a consumer applies per event name (§4.2.4).
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Constant delay applied to every retry, e.g. `Scalar(1000.0)` always
    /// waits 1s before redelivery, regardless of attempt number.
    Scalar(f64),
    /// Explicit delay in milliseconds per attempt. Once `attempt` exceeds
    /// the sequence length, the last entry is reused indefinitely.
    Sequence(Vec<f64>),
}

impl BackoffPolicy {
    /// Delay, in milliseconds, before redelivering the `attempt`-th retry
    /// (1-based: `attempt == 1` is the delay before the first redelivery).
    /// Clamped to [`MAX_DELAY_MS`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw_ms = match self {
            // §4.2.4: scalar backoff is a constant delay, not scaled by attempt.
            BackoffPolicy::Scalar(base_ms) => *base_ms,
            BackoffPolicy::Sequence(steps) => {
                if steps.is_empty() {
                    0.0
                } else {
                    let idx = (attempt as usize).saturating_sub(1).min(steps.len() - 1);
                    steps[idx]
                }
            }
        };

        let clamped_ms = if raw_ms > MAX_DELAY_MS as f64 {
            warn!(
                attempt,
                requested_ms = raw_ms,
                cap_ms = MAX_DELAY_MS,
                "retry delay exceeds cap, clamping"
            );
            MAX_DELAY_MS
        } else {
            raw_ms.max(0.0) as i64
        };

        Duration::from_millis(clamped_ms as u64)
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// # Arguments
/// * `operation` - The async operation to retry (must be Send)
/// * `config` - Retry configuration
/// * `context` - Context string for logging (e.g., "process_payment_event")
///
/// # Returns
/// * `Ok(T)` if operation succeeds within max_attempts
/// * `Err(E)` if all retries are exhausted
///
/// # Example
/// ```rust
/// use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let result = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "example_operation"
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;

                // Exponential backoff with cap
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let config = RetryConfig::default();
        let result = retry_with_backoff(
            || async { Ok::<_, String>(42) },
            &config,
            "test_operation",
        )
        .await;

        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let config = RetryConfig::default();
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    let mut count = attempts.lock().unwrap();
                    *count += 1;
                    if *count < 3 {
                        Err(format!("Attempt {}", *count))
                    } else {
                        Ok(42)
                    }
                }
            },
            &config,
            "test_operation",
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let config = RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        };

        let result = retry_with_backoff(
            || async { Err::<i32, _>("persistent error") },
            &config,
            "test_operation",
        )
        .await;

        assert_eq!(result, Err("persistent error"));
    }

    #[tokio::test]
    async fn test_exponential_backoff() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };

        let start = std::time::Instant::now();
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let _result = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    let mut count = attempts.lock().unwrap();
                    *count += 1;
                    Err::<i32, _>("error")
                }
            },
            &config,
            "test_operation",
        )
        .await;

        let elapsed = start.elapsed();

        // Should have waited: 10ms + 20ms + 40ms = 70ms minimum
        // But capped at 50ms for last retry: 10ms + 20ms + 50ms = 80ms
        assert!(elapsed >= Duration::from_millis(70));
        assert_eq!(*attempts.lock().unwrap(), 4);
    }

    #[test]
    fn scalar_policy_is_constant_across_attempts() {
        let policy = BackoffPolicy::Scalar(1000.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
    }

    #[test]
    fn sequence_policy_reuses_last_step_past_its_length() {
        let policy = BackoffPolicy::Sequence(vec![500.0, 2000.0, 10_000.0]);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(10_000));
    }

    #[test]
    fn scalar_policy_clamps_to_max_delay() {
        let policy = BackoffPolicy::Scalar(10_000_000.0);
        assert_eq!(
            policy.delay_for_attempt(1),
            Duration::from_millis(MAX_DELAY_MS as u64)
        );
    }
}
