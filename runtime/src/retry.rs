//! Retry with exponential backoff for transient broker failures.
//!
//! The same [`RetryPolicy`] drives three things: the Store's retry of
//! publish effects, the consumer's delay before a requeued delivery is
//! pulled again, and the startup loop that waits for the broker.
//!
//! # Example
//!
//! ```rust
//! use campus_orders_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_millis(10));
//!
//! let value = retry_with_backoff(&policy, "declare_topology", || async {
//!     Ok::<_, String>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use std::time::Duration;

/// Retry policy for handling transient failures
///
/// Implements exponential backoff with jitter so that several workers
/// retrying against the same broker do not retry in lockstep.
///
/// # Example
///
/// ```
/// use campus_orders_runtime::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_max_attempts(10)
///     .with_initial_delay(Duration::from_millis(500));
/// assert_eq!(policy.max_attempts(), 10);
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt)
    max_attempts: u32,

    /// Delay before the first retry
    initial_delay: Duration,

    /// Maximum delay between retries (caps exponential backoff)
    max_delay: Duration,

    /// Multiplier for exponential backoff (2.0 = double each time)
    backoff_multiplier: f64,

    /// Whether to randomise delays into `[0.5, 1.0] * delay`
    jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with default settings
    ///
    /// Defaults:
    /// - `max_attempts`: 5
    /// - `initial_delay`: 1 second
    /// - `max_delay`: 32 seconds
    /// - `backoff_multiplier`: 2.0
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// A policy that retries immediately without backoff. Meant for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Set maximum attempts
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set initial delay before first retry
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay between retries
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    #[must_use]
    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disable jitter, making delays deterministic
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculate delay for a given attempt number (0-indexed)
    ///
    /// `delay = min(initial_delay * multiplier^attempt, max_delay)`, then
    /// multiplied by a random factor in `[0.5, 1.0]` when jitter is enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Attempts are bounded by max_attempts, far below i32::MAX
        #[allow(clippy::cast_possible_wrap)]
        let exponent = attempt.min(64) as i32;
        let base_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_secs = base_secs.min(self.max_delay.as_secs_f64());

        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            1.0
        };

        Duration::from_secs_f64(capped_secs * factor)
    }

    /// Get maximum number of attempts
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Check if another attempt is allowed after `attempt` attempts
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry an async operation with exponential backoff.
///
/// Returns the first success, or the last error once `policy.max_attempts()`
/// attempts have failed.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(error) => {
                attempt += 1;
                if !policy.should_retry(attempt) {
                    tracing::error!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %error,
                        "Operation failed after max attempts"
                    );
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Operation failed, retrying..."
                );
                tokio::time::sleep(delay).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn delays_double_and_cap_without_jitter() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .without_jitter();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::new();
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(2000));
        }
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let policy = RetryPolicy::immediate(5);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = retry_with_backoff(&policy, "flaky", || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(format!("attempt {n} failed")) } else { Ok(n) }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy::immediate(3);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = retry_with_backoff(&policy, "down", || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("broker unavailable")
            }
        })
        .await;

        assert_eq!(result, Err("broker unavailable"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
