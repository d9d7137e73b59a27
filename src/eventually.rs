//! Poll a fallible condition until it holds
//!
//! The interval starts small and doubles after every failed attempt up to a
//! cap, so a condition that holds quickly returns quickly without hammering
//! the API server during a long wait.
//!
//! # Example
//!
//! ```ignore
//! use discovery_e2e::eventually::eventually;
//! use std::time::Duration;
//!
//! let attempts = eventually(|| async { verifier.assert_label_on_all_nodes(&expected).await })
//!     .timeout(Duration::from_secs(180))
//!     .interval(Duration::from_secs(1))
//!     .max_interval(Duration::from_secs(15))
//!     .await_condition()
//!     .await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Error type for eventually operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConditionError {
    #[error("condition failed after {attempts} attempts over {elapsed:?}: {last_error}")]
    EventuallyFailed {
        attempts: u32,
        elapsed: Duration,
        last_error: String,
    },
}

/// Builder for eventually checks
pub struct Eventually<F, Fut, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    condition: F,
    timeout: Duration,
    interval: Duration,
    max_interval: Duration,
}

/// Create an eventually check that retries until the condition returns `Ok`
///
/// Default timeout: 30 seconds
/// Default interval: 250ms, doubling up to 5 seconds
pub fn eventually<F, Fut, E>(condition: F) -> Eventually<F, Fut, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    Eventually {
        condition,
        timeout: Duration::from_secs(30),
        interval: Duration::from_millis(250),
        max_interval: Duration::from_secs(5),
    }
}

impl<F, Fut, E> Eventually<F, Fut, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    /// Set the overall deadline
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the first polling interval
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Cap the polling interval
    #[must_use]
    pub fn max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Run the check, retrying until success or timeout
    ///
    /// Returns the number of attempts it took. The condition is always
    /// evaluated at least once, and never again after the deadline.
    pub async fn await_condition(self) -> Result<u32, ConditionError> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut backoff = self.interval;
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let last_error = match (self.condition)().await {
                Ok(()) => return Ok(attempts),
                Err(e) => e.to_string(),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(ConditionError::EventuallyFailed {
                    attempts,
                    elapsed: start.elapsed(),
                    last_error,
                });
            }

            debug!(attempt = attempts, backoff = ?backoff, error = %last_error, "Condition not met yet");

            // Never sleep past the deadline
            sleep(backoff.min(deadline - now)).await;
            backoff = std::cmp::min(backoff * 2, self.max_interval.max(self.interval));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_eventually_succeeds_immediately() {
        let attempts = eventually(|| async { Ok::<(), String>(()) })
            .timeout(Duration::from_millis(100))
            .await_condition()
            .await
            .unwrap();

        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_succeeds_after_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = eventually(move || {
            let c = counter_clone.clone();
            async move {
                let count = c.fetch_add(1, Ordering::SeqCst);
                if count >= 3 {
                    Ok(())
                } else {
                    Err(format!("attempt {count}"))
                }
            }
        })
        .timeout(Duration::from_secs(10))
        .interval(Duration::from_millis(10))
        .await_condition()
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_times_out_with_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = eventually(move || {
            let c = counter_clone.clone();
            async move {
                let count = c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(format!("still missing on attempt {count}"))
            }
        })
        .timeout(Duration::from_secs(1))
        .interval(Duration::from_millis(100))
        .await_condition()
        .await;

        match result.unwrap_err() {
            ConditionError::EventuallyFailed {
                attempts,
                elapsed,
                last_error,
            } => {
                assert!(attempts > 1);
                assert_eq!(attempts, counter.load(Ordering::SeqCst));
                assert!(elapsed >= Duration::from_secs(1));
                assert!(last_error.contains(&format!("attempt {}", attempts - 1)));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventually_backoff_is_capped() {
        let start = Instant::now();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        // 100, 200, 400, 400, 400 ... ms between attempts
        let _ = eventually(move || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("no")
            }
        })
        .timeout(Duration::from_millis(2500))
        .interval(Duration::from_millis(100))
        .max_interval(Duration::from_millis(400))
        .await_condition()
        .await;

        // attempts at 0, 100, 300, 700, 1100, 1500, 1900, 2300, 2500
        assert_eq!(counter.load(Ordering::SeqCst), 9);
        assert!(start.elapsed() >= Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_eventually_defaults() {
        let ev = eventually(|| async { Ok::<(), String>(()) });
        assert_eq!(ev.timeout, Duration::from_secs(30));
        assert_eq!(ev.interval, Duration::from_millis(250));
        assert_eq!(ev.max_interval, Duration::from_secs(5));
    }
}
