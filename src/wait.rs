//! Bounded waits for asynchronous reconciliation
//!
//! Label updates happen out of band: the chart's daemon detects devices and a
//! controller patches the node objects some time later. [`WaitPolicy`] decides
//! how the scenario bridges that gap.
//!
//! # Example
//!
//! ```ignore
//! let policy = WaitPolicy::poll(Duration::from_secs(180));
//! let outcome = policy
//!     .settle("label vendor.example/npu.count", || async {
//!         verifier.assert_label_on_all_nodes(&expected).await
//!     })
//!     .await?;
//! println!("converged after {:?}", outcome.elapsed);
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::eventually::{eventually, ConditionError};

/// How to wait for the cluster to converge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Pause for a fixed duration and let the following step check the result
    Fixed(Duration),

    /// Re-check the condition with capped exponential backoff until it holds
    Poll {
        timeout: Duration,
        initial_interval: Duration,
        max_interval: Duration,
    },
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::Fixed(Duration::from_secs(120))
    }
}

impl WaitPolicy {
    /// Poll with a 1s initial interval capped at 15s
    #[must_use]
    pub fn poll(timeout: Duration) -> Self {
        Self::Poll {
            timeout,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(15),
        }
    }

    /// Longest this policy can block
    #[must_use]
    pub fn budget(&self) -> Duration {
        match self {
            Self::Fixed(pause) => *pause,
            Self::Poll { timeout, .. } => *timeout,
        }
    }

    /// Wait according to the policy
    ///
    /// `Fixed` never evaluates `condition`. `Poll` returns as soon as it
    /// yields `Ok`, or a [`WaitError`] naming `resource` at the deadline.
    pub async fn settle<F, Fut, E>(
        &self,
        resource: &str,
        condition: F,
    ) -> Result<WaitOutcome, WaitError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let start = Instant::now();

        match *self {
            Self::Fixed(pause) => {
                info!(resource = %resource, pause = ?pause, "Pausing for reconciliation");
                tokio::time::sleep(pause).await;
                Ok(WaitOutcome {
                    elapsed: start.elapsed(),
                    attempts: 0,
                })
            }
            Self::Poll {
                timeout,
                initial_interval,
                max_interval,
            } => {
                info!(resource = %resource, timeout = ?timeout, "Polling for convergence");
                let attempts = eventually(condition)
                    .timeout(timeout)
                    .interval(initial_interval)
                    .max_interval(max_interval)
                    .await_condition()
                    .await
                    .map_err(|e| WaitError::from_condition(resource, timeout, e))?;

                let elapsed = start.elapsed();
                info!(resource = %resource, elapsed = ?elapsed, attempts, "Converged");
                Ok(WaitOutcome { elapsed, attempts })
            }
        }
    }
}

/// What a successful wait observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub elapsed: Duration,
    /// Condition evaluations; zero for a fixed pause
    pub attempts: u32,
}

/// Rich error context for a wait that ran out of time
#[derive(Debug, Clone)]
pub struct WaitError {
    /// What was being waited on (e.g., "label vendor.example/npu.count")
    pub resource: String,
    /// Description of the last observed state
    pub last_state: String,
    /// How long we waited before giving up
    pub elapsed: Duration,
    /// The timeout that was configured
    pub timeout: Duration,
    pub attempts: u32,
}

impl WaitError {
    /// Create a new `WaitError`
    #[must_use]
    pub fn new(resource: impl Into<String>, timeout: Duration, elapsed: Duration) -> Self {
        Self {
            resource: resource.into(),
            last_state: "unknown".to_string(),
            elapsed,
            timeout,
            attempts: 0,
        }
    }

    /// Set the last observed state
    #[must_use]
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.last_state = state.into();
        self
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    fn from_condition(resource: &str, timeout: Duration, err: ConditionError) -> Self {
        match err {
            ConditionError::EventuallyFailed {
                attempts,
                elapsed,
                last_error,
            } => Self::new(resource, timeout, elapsed)
                .with_state(last_error)
                .with_attempts(attempts),
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "Wait timeout for {}", self.resource)?;
        writeln!(f, "├─ Last state: {}", self.last_state)?;
        writeln!(f, "├─ Attempts: {}", self.attempts)?;
        writeln!(f, "├─ Elapsed: {:?}", self.elapsed)?;
        write!(f, "└─ Timeout: {:?}", self.timeout)
    }
}

impl std::error::Error for WaitError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_wait_error_display() {
        let err = WaitError::new(
            "label vendor.example/npu.count",
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .with_state("node 'worker-1' is missing the label")
        .with_attempts(7);

        let output = err.to_string();
        assert!(output.contains("label vendor.example/npu.count"));
        assert!(output.contains("worker-1"));
        assert!(output.contains("Attempts: 7"));
        assert!(output.contains("60s"));
    }

    #[test]
    fn test_wait_error_builder() {
        let err = WaitError::new(
            "label x",
            Duration::from_secs(120),
            Duration::from_secs(115),
        );

        assert_eq!(err.resource, "label x");
        assert_eq!(err.timeout, Duration::from_secs(120));
        assert_eq!(err.elapsed, Duration::from_secs(115));
        assert_eq!(err.last_state, "unknown");
        assert_eq!(err.attempts, 0);
    }

    #[test]
    fn test_policy_budget() {
        assert_eq!(WaitPolicy::default().budget(), Duration::from_secs(120));
        assert_eq!(
            WaitPolicy::poll(Duration::from_secs(30)).budget(),
            Duration::from_secs(30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_pause_ignores_condition() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let start = Instant::now();

        let outcome = WaitPolicy::Fixed(Duration::from_secs(120))
            .settle("label", move || {
                let c = calls_clone.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.attempts, 0);
        assert!(start.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_early() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let outcome = WaitPolicy::poll(Duration::from_secs(600))
            .settle("label", move || {
                let c = calls_clone.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) >= 2 {
                        Ok(())
                    } else {
                        Err("not yet")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert!(outcome.elapsed < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_with_state() {
        let err = WaitPolicy::poll(Duration::from_secs(20))
            .settle("label vendor.example/npu.count", || async {
                Err::<(), _>("node 'worker-0' is missing the label")
            })
            .await
            .unwrap_err();

        assert_eq!(err.resource, "label vendor.example/npu.count");
        assert_eq!(err.timeout, Duration::from_secs(20));
        assert!(err.last_state.contains("worker-0"));
        assert!(err.attempts > 1);
    }
}
