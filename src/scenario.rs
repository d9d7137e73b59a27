//! Ordered acceptance steps with guaranteed teardown
//!
//! A [`Scenario`] is a list of named async steps run strictly in order,
//! plus teardown steps that run after the sequence no matter how it ended.
//! The first failing step stops the sequence; later steps are recorded as
//! skipped and never executed.
//!
//! # Example
//!
//! ```ignore
//! use discovery_e2e::scenario::{Phase, Scenario};
//! use tokio_util::sync::CancellationToken;
//!
//! let report = Scenario::new("feature discovery")
//!     .step("check label absent", Phase::Precheck, || async { Ok(()) })
//!     .step("install chart", Phase::Deploy, || async { Ok(()) })
//!     .teardown("uninstall chart", Phase::Teardown, || async { Ok(()) })
//!     .run(&CancellationToken::new())
//!     .await;
//! assert!(report.outcome().passed());
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cleanup::CleanupError;
use crate::deploy::DeploymentError;
use crate::report::{ScenarioReport, StepRecord, StepStatus};
use crate::verify::VerifyError;
use crate::wait::WaitError;

/// Stage of the scenario a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Precheck,
    Cleanup,
    Deploy,
    Wait,
    Verify,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Precheck => "precheck",
            Self::Cleanup => "cleanup",
            Self::Deploy => "deploy",
            Self::Wait => "wait",
            Self::Verify => "verify",
            Self::Teardown => "teardown",
        };
        f.write_str(s)
    }
}

/// Error type for a single step
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("precondition not met: {0}")]
    Precondition(String),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    #[error(transparent)]
    Verification(#[from] VerifyError),

    #[error("{0}")]
    Wait(#[from] WaitError),
}

/// Type alias for a boxed async step
type AsyncAction =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<(), StepError>> + Send>> + Send>;

struct Step {
    name: String,
    phase: Phase,
    action: AsyncAction,
}

impl Step {
    fn skipped(self, teardown: bool) -> StepRecord {
        StepRecord {
            name: self.name,
            phase: self.phase,
            status: StepStatus::Skipped,
            elapsed: Duration::ZERO,
            teardown,
        }
    }
}

/// Named sequence of steps plus teardown
pub struct Scenario {
    name: String,
    steps: Vec<Step>,
    teardown: Vec<Step>,
    debug_hints: Vec<String>,
}

impl Scenario {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            teardown: Vec::new(),
            debug_hints: Vec::new(),
        }
    }

    /// Append a step to the ordered sequence
    #[must_use]
    pub fn step<F, Fut>(mut self, name: &str, phase: Phase, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.steps.push(Step {
            name: name.to_string(),
            phase,
            action: Box::new(move || Box::pin(action())),
        });
        self
    }

    /// Append a teardown step
    ///
    /// Teardown runs after the sequence whatever its result, and is not
    /// interrupted by cancellation. Teardown steps in [`Phase::Verify`] only
    /// run when the whole sequence passed.
    #[must_use]
    pub fn teardown<F, Fut>(mut self, name: &str, phase: Phase, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        self.teardown.push(Step {
            name: name.to_string(),
            phase,
            action: Box::new(move || Box::pin(action())),
        });
        self
    }

    /// Command to suggest in the report if the run fails
    #[must_use]
    pub fn debug_hint(mut self, hint: impl Into<String>) -> Self {
        self.debug_hints.push(hint.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step names in execution order, teardown last
    pub fn step_names(&self) -> Vec<&str> {
        self.steps
            .iter()
            .chain(&self.teardown)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Run every step, then teardown
    ///
    /// Never returns early: the report carries every step's status and the
    /// aggregate outcome.
    pub async fn run(self, cancel: &CancellationToken) -> ScenarioReport {
        let mut report = ScenarioReport::new(&self.name);
        report.debug_hints = self.debug_hints;
        info!(scenario = %self.name, steps = self.steps.len(), "Starting scenario");

        let mut halted = false;
        for step in self.steps {
            if halted {
                report.record(step.skipped(false));
                continue;
            }

            info!(step = %step.name, phase = %step.phase, "Running step");
            let start = Instant::now();
            let Step {
                name,
                phase,
                action,
            } = step;

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = action() => Some(result),
            };

            let status = match result {
                Some(Ok(())) => {
                    info!(step = %name, elapsed = ?start.elapsed(), "Step passed");
                    StepStatus::Passed
                }
                Some(Err(e)) => {
                    error!(step = %name, error = %e, "Step failed");
                    halted = true;
                    StepStatus::Failed(e.to_string())
                }
                None => {
                    warn!(step = %name, "Cancelled");
                    halted = true;
                    StepStatus::Cancelled
                }
            };
            report.record(StepRecord {
                name,
                phase,
                status,
                elapsed: start.elapsed(),
                teardown: false,
            });
        }

        let sequence_passed = !halted;
        let mut teardown_failed = false;
        for step in self.teardown {
            let skip = teardown_failed || (step.phase == Phase::Verify && !sequence_passed);
            if skip {
                report.record(step.skipped(true));
                continue;
            }

            info!(step = %step.name, phase = %step.phase, "Running teardown");
            let start = Instant::now();
            let Step {
                name,
                phase,
                action,
            } = step;
            let status = match action().await {
                Ok(()) => StepStatus::Passed,
                Err(e) => {
                    error!(step = %name, error = %e, "Teardown step failed");
                    teardown_failed = true;
                    StepStatus::Failed(e.to_string())
                }
            };
            report.record(StepRecord {
                name,
                phase,
                status,
                elapsed: start.elapsed(),
                teardown: true,
            });
        }

        let outcome = report.outcome();
        info!(scenario = %report.scenario, outcome = %outcome, "Scenario finished");
        report
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("teardown", &self.teardown.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Outcome;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<&'static str>>>;

    type BoxedStep = Pin<Box<dyn Future<Output = Result<(), StepError>> + Send>>;

    fn logging(log: &Log, name: &'static str) -> impl FnOnce() -> BoxedStep {
        let log = log.clone();
        move || {
            Box::pin(async move {
                log.lock().unwrap().push(name);
                Ok(())
            })
        }
    }

    fn failing(log: &Log, name: &'static str) -> impl FnOnce() -> BoxedStep {
        let log = log.clone();
        move || {
            Box::pin(async move {
                log.lock().unwrap().push(name);
                Err(StepError::Precondition(format!("{name} broke")))
            })
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let log: Log = Arc::default();
        let report = Scenario::new("ordered")
            .step("first", Phase::Precheck, logging(&log, "first"))
            .step("second", Phase::Deploy, logging(&log, "second"))
            .teardown("cleanup", Phase::Teardown, logging(&log, "cleanup"))
            .step("third", Phase::Verify, logging(&log, "third"))
            .run(&CancellationToken::new())
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third", "cleanup"]);
        assert_eq!(report.outcome(), Outcome::Passed);
        assert_eq!(report.executed(), vec!["first", "second", "third", "cleanup"]);
    }

    #[tokio::test]
    async fn test_failure_skips_rest_but_runs_teardown() {
        let log: Log = Arc::default();
        let report = Scenario::new("failing")
            .step("first", Phase::Precheck, logging(&log, "first"))
            .step("second", Phase::Deploy, failing(&log, "second"))
            .step("third", Phase::Verify, logging(&log, "third"))
            .teardown("cleanup", Phase::Teardown, logging(&log, "cleanup"))
            .run(&CancellationToken::new())
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "cleanup"]);
        assert_eq!(report.records[2].status, StepStatus::Skipped);
        match report.outcome() {
            Outcome::Failed {
                step,
                phase,
                reason,
            } => {
                assert_eq!(step, "second");
                assert_eq!(phase, Phase::Deploy);
                assert!(reason.contains("second broke"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_teardown_verify_only_after_success() {
        let log: Log = Arc::default();
        let report = Scenario::new("failing")
            .step("verify", Phase::Verify, failing(&log, "verify"))
            .teardown("uninstall", Phase::Teardown, logging(&log, "uninstall"))
            .teardown("label removed", Phase::Verify, logging(&log, "label removed"))
            .run(&CancellationToken::new())
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["verify", "uninstall"]);
        assert_eq!(report.records[2].status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_teardown_failure_is_cleanup_failure() {
        let log: Log = Arc::default();
        let report = Scenario::new("leaky")
            .step("verify", Phase::Verify, logging(&log, "verify"))
            .teardown("uninstall", Phase::Teardown, failing(&log, "uninstall"))
            .teardown("label removed", Phase::Verify, logging(&log, "label removed"))
            .run(&CancellationToken::new())
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["verify", "uninstall"]);
        let outcome = report.outcome();
        assert!(matches!(outcome, Outcome::CleanupFailed { ref step, .. } if step == "uninstall"));
        assert_eq!(outcome.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_step_and_runs_teardown() {
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let report = Scenario::new("cancelled")
            .step("install", Phase::Deploy, logging(&log, "install"))
            .step("wait", Phase::Wait, || async {
                tokio::time::sleep(Duration::from_secs(120)).await;
                Ok(())
            })
            .step("verify", Phase::Verify, logging(&log, "verify"))
            .teardown("uninstall", Phase::Teardown, logging(&log, "uninstall"))
            .run(&cancel)
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["install", "uninstall"]);
        assert_eq!(
            report.outcome(),
            Outcome::Cancelled {
                step: "wait".to_string()
            }
        );
        assert_eq!(report.records[1].status, StepStatus::Cancelled);
        assert_eq!(report.records[2].status, StepStatus::Skipped);
        assert_eq!(report.records[3].status, StepStatus::Passed);
    }

    #[tokio::test]
    async fn test_already_cancelled_runs_nothing_but_teardown() {
        let log: Log = Arc::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = Scenario::new("cancelled")
            .step("first", Phase::Precheck, logging(&log, "first"))
            .teardown("cleanup", Phase::Teardown, logging(&log, "cleanup"))
            .run(&cancel)
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["cleanup"]);
        assert_eq!(report.outcome().exit_code(), 130);
    }

    #[test]
    fn test_step_names_and_debug() {
        let log: Log = Arc::default();
        let scenario = Scenario::new("named")
            .step("a", Phase::Precheck, logging(&log, "a"))
            .teardown("z", Phase::Teardown, logging(&log, "z"))
            .step("b", Phase::Deploy, logging(&log, "b"));

        assert_eq!(scenario.name(), "named");
        assert_eq!(scenario.step_names(), vec!["a", "b", "z"]);
        assert!(format!("{scenario:?}").contains("steps: 2"));
    }

    #[test]
    fn test_step_error_display() {
        assert_eq!(
            StepError::Precondition("label already set".to_string()).to_string(),
            "precondition not met: label already set"
        );
        assert_eq!(Phase::Teardown.to_string(), "teardown");
    }
}
