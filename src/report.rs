//! Scenario results
//!
//! Collects one record per step and reduces them to a single [`Outcome`]
//! that decides the process exit code.

use std::fmt;
use std::time::Duration;

use crate::scenario::Phase;

const LINE_WIDTH: usize = 80;
const HEAVY_LINE: &str = "━";
const LIGHT_LINE: &str = "─";

/// What happened to one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Passed,
    Failed(String),
    /// Never executed because an earlier step failed or the run was cancelled
    Skipped,
    /// Interrupted by cancellation while running
    Cancelled,
}

/// Result of one step
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub name: String,
    pub phase: Phase,
    pub status: StepStatus,
    pub elapsed: Duration,
    /// Registered as teardown rather than as part of the ordered sequence
    pub teardown: bool,
}

/// Aggregate result of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    /// A step of the ordered sequence, or a post-teardown check, failed
    Failed {
        step: String,
        phase: Phase,
        reason: String,
    },
    /// Verification passed but teardown did not; resources may be leaked
    CleanupFailed { step: String, reason: String },
    Cancelled { step: String },
}

impl Outcome {
    /// Process exit code for this outcome
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Passed => 0,
            Self::Failed { .. } => 1,
            Self::CleanupFailed { .. } => 2,
            Self::Cancelled { .. } => 130,
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "PASSED"),
            Self::Failed {
                step,
                phase,
                reason,
            } => write!(f, "FAILED at {phase} step '{step}': {reason}"),
            Self::CleanupFailed { step, reason } => {
                write!(f, "CLEANUP FAILED at '{step}': {reason}")
            }
            Self::Cancelled { step } => write!(f, "CANCELLED during '{step}'"),
        }
    }
}

/// Step-by-step record of one scenario run
#[derive(Debug, Clone, Default)]
pub struct ScenarioReport {
    pub scenario: String,
    pub records: Vec<StepRecord>,
    /// Commands worth running by hand when the run fails
    pub debug_hints: Vec<String>,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            records: Vec::new(),
            debug_hints: Vec::new(),
        }
    }

    pub fn record(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    /// Reduce the records to one outcome
    ///
    /// Cancellation wins, then the first failure of the ordered sequence,
    /// then a failed post-teardown verification, then any other teardown
    /// failure.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if let Some(r) = self
            .records
            .iter()
            .find(|r| r.status == StepStatus::Cancelled)
        {
            return Outcome::Cancelled {
                step: r.name.clone(),
            };
        }

        let failure = |teardown: bool, verify_only: bool| {
            self.records.iter().find_map(|r| match &r.status {
                StepStatus::Failed(reason)
                    if r.teardown == teardown && (!verify_only || r.phase == Phase::Verify) =>
                {
                    Some((r, reason.clone()))
                }
                _ => None,
            })
        };

        if let Some((r, reason)) = failure(false, false).or_else(|| failure(true, true)) {
            return Outcome::Failed {
                step: r.name.clone(),
                phase: r.phase,
                reason,
            };
        }

        if let Some((r, reason)) = failure(true, false) {
            return Outcome::CleanupFailed {
                step: r.name.clone(),
                reason,
            };
        }

        Outcome::Passed
    }

    /// Names of the steps that actually ran, in order
    #[must_use]
    pub fn executed(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.status != StepStatus::Skipped)
            .map(|r| r.name.as_str())
            .collect()
    }

    fn heavy_line() -> String {
        HEAVY_LINE.repeat(LINE_WIDTH)
    }

    fn section_header(title: &str) -> String {
        let title_with_spaces = format!(" {title} ");
        let remaining = LINE_WIDTH.saturating_sub(title_with_spaces.chars().count() + 3);
        format!(
            "{}{}{}",
            LIGHT_LINE.repeat(3),
            title_with_spaces,
            LIGHT_LINE.repeat(remaining)
        )
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = self.outcome();

        writeln!(f)?;
        writeln!(f, "{}", Self::heavy_line())?;
        writeln!(f, "  SCENARIO {}: {}", outcome_word(&outcome), self.scenario)?;
        writeln!(f, "{}", Self::heavy_line())?;

        writeln!(f)?;
        writeln!(f, "{}", Self::section_header("Steps"))?;
        writeln!(f)?;
        for (i, record) in self.records.iter().enumerate() {
            let (mark, detail) = match &record.status {
                StepStatus::Passed => ("✓", String::new()),
                StepStatus::Failed(reason) => ("✗", format!("\n       {reason}")),
                StepStatus::Skipped => ("-", " (skipped)".to_string()),
                StepStatus::Cancelled => ("!", " (cancelled)".to_string()),
            };
            let teardown = if record.teardown { " [teardown]" } else { "" };
            writeln!(
                f,
                "  {:>2}. {} {:9} {}{} ({:.1}s){}",
                i + 1,
                mark,
                record.phase.to_string(),
                record.name,
                teardown,
                record.elapsed.as_secs_f64(),
                detail
            )?;
        }

        writeln!(f)?;
        writeln!(f, "  Result: {outcome}")?;

        if !outcome.passed() && !self.debug_hints.is_empty() {
            writeln!(f)?;
            writeln!(f, "{}", Self::section_header("Debug"))?;
            writeln!(f)?;
            for hint in &self.debug_hints {
                writeln!(f, "  {hint}")?;
            }
        }

        writeln!(f)?;
        write!(f, "{}", Self::heavy_line())
    }
}

fn outcome_word(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Passed => "PASSED",
        Outcome::Failed { .. } => "FAILED",
        Outcome::CleanupFailed { .. } => "CLEANUP FAILED",
        Outcome::Cancelled { .. } => "CANCELLED",
    }
}
