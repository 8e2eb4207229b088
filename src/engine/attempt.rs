//! Bounded retry of phase attempts.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What a phase body produced on success. Spend is metered separately by
/// the phase context, so failed attempts are charged too.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutput {
    pub output: String,
}

impl PhaseOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    DuplicateWorkerAssignment,
    FileOverlap,
    InvalidPlan,
    IncompleteOutput,
    TransientFailure,
}

impl ViolationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationCode::DuplicateWorkerAssignment => "duplicate_worker_assignment",
            ViolationCode::FileOverlap => "file_overlap",
            ViolationCode::InvalidPlan => "invalid_plan",
            ViolationCode::IncompleteOutput => "incomplete_output",
            ViolationCode::TransientFailure => "transient_failure",
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured, correctable problem with an attempt's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: ViolationCode,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl Violation {
    pub fn new(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    /// Text handed to the next attempt so it can correct the problem.
    pub fn to_feedback(&self) -> String {
        let mut out = format!(
            "The previous attempt was rejected ({}): {}",
            self.code, self.message
        );
        for detail in &self.details {
            out.push_str("\n- ");
            out.push_str(detail);
        }
        out
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if !self.details.is_empty() {
            write!(f, " [{}]", self.details.join("; "))?;
        }
        Ok(())
    }
}

/// Result of a single attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(PhaseOutput),
    RetryableViolation(Violation),
    Fatal(anyhow::Error),
}

#[derive(Debug)]
pub enum AttemptFailure {
    Fatal(anyhow::Error),
    /// Every attempt ended in a violation; carries the last one.
    Exhausted(Violation),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Fatal(e) => write!(f, "{e:#}"),
            AttemptFailure::Exhausted(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug)]
pub struct AttemptReport {
    pub attempts: u32,
    pub result: Result<PhaseOutput, AttemptFailure>,
}

/// Call `attempt` until it succeeds, fails fatally, or `max_attempts`
/// violations have been reported. Attempt numbers start at 1; each retry
/// receives the previous violation as feedback.
pub async fn run_attempts<F, Fut>(label: &str, max_attempts: u32, mut attempt: F) -> AttemptReport
where
    F: FnMut(u32, Option<Violation>) -> Fut,
    Fut: Future<Output = AttemptOutcome>,
{
    let max_attempts = max_attempts.max(1);
    let mut feedback = None;
    let mut n = 0;

    loop {
        n += 1;
        match attempt(n, feedback.take()).await {
            AttemptOutcome::Success(output) => {
                return AttemptReport {
                    attempts: n,
                    result: Ok(output),
                };
            }
            AttemptOutcome::Fatal(e) => {
                return AttemptReport {
                    attempts: n,
                    result: Err(AttemptFailure::Fatal(e)),
                };
            }
            AttemptOutcome::RetryableViolation(violation) => {
                if n == max_attempts {
                    warn!(phase = %label, attempts = n, violation = %violation, "Retry ceiling reached");
                    return AttemptReport {
                        attempts: n,
                        result: Err(AttemptFailure::Exhausted(violation)),
                    };
                }
                info!(phase = %label, attempt = n, violation = %violation, "Retrying after violation");
                feedback = Some(violation);
            }
        }
    }
}
