use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by the shared domain types.
#[derive(Debug, Error, PartialEq)]
pub enum CommonError {
    #[error("Unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Story {story_id} already belongs to epic {epic_id}")]
    StoryInOtherEpic { story_id: String, epic_id: String },

    #[error("Epic {epic_id} not found")]
    UnknownEpic { epic_id: String },

    #[error("Story {story_id} not found in epic {epic_id}")]
    UnknownStory { epic_id: String, story_id: String },
}

/// Closed classification set for task failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Billing,
    RateLimit,
    Timeout,
    Auth,
    MergeConflict,
    PushRejected,
    BranchMissing,
    BuildFailure,
    TestFailure,
    LintFailure,
    Validation,
    FileNotFound,
    Permission,
    Network,
    Memory,
    ContextOverflow,
    Parse,
    DependencyMissing,
    Runtime,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Billing => "billing",
            ErrorCode::RateLimit => "rate_limit",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Auth => "auth",
            ErrorCode::MergeConflict => "merge_conflict",
            ErrorCode::PushRejected => "push_rejected",
            ErrorCode::BranchMissing => "branch_missing",
            ErrorCode::BuildFailure => "build_failure",
            ErrorCode::TestFailure => "test_failure",
            ErrorCode::LintFailure => "lint_failure",
            ErrorCode::Validation => "validation",
            ErrorCode::FileNotFound => "file_not_found",
            ErrorCode::Permission => "permission",
            ErrorCode::Network => "network",
            ErrorCode::Memory => "memory",
            ErrorCode::ContextOverflow => "context_overflow",
            ErrorCode::Parse => "parse",
            ErrorCode::DependencyMissing => "dependency_missing",
            ErrorCode::Runtime => "runtime",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
        }
    }
}

/// A classified failure with a diagnosis and remediation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedError {
    pub id: Uuid,
    pub phase: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub hypothesis: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub suggested_fixes: Vec<String>,
    pub severity: Severity,
    pub recoverable: bool,
    #[serde(default)]
    pub resolved: bool,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_serde_matches_as_str() {
        for code in [
            ErrorCode::RateLimit,
            ErrorCode::ContextOverflow,
            ErrorCode::DependencyMissing,
            ErrorCode::Unknown,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn severity_orders_critical_first() {
        assert!(Severity::Critical < Severity::High);
        assert!(Severity::Medium < Severity::Low);
    }

    #[test]
    fn common_error_messages_carry_ids() {
        let err = CommonError::StoryInOtherEpic {
            story_id: "s-1".into(),
            epic_id: "api".into(),
        };
        assert!(err.to_string().contains("s-1"));
        assert!(err.to_string().contains("api"));
    }
}
