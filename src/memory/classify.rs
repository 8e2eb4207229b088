//! Rule-based failure classification.
//!
//! Rules are tried in order and the first match wins, so specific causes
//! (billing, auth, merge conflicts) sit ahead of broad ones (runtime).

use std::sync::LazyLock;

use anvil_common::{DetailedError, ErrorCode, Severity};
use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::util::truncate_chars;

const MAX_ERROR_LINE: usize = 200;
const MAX_EVIDENCE_LINE: usize = 160;

static RULES: LazyLock<Vec<(ErrorCode, Regex)>> = LazyLock::new(|| {
    [
        (
            ErrorCode::Billing,
            r"(?i)(credit balance|billing|budget ceiling|payment required|insufficient (funds|credits)|\b402\b)",
        ),
        (
            ErrorCode::Auth,
            r"(?i)(unauthori[sz]ed|authentication (failed|error)|invalid (api )?key|\b401\b|not logged in|bad credentials)",
        ),
        (
            ErrorCode::RateLimit,
            r"(?i)(rate.?limit|too many requests|\b429\b|overloaded)",
        ),
        (
            ErrorCode::ContextOverflow,
            r"(?i)(context (window|length)|prompt is too long|maximum context|too many tokens)",
        ),
        (
            ErrorCode::Memory,
            r"(?i)(out of memory|\boom\b|heap out of memory|cannot allocate memory|exit code 137)",
        ),
        (
            ErrorCode::Timeout,
            r"(?i)(timed? ?out|deadline exceeded|etimedout)",
        ),
        (
            ErrorCode::MergeConflict,
            r"(?i)(merge conflict|automatic merge failed|conflict \((content|add/add|modify/delete)\))",
        ),
        (
            ErrorCode::PushRejected,
            r"(?i)(\[rejected\]|push.*rejected|failed to push|non-fast-forward)",
        ),
        (
            ErrorCode::BranchMissing,
            r"(?i)(branch .* not found|couldn't find remote ref|unknown revision|not a valid (object|branch) name|invalid reference)",
        ),
        (
            ErrorCode::DependencyMissing,
            r"(?i)(cannot find module|module not found|modulenotfounderror|no such package|unresolved import|command not found)",
        ),
        (
            ErrorCode::BuildFailure,
            r"(?i)(build failed|compilation failed|could not compile|error\[e\d+\]|cannot find symbol)",
        ),
        (
            ErrorCode::TestFailure,
            r"(?i)(tests? failed|failing tests?|assertion failed|test result: failed|\d+ failed)",
        ),
        (
            ErrorCode::LintFailure,
            r"(?i)(eslint|clippy|prettier|rubocop|lint).*(error|fail|warning)",
        ),
        (
            ErrorCode::Parse,
            r"(?i)(parse error|failed to parse|unexpected token|invalid json|syntax error)",
        ),
        (
            ErrorCode::FileNotFound,
            r"(?i)(no such file|enoent|file not found|path does not exist)",
        ),
        (
            ErrorCode::Permission,
            r"(?i)(permission denied|eacces|eperm|operation not permitted|read-only file system)",
        ),
        (
            ErrorCode::Network,
            r"(?i)(econnrefused|econnreset|connection (refused|reset)|network (is )?unreachable|could not resolve host|socket hang up)",
        ),
        (
            ErrorCode::Validation,
            r"(?i)(validation (failed|error)|invalid (input|plan|argument|request)|overlapping files|already assigned)",
        ),
        (
            ErrorCode::Runtime,
            r"(?i)(panicked at|segmentation fault|uncaught exception|runtime error|stack overflow|null pointer)",
        ),
    ]
    .into_iter()
    .filter_map(|(code, pattern)| Regex::new(pattern).ok().map(|re| (code, re)))
    .collect()
});

struct Diagnosis {
    hypothesis: &'static str,
    fixes: &'static [&'static str],
    severity: Severity,
    recoverable: bool,
}

fn diagnosis(code: ErrorCode) -> Diagnosis {
    use ErrorCode::*;
    let (hypothesis, fixes, severity, recoverable): (&str, &[&str], Severity, bool) = match code {
        Billing => (
            "The agent provider rejected the call for billing reasons.",
            &["Top up the account credit balance", "Check the billing plan limits"],
            Severity::Critical,
            false,
        ),
        Auth => (
            "Credentials for the agent provider or a git remote are missing or invalid.",
            &["Re-authenticate the agent CLI", "Verify API keys and git credentials"],
            Severity::Critical,
            false,
        ),
        RateLimit => (
            "The provider throttled requests; the task is sending calls too fast.",
            &["Wait and resume the task", "Lower engine.max_parallel_stories"],
            Severity::Medium,
            true,
        ),
        ContextOverflow => (
            "The prompt plus attachments exceeded the model's context window.",
            &["Split the story into smaller stories", "Attach fewer files"],
            Severity::High,
            true,
        ),
        Memory => (
            "A process in the sandbox ran out of memory.",
            &["Raise sandbox.memory", "Reduce parallel work inside the sandbox"],
            Severity::High,
            true,
        ),
        Timeout => (
            "An agent call or sandbox command exceeded its time limit.",
            &["Raise engine.agent_timeout_secs", "Break the work into smaller stories"],
            Severity::Medium,
            true,
        ),
        MergeConflict => (
            "Two stories changed the same lines and could not be merged automatically.",
            &["Resolve the conflict on the epic branch", "Tighten story file ownership"],
            Severity::High,
            true,
        ),
        PushRejected => (
            "The remote rejected the push, usually because the branch moved.",
            &["Rebase onto the remote branch", "Check branch protection rules"],
            Severity::High,
            true,
        ),
        BranchMissing => (
            "A branch the workflow expects does not exist.",
            &["Recreate the epic branch", "Check the target repository reference"],
            Severity::High,
            true,
        ),
        DependencyMissing => (
            "A required package or tool is not installed in the sandbox.",
            &["Add the dependency to the project manifest", "Use a sandbox image with the tool"],
            Severity::Medium,
            true,
        ),
        BuildFailure => (
            "The generated code does not compile.",
            &["Inspect the compiler output", "Re-run the story with the build errors as feedback"],
            Severity::High,
            true,
        ),
        TestFailure => (
            "The generated code compiles but tests fail.",
            &["Inspect failing tests", "Re-run the story with test output as feedback"],
            Severity::Medium,
            true,
        ),
        LintFailure => (
            "Lint checks rejected the generated code.",
            &["Run the formatter and linter locally", "Relax lint rules for generated code"],
            Severity::Low,
            true,
        ),
        Parse => (
            "Agent output or a file could not be parsed in the expected format.",
            &["Inspect the raw agent output", "Retry the phase"],
            Severity::Medium,
            true,
        ),
        FileNotFound => (
            "A file or directory referenced by the work does not exist.",
            &["Check story file paths", "Verify the workspace was cloned correctly"],
            Severity::Medium,
            true,
        ),
        Permission => (
            "The process lacks permission for a file or operation.",
            &["Check workspace ownership", "Check sandbox volume mounts"],
            Severity::High,
            false,
        ),
        Network => (
            "A network connection failed.",
            &["Check connectivity and DNS", "Verify peer services are running"],
            Severity::Medium,
            true,
        ),
        Validation => (
            "The produced plan or input violated a validation rule.",
            &["Review the violation details", "Adjust the plan and retry"],
            Severity::Medium,
            true,
        ),
        Runtime => (
            "A program crashed at runtime.",
            &["Inspect the stack trace", "Reproduce inside the sandbox"],
            Severity::High,
            true,
        ),
        Unknown => (
            "The failure did not match any known pattern.",
            &["Inspect the full error message and logs"],
            Severity::Medium,
            true,
        ),
    };
    Diagnosis {
        hypothesis,
        fixes,
        severity,
        recoverable,
    }
}

/// Error code for a message, `Unknown` when nothing matches.
pub fn classify_code(message: &str) -> ErrorCode {
    RULES
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(code, _)| *code)
        .unwrap_or(ErrorCode::Unknown)
}

/// Whether a failure is worth retrying without operator action.
pub fn is_transient(code: ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::RateLimit | ErrorCode::Timeout | ErrorCode::Network
    )
}

/// Build a [`DetailedError`] for a failure message.
pub fn classify(phase: &str, message: &str) -> DetailedError {
    let matched = RULES
        .iter()
        .find_map(|(code, re)| re.find(message).map(|m| (*code, m.as_str().to_string())));
    let code = matched.as_ref().map(|(c, _)| *c).unwrap_or(ErrorCode::Unknown);
    let diag = diagnosis(code);

    let mut evidence = Vec::new();
    if let Some((_, hit)) = &matched {
        evidence.push(format!("matched \"{hit}\""));
        if let Some(line) = message.lines().find(|l| l.contains(hit.as_str())) {
            evidence.push(truncate_chars(line.trim(), MAX_EVIDENCE_LINE));
        }
    } else if let Some(line) = message.lines().find(|l| !l.trim().is_empty()) {
        evidence.push(truncate_chars(line.trim(), MAX_EVIDENCE_LINE));
    }

    DetailedError {
        id: Uuid::new_v4(),
        phase: phase.to_string(),
        error_code: code,
        message: message.to_string(),
        hypothesis: diag.hypothesis.to_string(),
        evidence,
        suggested_fixes: diag.fixes.iter().map(|s| s.to_string()).collect(),
        severity: diag.severity,
        recoverable: diag.recoverable,
        resolved: false,
        timestamp: Utc::now(),
    }
}

/// One-line form appended to the plain error list.
pub fn error_line(error: &DetailedError) -> String {
    let first = error.message.lines().next().unwrap_or_default();
    format!(
        "[{}] {}: {}",
        error.phase,
        error.error_code,
        truncate_chars(first, MAX_ERROR_LINE)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rule_compiles() {
        assert_eq!(RULES.len(), 19);
    }

    #[test]
    fn classifies_common_failures() {
        let cases = [
            ("Your credit balance is too low", ErrorCode::Billing),
            ("Budget ceiling $5.00 exceeded for phase review", ErrorCode::Billing),
            ("HTTP 429 Too Many Requests", ErrorCode::RateLimit),
            ("Error: 401 Unauthorized", ErrorCode::Auth),
            ("operation timed out after 1800s", ErrorCode::Timeout),
            ("CONFLICT (content): Merge conflict in src/a.rs", ErrorCode::MergeConflict),
            (" ! [rejected] main -> main (non-fast-forward)", ErrorCode::PushRejected),
            ("fatal: couldn't find remote ref epic/api", ErrorCode::BranchMissing),
            ("error[E0425]: cannot find value `x`", ErrorCode::BuildFailure),
            ("test result: FAILED. 3 passed; 1 failed", ErrorCode::TestFailure),
            ("eslint found 4 errors", ErrorCode::LintFailure),
            ("Error: Cannot find module 'express'", ErrorCode::DependencyMissing),
            ("ENOENT: no such file or directory", ErrorCode::FileNotFound),
            ("EACCES: permission denied", ErrorCode::Permission),
            ("connect ECONNREFUSED 127.0.0.1:5432", ErrorCode::Network),
            ("FATAL ERROR: JavaScript heap out of memory", ErrorCode::Memory),
            ("prompt is too long: 210000 tokens", ErrorCode::ContextOverflow),
            ("failed to parse team plan", ErrorCode::Parse),
            ("thread 'main' panicked at src/main.rs:3", ErrorCode::Runtime),
            ("validation failed: overlapping files", ErrorCode::Validation),
            ("something odd happened", ErrorCode::Unknown),
        ];
        for (message, expected) in cases {
            assert_eq!(classify_code(message), expected, "message: {message}");
        }
    }

    #[test]
    fn detailed_error_carries_diagnosis() {
        let err = classify("implementation", "git push failed\n ! [rejected] epic/api (fetch first)");
        assert_eq!(err.error_code, ErrorCode::PushRejected);
        assert_eq!(err.phase, "implementation");
        assert_eq!(err.severity, Severity::High);
        assert!(err.recoverable);
        assert!(!err.resolved);
        assert!(!err.suggested_fixes.is_empty());
        assert!(err.evidence[0].contains("failed to push") || err.evidence[0].contains("rejected"));
    }

    #[test]
    fn billing_and_auth_are_not_recoverable() {
        assert!(!classify("planning", "insufficient credits").recoverable);
        assert_eq!(classify("planning", "invalid api key").severity, Severity::Critical);
    }

    #[test]
    fn unknown_keeps_first_line_as_evidence() {
        let err = classify("review", "\n  weird thing\nmore");
        assert_eq!(err.error_code, ErrorCode::Unknown);
        assert_eq!(err.evidence, vec!["weird thing".to_string()]);
    }

    #[test]
    fn error_line_is_truncated_single_line() {
        let long = format!("{}\nsecond line", "x".repeat(500));
        let err = classify("planning", &long);
        let line = error_line(&err);
        assert!(line.starts_with("[planning] unknown: "));
        assert!(!line.contains('\n'));
        assert!(line.chars().count() < 240);
    }

    #[test]
    fn transient_codes() {
        assert!(is_transient(ErrorCode::RateLimit));
        assert!(is_transient(ErrorCode::Network));
        assert!(!is_transient(ErrorCode::Auth));
    }
}
