//! Default phase bodies.
//!
//! | phase          | body                 | agent       |
//! |----------------|----------------------|-------------|
//! | planning       | [`AgentPhase`]       | planner     |
//! | architecture   | [`ArchitecturePhase`]| architect   |
//! | implementation | [`ImplementationPhase`] | developer |
//! | review         | [`ReviewPhase`]      | judge       |
//! | integration    | [`AgentPhase`]       | integrator  |

pub mod agent;
pub mod architecture;
pub mod implementation;
pub mod prompts;
pub mod review;

use std::sync::Arc;

use anvil_common::{EpicExecution, ExecutionMap};

use crate::engine::{AttemptOutcome, PhaseBody, PhaseContext, Violation, ViolationCode};
use crate::memory::classify::{classify_code, is_transient};

pub use agent::AgentPhase;
pub use architecture::ArchitecturePhase;
pub use implementation::ImplementationPhase;
pub use review::ReviewPhase;

pub fn default_bodies() -> Vec<Arc<dyn PhaseBody>> {
    vec![
        Arc::new(AgentPhase::planning()),
        Arc::new(ArchitecturePhase),
        Arc::new(ImplementationPhase),
        Arc::new(ReviewPhase),
        Arc::new(AgentPhase::integration()),
    ]
}

/// Load the task's map, turning a missing map or a store failure into a
/// fatal attempt outcome.
pub(crate) async fn load_map(ctx: &PhaseContext<'_>) -> Result<ExecutionMap, AttemptOutcome> {
    match ctx.store().load(ctx.task_id).await {
        Ok(Some(map)) => Ok(map),
        Ok(None) => Err(AttemptOutcome::Fatal(anyhow::anyhow!(
            "Task {} has no execution map",
            ctx.task_id
        ))),
        Err(e) => Err(AttemptOutcome::Fatal(e.into())),
    }
}

/// Epics a story-scoped attempt works on: the context's epic, or all.
pub(crate) fn epics_in_scope<'m>(
    map: &'m ExecutionMap,
    ctx: &PhaseContext<'_>,
) -> Vec<&'m EpicExecution> {
    match ctx.epic_id {
        Some(epic_id) => map.epic(epic_id).into_iter().collect(),
        None => map.epics().iter().collect(),
    }
}

/// Branch an epic's stories merge into.
pub(crate) fn epic_branch(epic: &EpicExecution) -> String {
    epic.branch_name
        .clone()
        .unwrap_or_else(|| format!("epic/{}", epic.epic_id))
}

pub(crate) fn story_branch(story_id: &str) -> String {
    format!("story/{story_id}")
}

/// Environment key of one story: its own sandbox within the task.
pub(crate) fn story_repo_key(epic_id: &str, story_id: &str) -> String {
    anvil_common::ids::normalize_repo_key(&format!("{epic_id}-{story_id}"))
}

/// Outcome of an attempt whose stories failed with `(story id, error)`.
///
/// Retried only when every failure is transient; any other failure is fatal.
pub(crate) fn story_failures_outcome(failures: &[(String, String)]) -> AttemptOutcome {
    if let Some((story_id, error)) = failures
        .iter()
        .find(|(_, error)| !is_transient(classify_code(error)))
    {
        return AttemptOutcome::Fatal(anyhow::anyhow!("Story {story_id} failed: {error}"));
    }
    AttemptOutcome::RetryableViolation(
        Violation::new(
            ViolationCode::TransientFailure,
            format!("{} story(ies) hit transient failures", failures.len()),
        )
        .with_details(
            failures
                .iter()
                .map(|(id, error)| format!("{id}: {error}"))
                .collect(),
        ),
    )
}

/// Outcome of a failed agent call: transient failures (rate limits,
/// timeouts, network) go back to the retry loop, anything else is fatal.
pub(crate) fn agent_failure_outcome(error: anyhow::Error) -> AttemptOutcome {
    let message = format!("{error:#}");
    let code = classify_code(&message);
    if !is_transient(code) {
        return AttemptOutcome::Fatal(error);
    }
    AttemptOutcome::RetryableViolation(
        Violation::new(
            ViolationCode::TransientFailure,
            format!("Agent call failed ({code})"),
        )
        .with_details(vec![message]),
    )
}
