//! Single-call phases: planning and integration.

use std::sync::LazyLock;

use anvil_common::{PhaseType, phase_key};
use async_trait::async_trait;
use regex::Regex;
use tracing::{info, warn};

use super::{agent_failure_outcome, load_map, prompts};
use crate::engine::{AttemptOutcome, PhaseBody, PhaseContext, PhaseOutput, Violation, ViolationCode};

/// `<epic id>: <url ending in /pull/<n>>` lines in integration output.
static PULL_REQUEST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*[-*]?\s*`?([A-Za-z0-9._/-]+)`?\s*:\s*(https?://\S+/pull/\d+)")
        .expect("valid regex")
});

/// One agent call whose output is the phase output.
#[derive(Debug, Clone, Copy)]
pub struct AgentPhase {
    phase: PhaseType,
}

impl AgentPhase {
    pub fn planning() -> Self {
        Self {
            phase: PhaseType::Planning,
        }
    }

    pub fn integration() -> Self {
        Self {
            phase: PhaseType::Integration,
        }
    }

    fn agent_id(&self) -> &'static str {
        match self.phase {
            PhaseType::Integration => "integrator",
            _ => "planner",
        }
    }
}

/// Pull request URLs by (unnormalized) epic id, in output order.
pub fn parse_pull_requests(output: &str) -> Vec<(String, String)> {
    PULL_REQUEST_LINE
        .captures_iter(output)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

#[async_trait]
impl PhaseBody for AgentPhase {
    fn phase_type(&self) -> PhaseType {
        self.phase
    }

    async fn attempt(&self, ctx: &PhaseContext<'_>) -> AttemptOutcome {
        let feedback = ctx.feedback_text();
        let map = match load_map(ctx).await {
            Ok(map) => map,
            Err(outcome) => return outcome,
        };

        let prompt = match self.phase {
            PhaseType::Integration => {
                prompts::build_integration_prompt(ctx.description, map.epics(), feedback.as_deref())
            }
            _ => prompts::build_planning_prompt(ctx.description, feedback.as_deref()),
        };

        let request = ctx.request(self.agent_id(), self.phase.as_str(), prompt);
        let response = match ctx.run_agent(request).await {
            Ok(response) => response,
            Err(e) => return agent_failure_outcome(e),
        };

        if response.output.trim().is_empty() {
            return AttemptOutcome::RetryableViolation(Violation::new(
                ViolationCode::IncompleteOutput,
                format!("The {} agent returned no output", self.phase),
            ));
        }

        if self.phase == PhaseType::Integration {
            let pulls = parse_pull_requests(&response.output);
            if pulls.is_empty() && !map.epics().is_empty() {
                warn!(task_id = %ctx.task_id, "Integration output named no pull requests");
            }
            let recorded = ctx
                .store()
                .update(ctx.task_id, |map| {
                    let mut recorded = 0;
                    for (epic_id, url) in &pulls {
                        if let Some(epic) = map.epic_mut(epic_id) {
                            epic.pull_request = Some(url.clone());
                            recorded += 1;
                        }
                    }
                    Ok(recorded)
                })
                .await;
            match recorded {
                Ok(n) => info!(
                    task_id = %ctx.task_id,
                    phase = %phase_key(self.phase, None),
                    pull_requests = n,
                    "Recorded pull requests"
                ),
                Err(e) => return AttemptOutcome::Fatal(e.into()),
            }
        }

        AttemptOutcome::Success(PhaseOutput::text(response.output))
    }
}
