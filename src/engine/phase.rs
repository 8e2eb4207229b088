//! What a phase body sees while it runs.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anvil_common::{
    AgentExecutor, AgentRequest, AgentResponse, EventType, PhaseType, phase_key,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::attempt::{AttemptOutcome, Violation};
use crate::config::PhaseSettings;
use crate::control::{ControlSignal, TaskControl};
use crate::events::{self, EventLog};
use crate::memory::ExecutionMemoryStore;
use crate::sandbox::SandboxManager;
use crate::scm::SourceControl;

/// One phase of the pipeline. Bodies are stateless; everything they touch
/// comes through the [`PhaseContext`].
#[async_trait]
pub trait PhaseBody: Send + Sync {
    fn phase_type(&self) -> PhaseType;

    /// Run one attempt. A retry calls this again with
    /// [`PhaseContext::feedback`] set to the previous violation.
    async fn attempt(&self, ctx: &PhaseContext<'_>) -> AttemptOutcome;
}

/// Collaborators shared by every phase of an engine.
#[derive(Clone)]
pub struct PhaseServices {
    pub store: Arc<ExecutionMemoryStore>,
    pub events: Arc<dyn EventLog>,
    pub sandboxes: Arc<SandboxManager>,
    pub executor: Arc<dyn AgentExecutor>,
    pub scm: Arc<dyn SourceControl>,
    pub control: Arc<dyn TaskControl>,
    pub max_parallel_stories: usize,
    pub agent_timeout: Duration,
}

/// Spend of one phase run across all of its attempts.
#[derive(Debug, Default)]
pub struct CostMeter {
    inner: Mutex<(f64, u64)>,
}

impl CostMeter {
    pub fn record(&self, cost: f64, tokens: u64) {
        if let Ok(mut spent) = self.inner.lock() {
            spent.0 += cost;
            spent.1 += tokens;
        }
    }

    /// `(cost, tokens)` so far.
    pub fn totals(&self) -> (f64, u64) {
        self.inner.lock().map(|s| *s).unwrap_or_default()
    }
}

pub struct PhaseContext<'a> {
    pub task_id: &'a str,
    pub description: &'a str,
    pub phase: PhaseType,
    /// Set when the engine runs a story-scoped phase once per epic.
    pub epic_id: Option<&'a str>,
    pub attempt: u32,
    pub feedback: Option<Violation>,
    pub settings: &'a PhaseSettings,
    pub services: &'a PhaseServices,
    pub meter: &'a CostMeter,
}

impl PhaseContext<'_> {
    pub fn key(&self) -> String {
        phase_key(self.phase, self.epic_id)
    }

    pub fn store(&self) -> &ExecutionMemoryStore {
        &self.services.store
    }

    /// Whether the phase should stop dispatching new work.
    pub fn control_signal(&self) -> ControlSignal {
        self.services.control.check(self.task_id)
    }

    /// Feedback from the previous attempt, ready to append to a prompt.
    pub fn feedback_text(&self) -> Option<String> {
        self.feedback.as_ref().map(Violation::to_feedback)
    }

    /// Base request for an agent call in this phase. Callers fill in the
    /// workspace and sandbox when the call is bound to an environment.
    pub fn request(&self, agent_id: &str, label: &str, prompt: String) -> AgentRequest {
        AgentRequest {
            agent_id: agent_id.to_string(),
            prompt,
            workspace_path: self.services.store.task_dir(self.task_id),
            task_id: self.task_id.to_string(),
            label: label.to_string(),
            timeout: Some(self.services.agent_timeout),
            ..Default::default()
        }
    }

    /// Call the agent and charge its spend to this phase.
    pub async fn run_agent(&self, request: AgentRequest) -> Result<AgentResponse> {
        let label = request.label.clone();
        let response = self.services.executor.execute(request).await?;
        self.meter
            .record(response.cost, response.token_usage.total());
        debug!(
            task_id = %self.task_id,
            phase = %self.key(),
            agent = %label,
            cost = response.cost,
            tokens = response.token_usage.total(),
            "Agent call finished"
        );
        Ok(response)
    }

    pub async fn emit<P: Serialize + Sync>(&self, event_type: EventType, agent: &str, payload: &P) {
        events::emit(
            self.services.events.as_ref(),
            self.task_id,
            event_type,
            agent,
            payload,
        )
        .await;
    }
}
