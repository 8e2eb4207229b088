//! The phase state machine.
//!
//! [`PhaseEngine::run`] walks the requested phases in pipeline order. For
//! each one it polls pause/cancel, asks [`SkipLogic`] whether the phase
//! already ran, checks the budget, honors approval gates, then runs the
//! registered [`PhaseBody`] through the bounded retry loop and persists the
//! result. In multi-team mode story-scoped phases run once per epic and the
//! task-level entry is completed when every epic is.

pub mod attempt;
pub mod phase;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anvil_common::{
    ErrorCode, EventType, PhaseCompletedPayload, PhaseStatus, PhaseType, TaskStatus, phase_key,
};
use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::budget::{BudgetDecision, BudgetGuard};
use crate::config::AnvilToml;
use crate::control::ControlSignal;
use crate::errors::EngineError;
use crate::events;
use crate::notify::{Notification, NotificationKind, Notifier, TracingNotifier};
use crate::skip::{SkipDecision, SkipLogic, SkipSource};
use crate::util::truncate_chars;

pub use attempt::{
    AttemptFailure, AttemptOutcome, AttemptReport, PhaseOutput, Violation, ViolationCode,
    run_attempts,
};
pub use phase::{CostMeter, PhaseBody, PhaseContext, PhaseServices};

/// Phase output kept in the execution map.
const OUTPUT_LIMIT: usize = 4000;

const ENGINE_AGENT: &str = "engine";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Every requested phase completed or was already complete.
    Completed,
    Failed {
        phase: PhaseType,
        error: String,
        error_code: ErrorCode,
    },
    Cancelled,
    Paused {
        phase: PhaseType,
    },
    AwaitingApproval {
        phase: PhaseType,
    },
}

enum Flow {
    Continue,
    Stop(TaskOutcome),
}

pub struct PhaseEngine {
    services: PhaseServices,
    config: AnvilToml,
    budget: Arc<BudgetGuard>,
    skip: SkipLogic,
    notifier: Arc<dyn Notifier>,
    bodies: HashMap<PhaseType, Arc<dyn PhaseBody>>,
}

impl PhaseEngine {
    pub fn new(config: &AnvilToml, services: PhaseServices) -> Self {
        let skip = SkipLogic::new(services.store.clone(), Some(services.events.clone()));
        Self {
            budget: Arc::new(BudgetGuard::new(
                config.budget.warn_ratio,
                config.budget.hard_stop,
            )),
            config: config.clone(),
            skip,
            notifier: Arc::new(TracingNotifier),
            bodies: HashMap::new(),
            services,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Share one budget counter between engines.
    pub fn with_budget(mut self, budget: Arc<BudgetGuard>) -> Self {
        self.budget = budget;
        self
    }

    /// Register the body for its phase, replacing any earlier one.
    pub fn with_body(mut self, body: Arc<dyn PhaseBody>) -> Self {
        self.bodies.insert(body.phase_type(), body);
        self
    }

    pub fn with_default_bodies(self) -> Self {
        crate::phases::default_bodies()
            .into_iter()
            .fold(self, |engine, body| engine.with_body(body))
    }

    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    pub fn services(&self) -> &PhaseServices {
        &self.services
    }

    /// Run `phases` (in pipeline order, whatever order they are given in)
    /// for a task. An empty `description` keeps the stored one.
    ///
    /// Store failures end the run with an error after the task's sandboxes
    /// are torn down; phase failures are reported as
    /// [`TaskOutcome::Failed`].
    pub async fn run(
        &self,
        task_id: &str,
        description: &str,
        phases: &[PhaseType],
    ) -> Result<TaskOutcome, EngineError> {
        match self.drive(task_id, description, phases).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Task run aborted");
                self.teardown(task_id).await;
                let marked = self
                    .services
                    .store
                    .update(task_id, |map| {
                        map.status = TaskStatus::Failed;
                        Ok(())
                    })
                    .await;
                if let Err(mark_err) = marked {
                    warn!(task_id = %task_id, error = %mark_err, "Could not mark aborted task failed");
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        task_id: &str,
        description: &str,
        phases: &[PhaseType],
    ) -> Result<TaskOutcome, EngineError> {
        let store = &self.services.store;
        let map = store.initialize(task_id, description).await?;
        let description = if description.is_empty() {
            map.description.clone()
        } else {
            description.to_string()
        };

        if let Err(e) = self.services.control.clear(task_id) {
            warn!(task_id = %task_id, error = %e, "Could not clear stale control signals");
        }
        self.budget.seed(task_id, map.total_cost);

        store
            .update(task_id, |map| {
                map.status = TaskStatus::Running;
                Ok(())
            })
            .await?;

        let requested: Vec<PhaseType> = PhaseType::ORDER
            .iter()
            .copied()
            .filter(|p| phases.contains(p))
            .collect();
        info!(
            task_id = %task_id,
            phases = ?requested,
            spent = map.total_cost,
            "Starting task run"
        );
        self.emit(
            task_id,
            EventType::TaskStarted,
            &json!({
                "id": Uuid::new_v4().to_string(),
                "phases": requested,
            }),
        )
        .await;

        for phase in requested {
            if let Flow::Stop(outcome) = self.run_phase(task_id, &description, phase).await? {
                return Ok(outcome);
            }
        }

        self.finish(task_id).await
    }

    async fn run_phase(
        &self,
        task_id: &str,
        description: &str,
        phase: PhaseType,
    ) -> Result<Flow, EngineError> {
        if let Some(flow) = self.check_control(task_id, phase).await? {
            return Ok(flow);
        }

        let body = self
            .bodies
            .get(&phase)
            .cloned()
            .ok_or_else(|| anyhow!("No phase body registered for {phase}"))?;

        if !(self.config.engine.multi_team && phase.is_story_scoped()) {
            return self
                .run_scope(task_id, description, phase, None, body.as_ref())
                .await;
        }

        let epics: Vec<String> = self
            .services
            .store
            .load(task_id)
            .await?
            .map(|map| map.epics().iter().map(|e| e.epic_id.clone()).collect())
            .unwrap_or_default();
        if epics.is_empty() {
            return self
                .run_scope(task_id, description, phase, None, body.as_ref())
                .await;
        }

        // A task-level completion from an earlier single-team run covers
        // every epic.
        if let SkipDecision::Skip(source) = self.skip.check(task_id, phase, None).await? {
            self.skipped(task_id, phase, None, source).await?;
            return Ok(Flow::Continue);
        }

        for (i, epic_id) in epics.iter().enumerate() {
            if i > 0
                && let Some(flow) = self.check_control(task_id, phase).await?
            {
                return Ok(flow);
            }
            if let Flow::Stop(outcome) = self
                .run_scope(task_id, description, phase, Some(epic_id), body.as_ref())
                .await?
            {
                return Ok(Flow::Stop(outcome));
            }
        }

        self.complete_rollup(task_id, phase, &epics).await?;
        Ok(Flow::Continue)
    }

    /// Skip, budget, approval, then the retry loop for one phase scope.
    async fn run_scope(
        &self,
        task_id: &str,
        description: &str,
        phase: PhaseType,
        epic_id: Option<&str>,
        body: &dyn PhaseBody,
    ) -> Result<Flow, EngineError> {
        let key = phase_key(phase, epic_id);
        let settings = self.config.phase_settings(phase);

        // Completed scopes are skipped before any budget verdict can touch them.
        if let SkipDecision::Skip(source) = self.skip.check(task_id, phase, epic_id).await? {
            self.skipped(task_id, phase, epic_id, source).await?;
            return Ok(Flow::Continue);
        }

        match self
            .budget
            .check(task_id, settings.estimated_cost, settings.ceiling)
        {
            BudgetDecision::Allow => {}
            BudgetDecision::Block { ceiling, .. } if self.budget.hard_stop() => {
                let err = EngineError::BudgetExceeded {
                    phase: key.clone(),
                    spent: self.budget.spent(task_id),
                    estimated: settings.estimated_cost,
                    ceiling,
                };
                return self
                    .fail(task_id, phase, epic_id, 0, err.to_string(), 0.0, 0)
                    .await;
            }
            decision => {
                let detail = budget_detail(&decision);
                warn!(task_id = %task_id, phase = %key, detail = %detail, "Budget warning");
                self.notifier
                    .notify(
                        &Notification::new(NotificationKind::BudgetWarning, task_id, &key)
                            .with_error(detail, Vec::new()),
                    )
                    .await;
            }
        }

        if settings.requires_approval {
            let approved = self
                .services
                .store
                .load(task_id)
                .await?
                .map(|map| map.is_approved(phase, epic_id) || map.is_approved(phase, None))
                .unwrap_or(false);
            if !approved {
                return self.await_approval(task_id, phase, epic_id).await;
            }
        }

        self.services
            .store
            .update(task_id, |map| {
                let entry = map.phase_entry(phase, epic_id);
                entry.status = PhaseStatus::InProgress;
                entry.started_at = Some(Utc::now());
                entry.error = None;
                map.current_phase = Some(phase);
                map.status = TaskStatus::Running;
                Ok(())
            })
            .await?;
        self.emit(
            task_id,
            EventType::PhaseStarted,
            &json!({
                "id": Uuid::new_v4().to_string(),
                "phase": phase,
                "epic_id": epic_id,
            }),
        )
        .await;
        self.notifier
            .notify(&Notification::new(NotificationKind::PhaseStart, task_id, &key))
            .await;

        let meter = CostMeter::default();
        let started = Instant::now();
        let report = run_attempts(&key, settings.max_attempts, |attempt, feedback| {
            let ctx = PhaseContext {
                task_id,
                description,
                phase,
                epic_id,
                attempt,
                feedback,
                settings: &settings,
                services: &self.services,
                meter: &meter,
            };
            async move { body.attempt(&ctx).await }
        })
        .await;

        let (cost, tokens) = meter.totals();
        self.budget.record(task_id, cost);

        match report.result {
            Ok(output) => {
                self.complete(task_id, phase, epic_id, report.attempts, &output, cost, tokens)
                    .await?;
                self.notifier
                    .notify(
                        &Notification::new(NotificationKind::PhaseComplete, task_id, &key)
                            .with_duration(started.elapsed()),
                    )
                    .await;
                Ok(Flow::Continue)
            }
            Err(AttemptFailure::Fatal(e)) if is_cancellation(&e) => {
                self.cancel(task_id, Some((phase, epic_id))).await
            }
            Err(failure) => {
                let message = match failure {
                    AttemptFailure::Exhausted(violation) => EngineError::RetriesExhausted {
                        phase: key.clone(),
                        attempts: report.attempts,
                        violation: violation.to_string(),
                    }
                    .to_string(),
                    AttemptFailure::Fatal(e) => format!("{e:#}"),
                };
                self.fail(task_id, phase, epic_id, report.attempts, message, cost, tokens)
                    .await
            }
        }
    }

    async fn check_control(
        &self,
        task_id: &str,
        phase: PhaseType,
    ) -> Result<Option<Flow>, EngineError> {
        match self.services.control.check(task_id) {
            ControlSignal::Continue => Ok(None),
            ControlSignal::Cancel => self.cancel(task_id, None).await.map(Some),
            ControlSignal::Pause => {
                self.services
                    .store
                    .update(task_id, |map| {
                        map.status = TaskStatus::Paused;
                        map.current_phase = Some(phase);
                        Ok(())
                    })
                    .await?;
                info!(task_id = %task_id, phase = %phase, "Task paused");
                Ok(Some(Flow::Stop(TaskOutcome::Paused { phase })))
            }
        }
    }

    async fn skipped(
        &self,
        task_id: &str,
        phase: PhaseType,
        epic_id: Option<&str>,
        source: SkipSource,
    ) -> Result<(), EngineError> {
        let key = phase_key(phase, epic_id);
        info!(task_id = %task_id, phase = %key, source = ?source, "Skipping completed phase");
        self.emit(
            task_id,
            EventType::PhaseSkipped,
            &json!({
                "id": Uuid::new_v4().to_string(),
                "phase": phase,
                "epic_id": epic_id,
                "source": source,
            }),
        )
        .await;
        if self.skip.restore_after_skip(task_id, phase).await? {
            info!(task_id = %task_id, phase = %key, "Restored plan from event log");
        }
        Ok(())
    }

    async fn await_approval(
        &self,
        task_id: &str,
        phase: PhaseType,
        epic_id: Option<&str>,
    ) -> Result<Flow, EngineError> {
        let key = phase_key(phase, epic_id);
        self.services
            .store
            .update(task_id, |map| {
                map.phase_entry(phase, epic_id).status = PhaseStatus::WaitingApproval;
                map.current_phase = Some(phase);
                map.status = TaskStatus::AwaitingApproval;
                Ok(())
            })
            .await?;
        self.emit(
            task_id,
            EventType::PhaseWaitingApproval,
            &json!({
                "id": Uuid::new_v4().to_string(),
                "phase": phase,
                "epic_id": epic_id,
            }),
        )
        .await;
        info!(task_id = %task_id, phase = %key, "Waiting for approval");
        Ok(Flow::Stop(TaskOutcome::AwaitingApproval { phase }))
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        task_id: &str,
        phase: PhaseType,
        epic_id: Option<&str>,
        attempts: u32,
        output: &PhaseOutput,
        cost: f64,
        tokens: u64,
    ) -> Result<(), EngineError> {
        let key = phase_key(phase, epic_id);
        let stored_output = truncate_chars(&output.output, OUTPUT_LIMIT);
        self.services
            .store
            .update(task_id, |map| {
                let entry = map.phase_entry(phase, epic_id);
                entry.status = PhaseStatus::Completed;
                entry.completed_at = Some(Utc::now());
                entry.attempts += attempts;
                entry.cost += cost;
                entry.error = None;
                entry.output = Some(stored_output);
                // Story-scoped spend is already attributed to stories.
                if phase.is_story_scoped() {
                    map.recompute_totals();
                } else {
                    map.add_overhead(cost, tokens);
                }
                Ok(())
            })
            .await?;

        self.emit(
            task_id,
            EventType::PhaseCompleted,
            &PhaseCompletedPayload {
                id: key.clone(),
                phase,
                epic_id: epic_id.map(str::to_string),
                cost,
            },
        )
        .await;

        let resolved = self
            .services
            .store
            .mark_errors_resolved(task_id, &key)
            .await?;
        info!(
            task_id = %task_id,
            phase = %key,
            attempts,
            cost,
            resolved_errors = resolved,
            "Phase completed"
        );
        Ok(())
    }

    /// Close the task-level entry of a phase that ran once per epic.
    async fn complete_rollup(
        &self,
        task_id: &str,
        phase: PhaseType,
        epics: &[String],
    ) -> Result<(), EngineError> {
        let cost = self
            .services
            .store
            .update(task_id, |map| {
                let cost: f64 = epics
                    .iter()
                    .filter_map(|e| map.phase(phase, Some(e)).map(|p| p.cost))
                    .sum();
                let entry = map.phase_entry(phase, None);
                entry.status = PhaseStatus::Completed;
                entry.completed_at = Some(Utc::now());
                entry.cost = cost;
                entry.error = None;
                Ok(cost)
            })
            .await?;
        self.emit(
            task_id,
            EventType::PhaseCompleted,
            &PhaseCompletedPayload {
                id: phase_key(phase, None),
                phase,
                epic_id: None,
                cost,
            },
        )
        .await;
        self.services
            .store
            .mark_errors_resolved(task_id, phase.as_str())
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        task_id: &str,
        phase: PhaseType,
        epic_id: Option<&str>,
        attempts: u32,
        message: String,
        cost: f64,
        tokens: u64,
    ) -> Result<Flow, EngineError> {
        let key = phase_key(phase, epic_id);
        let detailed = self
            .services
            .store
            .record_error(task_id, &key, &message)
            .await?;

        let stored_error = message.clone();
        self.services
            .store
            .update(task_id, |map| {
                let entry = map.phase_entry(phase, epic_id);
                if entry.status != PhaseStatus::Completed {
                    entry.status = PhaseStatus::Failed;
                }
                entry.attempts += attempts;
                entry.cost += cost;
                entry.error = Some(stored_error);
                if phase.is_story_scoped() {
                    map.recompute_totals();
                } else {
                    map.add_overhead(cost, tokens);
                }
                map.current_phase = Some(phase);
                map.status = TaskStatus::Failed;
                Ok(())
            })
            .await?;

        self.emit(
            task_id,
            EventType::PhaseFailed,
            &json!({
                "id": Uuid::new_v4().to_string(),
                "phase": phase,
                "epic_id": epic_id,
                "error": message,
                "error_code": detailed.error_code,
            }),
        )
        .await;
        self.notifier
            .notify(
                &Notification::new(NotificationKind::PhaseError, task_id, &key)
                    .with_error(message.clone(), detailed.suggested_fixes.clone()),
            )
            .await;

        let destroyed = self.teardown(task_id).await;
        error!(
            task_id = %task_id,
            phase = %key,
            error_code = %detailed.error_code.as_str(),
            environments_destroyed = destroyed,
            "Phase failed"
        );
        Ok(Flow::Stop(TaskOutcome::Failed {
            phase,
            error: message,
            error_code: detailed.error_code,
        }))
    }

    /// `interrupted` is the phase scope that was running, if any; it goes
    /// back to not-started so the next run picks it up.
    async fn cancel(
        &self,
        task_id: &str,
        interrupted: Option<(PhaseType, Option<&str>)>,
    ) -> Result<Flow, EngineError> {
        let destroyed = self.teardown(task_id).await;
        self.services
            .store
            .update(task_id, |map| {
                if let Some((phase, epic_id)) = interrupted {
                    let entry = map.phase_entry(phase, epic_id);
                    if entry.status == PhaseStatus::InProgress {
                        entry.status = PhaseStatus::NotStarted;
                    }
                }
                map.status = TaskStatus::Cancelled;
                Ok(())
            })
            .await?;
        self.emit(
            task_id,
            EventType::TaskCancelled,
            &json!({
                "id": Uuid::new_v4().to_string(),
                "environments_destroyed": destroyed,
            }),
        )
        .await;
        info!(task_id = %task_id, environments_destroyed = destroyed, "Task cancelled");
        Ok(Flow::Stop(TaskOutcome::Cancelled))
    }

    async fn finish(&self, task_id: &str) -> Result<TaskOutcome, EngineError> {
        let all_done = self
            .services
            .store
            .update(task_id, |map| {
                let all_done = map.completed_phases().len() == PhaseType::ORDER.len();
                map.status = if all_done {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Pending
                };
                map.current_phase = None;
                Ok(all_done)
            })
            .await?;

        if all_done {
            let total_cost = self
                .services
                .store
                .load(task_id)
                .await?
                .map(|m| m.total_cost)
                .unwrap_or_default();
            self.emit(
                task_id,
                EventType::TaskCompleted,
                &json!({
                    "id": Uuid::new_v4().to_string(),
                    "total_cost": total_cost,
                }),
            )
            .await;
            info!(task_id = %task_id, total_cost, "Task completed");
        }
        self.teardown(task_id).await;
        Ok(TaskOutcome::Completed)
    }

    /// Destroy the task's environments and drop its budget counter.
    async fn teardown(&self, task_id: &str) -> usize {
        let destroyed = self.services.sandboxes.destroy_all(task_id).await;
        self.budget.release(task_id);
        destroyed
    }

    async fn emit<P: Serialize + Sync>(&self, task_id: &str, event_type: EventType, payload: &P) {
        events::emit(
            self.services.events.as_ref(),
            task_id,
            event_type,
            ENGINE_AGENT,
            payload,
        )
        .await;
    }
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::Cancelled { .. })
    )
}

fn budget_detail(decision: &BudgetDecision) -> String {
    match decision {
        BudgetDecision::Allow => String::new(),
        BudgetDecision::Warn { projected, ceiling } => {
            format!("projected ${projected:.2} is close to the ${ceiling:.2} ceiling")
        }
        BudgetDecision::Block { projected, ceiling } => {
            format!("projected ${projected:.2} exceeds the ${ceiling:.2} ceiling; continuing")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::config::PhaseOverride;
    use crate::control::TaskControl;
    use crate::events::EventLog;
    use crate::notify::BroadcastNotifier;
    use crate::phases::AgentPhase;
    use crate::sandbox::EnvironmentRequest;
    use crate::testing::{Harness, reply};

    /// Returns queued outcomes in order, then succeeds.
    struct Scripted {
        phase: PhaseType,
        calls: AtomicU32,
        script: Mutex<Vec<AttemptOutcome>>,
        feedback: Mutex<Vec<Option<String>>>,
        epics: Mutex<Vec<Option<String>>>,
        cost: f64,
    }

    impl Scripted {
        fn new(phase: PhaseType) -> Arc<Self> {
            Self::with_script(phase, Vec::new())
        }

        fn with_script(phase: PhaseType, script: Vec<AttemptOutcome>) -> Arc<Self> {
            Arc::new(Self {
                phase,
                calls: AtomicU32::new(0),
                script: Mutex::new(script),
                feedback: Mutex::new(Vec::new()),
                epics: Mutex::new(Vec::new()),
                cost: 0.5,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PhaseBody for Scripted {
        fn phase_type(&self) -> PhaseType {
            self.phase
        }

        async fn attempt(&self, ctx: &PhaseContext<'_>) -> AttemptOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.feedback.lock().unwrap().push(ctx.feedback_text());
            self.epics
                .lock()
                .unwrap()
                .push(ctx.epic_id.map(str::to_string));
            ctx.meter.record(self.cost, 100);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                AttemptOutcome::Success(PhaseOutput::text(format!("{} done", ctx.key())))
            } else {
                script.remove(0)
            }
        }
    }

    /// Creates two environments, then optionally raises a control signal.
    struct Provisioning {
        phase: PhaseType,
        signal: Option<ControlSignal>,
    }

    #[async_trait]
    impl PhaseBody for Provisioning {
        fn phase_type(&self) -> PhaseType {
            self.phase
        }

        async fn attempt(&self, ctx: &PhaseContext<'_>) -> AttemptOutcome {
            for repo in ["api", "web"] {
                if let Err(e) = ctx
                    .services
                    .sandboxes
                    .get_or_create(ctx.task_id, repo, &EnvironmentRequest::default())
                    .await
                {
                    return AttemptOutcome::Fatal(e.into());
                }
            }
            if let Some(signal) = self.signal {
                ctx.services.control.request(ctx.task_id, signal).unwrap();
            }
            AttemptOutcome::Success(PhaseOutput::text("provisioned"))
        }
    }

    fn violation() -> AttemptOutcome {
        AttemptOutcome::RetryableViolation(
            Violation::new(ViolationCode::FileOverlap, "stories overlap")
                .with_details(vec!["src/lib.rs: s1, s2".into()]),
        )
    }

    fn all_scripted(h: &Harness) -> (PhaseEngine, Vec<Arc<Scripted>>) {
        let bodies: Vec<Arc<Scripted>> = PhaseType::ORDER.iter().map(|p| Scripted::new(*p)).collect();
        let engine = bodies.iter().fold(h.engine(), |engine, body| {
            engine.with_body(body.clone() as Arc<dyn PhaseBody>)
        });
        (engine, bodies)
    }

    #[tokio::test]
    async fn runs_every_phase_and_completes_task() {
        let h = Harness::new();
        let (engine, bodies) = all_scripted(&h);

        let outcome = engine.run("t1", "build it", &PhaseType::ORDER).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert!(bodies.iter().all(|b| b.calls() == 1));

        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.status, TaskStatus::Completed);
        assert_eq!(map.completed_phases(), PhaseType::ORDER.to_vec());
        assert_eq!(map.description, "build it");
        // Planning, architecture and integration are overhead.
        assert!((map.overhead_cost - 1.5).abs() < 1e-9);

        let events = h.events.get_events("t1").await.unwrap();
        let completed = events
            .iter()
            .filter(|e| e.event_type == EventType::PhaseCompleted)
            .count();
        assert_eq!(completed, 5);
        assert_eq!(events.last().unwrap().event_type, EventType::TaskCompleted);
    }

    #[tokio::test]
    async fn completed_phases_never_re_execute() {
        let h = Harness::new();
        let (engine, bodies) = all_scripted(&h);
        engine.run("t1", "", &PhaseType::ORDER).await.unwrap();
        engine.run("t1", "", &PhaseType::ORDER).await.unwrap();

        assert!(bodies.iter().all(|b| b.calls() == 1));
        let skipped = h
            .events
            .get_events("t1")
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == EventType::PhaseSkipped)
            .count();
        assert_eq!(skipped, 5);
    }

    #[tokio::test]
    async fn phases_run_in_pipeline_order() {
        let h = Harness::new();
        let (engine, _) = all_scripted(&h);
        engine
            .run("t1", "", &[PhaseType::Review, PhaseType::Planning])
            .await
            .unwrap();

        let started: Vec<String> = h
            .events
            .get_events("t1")
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == EventType::PhaseStarted)
            .map(|e| e.payload["phase"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(started, vec!["planning", "review"]);

        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn three_violations_fail_after_three_attempts() {
        let h = Harness::new();
        let body = Scripted::with_script(
            PhaseType::Architecture,
            vec![violation(), violation(), violation(), violation()],
        );
        let notifier = Arc::new(BroadcastNotifier::new(16));
        let mut rx = notifier.subscribe();
        let engine = h
            .engine()
            .with_body(Scripted::new(PhaseType::Planning))
            .with_body(body.clone())
            .with_notifier(notifier);

        let outcome = engine.run("t1", "", &PhaseType::ORDER).await.unwrap();
        let TaskOutcome::Failed { phase, error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(phase, PhaseType::Architecture);
        assert!(error.contains("3 attempts"));
        assert_eq!(body.calls(), 3);

        let feedback = body.feedback.lock().unwrap().clone();
        assert!(feedback[0].is_none());
        assert!(feedback[1].as_deref().unwrap().contains("src/lib.rs: s1, s2"));

        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.status, TaskStatus::Failed);
        let entry = map.phase(PhaseType::Architecture, None).unwrap();
        assert_eq!(entry.status, PhaseStatus::Failed);
        assert_eq!(entry.attempts, 3);
        assert_eq!(map.detailed_errors.len(), 1);
        assert_eq!(map.errors.len(), 1);

        let mut kinds = Vec::new();
        while let Ok(n) = rx.try_recv() {
            kinds.push(n.kind);
        }
        assert!(kinds.contains(&NotificationKind::PhaseError));

        let events = h.events.get_events("t1").await.unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::PhaseFailed));
    }

    #[tokio::test]
    async fn later_success_resolves_recorded_errors() {
        let h = Harness::new();
        let body = Scripted::with_script(
            PhaseType::Planning,
            vec![AttemptOutcome::Fatal(anyhow!("request timed out"))],
        );
        let engine = h.engine().with_body(body.clone());
        let first = engine.run("t1", "", &[PhaseType::Planning]).await.unwrap();
        assert!(matches!(first, TaskOutcome::Failed { error_code: ErrorCode::Timeout, .. }));

        let second = engine.run("t1", "", &[PhaseType::Planning]).await.unwrap();
        assert_eq!(second, TaskOutcome::Completed);
        let map = h.store.load("t1").await.unwrap().unwrap();
        assert!(map.detailed_errors.iter().all(|e| e.resolved));
        assert_eq!(map.phase(PhaseType::Planning, None).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn cancel_destroys_every_environment() {
        let h = Harness::new();
        let engine = h
            .engine()
            .with_body(Arc::new(Provisioning {
                phase: PhaseType::Planning,
                signal: Some(ControlSignal::Cancel),
            }))
            .with_body(Scripted::new(PhaseType::Architecture));

        let outcome = engine.run("t1", "", &PhaseType::ORDER).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(h.runtime.live_count(), 0);
        assert!(h.sandboxes.environments("t1").await.is_empty());

        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.status, TaskStatus::Cancelled);
        assert_eq!(engine.budget().spent("t1"), 0.0);
        let events = h.events.get_events("t1").await.unwrap();
        let cancelled = events
            .iter()
            .find(|e| e.event_type == EventType::TaskCancelled)
            .unwrap();
        assert_eq!(cancelled.payload["environments_destroyed"], 2);
    }

    #[tokio::test]
    async fn failure_tears_down_sandboxes() {
        let h = Harness::new();
        let engine = h
            .engine()
            .with_body(Arc::new(Provisioning {
                phase: PhaseType::Planning,
                signal: None,
            }))
            .with_body(Scripted::with_script(
                PhaseType::Architecture,
                vec![AttemptOutcome::Fatal(anyhow!("401 unauthorized"))],
            ));
        let outcome = engine.run("t1", "", &PhaseType::ORDER).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Failed { error_code: ErrorCode::Auth, .. }));
        assert_eq!(h.runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn pause_stops_without_teardown() {
        let h = Harness::new();
        let architecture = Scripted::new(PhaseType::Architecture);
        let engine = h
            .engine()
            .with_body(Arc::new(Provisioning {
                phase: PhaseType::Planning,
                signal: Some(ControlSignal::Pause),
            }))
            .with_body(architecture.clone());

        let outcome = engine.run("t1", "", &PhaseType::ORDER).await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Paused {
                phase: PhaseType::Architecture
            }
        );
        assert_eq!(h.runtime.live_count(), 2);
        assert_eq!(architecture.calls(), 0);

        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.status, TaskStatus::Paused);
        assert!(map.is_phase_completed(PhaseType::Planning, None));

        // Resuming clears the pause and picks up where it stopped.
        let outcome = engine
            .run("t1", "", &[PhaseType::Planning, PhaseType::Architecture])
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(architecture.calls(), 1);
    }

    #[tokio::test]
    async fn approval_gate_waits_until_approved() {
        let mut config = AnvilToml::default();
        config.phases.overrides.insert(
            "architecture".into(),
            PhaseOverride {
                requires_approval: Some(true),
                ..Default::default()
            },
        );
        let h = Harness::with_config(config);
        let (engine, bodies) = all_scripted(&h);

        let outcome = engine.run("t1", "", &PhaseType::ORDER).await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::AwaitingApproval {
                phase: PhaseType::Architecture
            }
        );
        assert_eq!(bodies[1].calls(), 0);
        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.status, TaskStatus::AwaitingApproval);
        assert_eq!(
            map.phase_status(PhaseType::Architecture, None),
            PhaseStatus::WaitingApproval
        );

        h.store
            .approve("t1", PhaseType::Architecture, None)
            .await
            .unwrap();
        let outcome = engine.run("t1", "", &PhaseType::ORDER).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(bodies[0].calls(), 1);
        assert_eq!(bodies[1].calls(), 1);
    }

    #[tokio::test]
    async fn hard_stop_budget_fails_before_running() {
        let mut config = AnvilToml::default();
        config.budget.task_ceiling = 1.0;
        config.budget.hard_stop = true;
        config.phases.overrides.insert(
            "implementation".into(),
            PhaseOverride {
                estimated_cost: Some(2.0),
                ..Default::default()
            },
        );
        let h = Harness::with_config(config);
        let (engine, bodies) = all_scripted(&h);

        let outcome = engine.run("t1", "", &PhaseType::ORDER).await.unwrap();
        let TaskOutcome::Failed { phase, error, .. } = outcome else {
            panic!("expected budget failure, got {outcome:?}");
        };
        assert_eq!(phase, PhaseType::Implementation);
        assert!(error.contains("Budget ceiling"));
        assert_eq!(bodies[2].calls(), 0);
    }

    #[tokio::test]
    async fn hard_stop_never_fails_a_completed_phase() {
        let mut config = AnvilToml::default();
        config.budget.task_ceiling = 0.4;
        config.budget.hard_stop = true;
        let h = Harness::with_config(config);
        let (engine, bodies) = all_scripted(&h);

        // Planning alone overshoots the ceiling.
        let first = engine.run("t1", "", &[PhaseType::Planning]).await.unwrap();
        assert_eq!(first, TaskOutcome::Completed);

        let second = engine
            .run("t1", "", &[PhaseType::Planning, PhaseType::Architecture])
            .await
            .unwrap();
        let TaskOutcome::Failed { phase, error_code, .. } = second else {
            panic!("expected budget failure, got {second:?}");
        };
        assert_eq!(phase, PhaseType::Architecture);
        assert_eq!(error_code, ErrorCode::Billing);
        assert_eq!(bodies[0].calls(), 1);
        assert_eq!(bodies[1].calls(), 0);

        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(
            map.phase_status(PhaseType::Planning, None),
            PhaseStatus::Completed
        );
        let point = h.store.get_resumption_point("t1").await.unwrap();
        assert_eq!(point.resume_from_phase, Some(PhaseType::Architecture));
    }

    #[tokio::test]
    async fn transient_agent_failure_is_retried() {
        let h = Harness::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        h.executor.respond_with(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("429 Too Many Requests: rate limit exceeded"))
            } else {
                Ok(reply("analysis", 0.2))
            }
        });
        let engine = h.engine().with_body(Arc::new(AgentPhase::planning()));

        let outcome = engine.run("t1", "build", &[PhaseType::Planning]).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let requests = h.executor.requests.lock().unwrap().clone();
        assert!(requests[1].prompt.contains("transient_failure"));
        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.phase(PhaseType::Planning, None).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn auth_agent_failure_is_not_retried() {
        let h = Harness::new();
        h.executor
            .respond_with(|_| Err(anyhow!("401 Unauthorized: invalid api key")));
        let engine = h.engine().with_body(Arc::new(AgentPhase::planning()));

        let outcome = engine.run("t1", "build", &[PhaseType::Planning]).await.unwrap();
        assert!(matches!(
            outcome,
            TaskOutcome::Failed { error_code: ErrorCode::Auth, .. }
        ));
        assert_eq!(h.executor.labels().len(), 1);
    }

    #[tokio::test]
    async fn soft_budget_warns_and_continues() {
        let mut config = AnvilToml::default();
        config.budget.task_ceiling = 0.6;
        let h = Harness::with_config(config);
        let notifier = Arc::new(BroadcastNotifier::new(64));
        let mut rx = notifier.subscribe();
        let (engine, _) = all_scripted(&h);
        let engine = engine.with_notifier(notifier);

        let outcome = engine.run("t1", "", &PhaseType::ORDER).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        let mut warnings = 0;
        while let Ok(n) = rx.try_recv() {
            if n.kind == NotificationKind::BudgetWarning {
                warnings += 1;
            }
        }
        assert!(warnings >= 1);
    }

    #[tokio::test]
    async fn multi_team_runs_story_phases_per_epic() {
        let mut config = AnvilToml::default();
        config.engine.multi_team = true;
        let h = Harness::with_config(config);
        h.store.initialize("t1", "").await.unwrap();
        h.store
            .update("t1", |map| {
                map.upsert_epic(anvil_common::EpicExecution::new("api", "API"));
                map.upsert_epic(anvil_common::EpicExecution::new("web", "Web"));
                map.phase_entry(PhaseType::Implementation, Some("api")).status =
                    PhaseStatus::Completed;
                Ok(())
            })
            .await
            .unwrap();

        let implementation = Scripted::new(PhaseType::Implementation);
        let engine = h.engine().with_body(implementation.clone());
        let outcome = engine
            .run("t1", "", &[PhaseType::Implementation])
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(
            *implementation.epics.lock().unwrap(),
            vec![Some("web".to_string())]
        );

        let map = h.store.load("t1").await.unwrap().unwrap();
        assert!(map.is_phase_completed(PhaseType::Implementation, None));
        assert!(map.is_phase_completed(PhaseType::Implementation, Some("web")));
    }

    #[tokio::test]
    async fn missing_body_is_an_error_and_marks_task_failed() {
        let h = Harness::new();
        let err = h
            .engine()
            .run("t1", "", &[PhaseType::Planning])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No phase body"));
        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.status, TaskStatus::Failed);
    }
}
