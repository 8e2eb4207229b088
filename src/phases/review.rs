//! Review: a judge agent rules on every merged story.
//!
//! An approved story is completed; a rejected one is failed. Once every
//! story of an epic is terminal the epic is marked complete and an
//! `epic_completed` event is logged.

use std::sync::LazyLock;

use anvil_common::{
    EpicExecution, EventType, ExecutionMap, PhaseType, ProgressStage, SandboxOptions,
    StoryExecution, StoryProgressPayload, WorkStatus,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::{
    epics_in_scope, load_map, prompts, story_branch, story_failures_outcome, story_repo_key,
};
use crate::control::ControlSignal;
use crate::engine::{
    AttemptOutcome, PhaseBody, PhaseContext, PhaseOutput, Violation, ViolationCode,
};
use crate::errors::EngineError;
use crate::memory::StoryProgress;
use crate::sandbox::EnvironmentRequest;

const AGENT: &str = "judge";

static VERDICT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)VERDICT:\s*\**\s*(APPROVED|REJECTED)").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Rejected,
}

/// The last verdict line in a judge's output.
pub fn parse_verdict(output: &str) -> Option<Verdict> {
    VERDICT.captures_iter(output).last().map(|c| {
        if c[1].eq_ignore_ascii_case("approved") {
            Verdict::Approved
        } else {
            Verdict::Rejected
        }
    })
}

enum Reviewed {
    Verdict(Verdict),
    NoVerdict,
    Cancelled,
    Failed(anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReviewPhase;

fn awaiting_review(map: &ExecutionMap, ctx: &PhaseContext<'_>) -> Vec<(EpicExecution, StoryExecution)> {
    epics_in_scope(map, ctx)
        .into_iter()
        .flat_map(|epic| {
            epic.stories()
                .iter()
                .filter(|s| {
                    !s.is_terminal() && s.progress_stage.is_at_least(ProgressStage::MergedToEpic)
                })
                .map(move |s| (epic.clone(), s.clone()))
        })
        .collect()
}

impl ReviewPhase {
    async fn judge(
        &self,
        ctx: &PhaseContext<'_>,
        epic: &EpicExecution,
        story: &StoryExecution,
    ) -> Result<Option<Verdict>> {
        let store = ctx.store();
        store
            .save_story_progress(
                ctx.task_id,
                &epic.epic_id,
                &story.story_id,
                ProgressStage::JudgeEvaluating,
                StoryProgress::judge(),
            )
            .await?;
        ctx.emit(
            EventType::StoryProgress,
            AGENT,
            &StoryProgressPayload::new(
                &epic.epic_id,
                &story.story_id,
                ProgressStage::JudgeEvaluating,
                Some(AGENT),
            ),
        )
        .await;

        let env = ctx
            .services
            .sandboxes
            .get_or_create(
                ctx.task_id,
                &story_repo_key(&epic.epic_id, &story.story_id),
                &EnvironmentRequest::default(),
            )
            .await?;
        ctx.services
            .scm
            .prepare_workspace(
                &env.workspace_path,
                epic.target_repository.as_deref(),
                &story_branch(&story.story_id),
            )
            .await?;

        let prompt = prompts::build_judge_prompt(epic, story);
        let mut request = ctx.request(AGENT, &format!("review {}", story.story_id), prompt);
        request.workspace_path = env.workspace_path.clone();
        request.sandbox = Some(SandboxOptions {
            container_id: env.container_id.clone(),
            env: env.env.clone(),
        });
        let response = ctx.run_agent(request).await?;

        let spent = StoryProgress {
            cost: response.cost,
            tokens: response.token_usage.total(),
            ..StoryProgress::judge()
        };
        let verdict = parse_verdict(&response.output);
        match verdict {
            Some(Verdict::Approved) => {
                store
                    .save_story_progress(
                        ctx.task_id,
                        &epic.epic_id,
                        &story.story_id,
                        ProgressStage::Completed,
                        spent,
                    )
                    .await?;
                ctx.emit(
                    EventType::StoryProgress,
                    AGENT,
                    &StoryProgressPayload::new(
                        &epic.epic_id,
                        &story.story_id,
                        ProgressStage::Completed,
                        Some(AGENT),
                    ),
                )
                .await;
            }
            Some(Verdict::Rejected) | None => {
                store
                    .save_story_progress(
                        ctx.task_id,
                        &epic.epic_id,
                        &story.story_id,
                        ProgressStage::JudgeEvaluating,
                        spent,
                    )
                    .await?;
                if verdict.is_some() {
                    store
                        .mark_story_failed(ctx.task_id, &epic.epic_id, &story.story_id)
                        .await?;
                }
            }
        }
        info!(
            task_id = %ctx.task_id,
            story_id = %story.story_id,
            verdict = ?verdict,
            "Story reviewed"
        );
        Ok(verdict)
    }

    /// Mark epics whose stories are all terminal as complete, once.
    async fn close_epics(&self, ctx: &PhaseContext<'_>) -> Result<Vec<String>> {
        let epic_filter = ctx.epic_id.map(str::to_string);
        let closed = ctx
            .store()
            .update(ctx.task_id, move |map| {
                let ids: Vec<String> = map
                    .epics()
                    .iter()
                    .filter(|e| epic_filter.as_deref().is_none_or(|id| e.epic_id == id))
                    .filter(|e| e.all_stories_terminal() && !e.tech_lead_completed)
                    .map(|e| e.epic_id.clone())
                    .collect();
                let mut closed = Vec::new();
                for id in ids {
                    if let Some(epic) = map.epic_mut(&id) {
                        epic.tech_lead_completed = true;
                        epic.refresh_status();
                        closed.push((id, epic.status));
                    }
                }
                Ok(closed)
            })
            .await?;

        for (epic_id, status) in &closed {
            ctx.emit(
                EventType::EpicCompleted,
                AGENT,
                &json!({ "id": epic_id, "epic_id": epic_id, "status": status }),
            )
            .await;
        }
        Ok(closed.into_iter().map(|(id, _)| id).collect())
    }
}

#[async_trait]
impl PhaseBody for ReviewPhase {
    fn phase_type(&self) -> PhaseType {
        PhaseType::Review
    }

    async fn attempt(&self, ctx: &PhaseContext<'_>) -> AttemptOutcome {
        let map = match load_map(ctx).await {
            Ok(map) => map,
            Err(outcome) => return outcome,
        };
        let jobs = awaiting_review(&map, ctx);

        let semaphore = Semaphore::new(ctx.services.max_parallel_stories.max(1));
        let results = join_all(jobs.iter().map(|(epic, story)| {
            let semaphore = &semaphore;
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return Reviewed::Failed(anyhow!("Review dispatcher closed"));
                };
                if ctx.control_signal() == ControlSignal::Cancel {
                    return Reviewed::Cancelled;
                }
                match self.judge(ctx, epic, story).await {
                    Ok(Some(verdict)) => Reviewed::Verdict(verdict),
                    Ok(None) => Reviewed::NoVerdict,
                    Err(e) => Reviewed::Failed(e),
                }
            }
        }))
        .await;

        let mut approved = 0;
        let mut rejected = 0;
        let mut cancelled = false;
        let mut missing = Vec::new();
        let mut failures = Vec::new();
        for ((_, story), result) in jobs.iter().zip(results) {
            match result {
                Reviewed::Verdict(Verdict::Approved) => approved += 1,
                Reviewed::Verdict(Verdict::Rejected) => rejected += 1,
                Reviewed::NoVerdict => missing.push(story.story_id.clone()),
                Reviewed::Cancelled => cancelled = true,
                Reviewed::Failed(e) => {
                    warn!(
                        task_id = %ctx.task_id,
                        story_id = %story.story_id,
                        error = %format!("{e:#}"),
                        "Review failed"
                    );
                    failures.push((story.story_id.clone(), format!("{e:#}")));
                }
            }
        }

        if cancelled {
            return AttemptOutcome::Fatal(
                EngineError::Cancelled {
                    task_id: ctx.task_id.to_string(),
                }
                .into(),
            );
        }

        let closed = match self.close_epics(ctx).await {
            Ok(closed) => closed,
            Err(e) => return AttemptOutcome::Fatal(e),
        };

        if !failures.is_empty() {
            return story_failures_outcome(&failures);
        }
        if !missing.is_empty() {
            return AttemptOutcome::RetryableViolation(
                Violation::new(
                    ViolationCode::IncompleteOutput,
                    "The judge gave no verdict for some stories",
                )
                .with_details(missing),
            );
        }

        let unreviewed = map
            .epics()
            .iter()
            .flat_map(|e| e.stories())
            .filter(|s| s.status != WorkStatus::Failed && s.progress_stage < ProgressStage::MergedToEpic)
            .count();
        if unreviewed > 0 {
            warn!(
                task_id = %ctx.task_id,
                stories = unreviewed,
                "Stories never reached their epic branch and were not reviewed"
            );
        }

        AttemptOutcome::Success(PhaseOutput::text(format!(
            "{approved} approved, {rejected} rejected, {} epic(s) closed",
            closed.len()
        )))
    }
}
