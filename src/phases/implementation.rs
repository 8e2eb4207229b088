//! Implementation: run every pending story in its own sandbox.
//!
//! Stories are dispatched concurrently, bounded by
//! `engine.max_parallel_stories`. Each worker walks the stages
//!
//! ```text
//! code_generating -> code_written -> tests_passed -> committed -> pushed -> merged_to_epic
//! ```
//!
//! recording every stage before moving on, and skips the stages a previous
//! run already reached. A task whose epics target more than one repository
//! gets a shared network so stories can reach the other services.

use std::collections::{BTreeSet, HashMap};

use anvil_common::ids::{normalize_repo_key, repository_name};
use anvil_common::{
    EpicExecution, EventType, ExecutionMap, PhaseType, ProgressStage, SandboxOptions,
    StoryExecution, StoryProgressPayload, WorkStatus,
};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{
    epic_branch, epics_in_scope, load_map, prompts, story_branch, story_failures_outcome,
    story_repo_key,
};
use crate::control::ControlSignal;
use crate::engine::{AttemptOutcome, PhaseBody, PhaseContext, PhaseOutput};
use crate::errors::{EngineError, SandboxError};
use crate::memory::StoryProgress;
use crate::sandbox::{Environment, EnvironmentRequest, ServiceSpec};
use crate::util::truncate_chars;
use crate::validate::{StoryPlan, validate_batch};

const AGENT: &str = "developer";

/// Role given to each repository's service on a shared network.
const SERVICE_ROLE: &str = "service";

enum StoryResult {
    Merged,
    Cancelled,
    Failed(anyhow::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImplementationPhase;

/// Stories of the attempt's scope that have not reached their epic branch.
fn pending_stories(map: &ExecutionMap, ctx: &PhaseContext<'_>) -> Vec<(EpicExecution, StoryExecution)> {
    epics_in_scope(map, ctx)
        .into_iter()
        .flat_map(|epic| {
            epic.stories()
                .iter()
                .filter(|s| {
                    s.status != WorkStatus::Failed
                        && !s.progress_stage.is_at_least(ProgressStage::MergedToEpic)
                })
                .map(move |s| (epic.clone(), s.clone()))
        })
        .collect()
}

impl ImplementationPhase {
    /// One environment per repository on a task network, keyed by
    /// repository. Empty for single-repository tasks.
    async fn provision_services(
        &self,
        ctx: &PhaseContext<'_>,
        map: &ExecutionMap,
    ) -> Result<HashMap<String, Environment>, SandboxError> {
        let repos: BTreeSet<String> = map
            .epics()
            .iter()
            .filter_map(|e| e.target_repository.clone())
            .collect();
        if repos.len() < 2 {
            return Ok(HashMap::new());
        }

        let specs: Vec<ServiceSpec> = repos
            .iter()
            .map(|repo| ServiceSpec {
                repo_key: normalize_repo_key(&repository_name(repo)),
                repository: repo.clone(),
                role: SERVICE_ROLE.to_string(),
                port: None,
                image: None,
            })
            .collect();
        let environments = ctx
            .services
            .sandboxes
            .provision_services(ctx.task_id, &specs)
            .await?;
        Ok(repos.into_iter().zip(environments).collect())
    }

    async fn advance(
        &self,
        ctx: &PhaseContext<'_>,
        epic: &EpicExecution,
        story: &StoryExecution,
        worker: &str,
        stage: ProgressStage,
        progress: StoryProgress,
    ) -> Result<ProgressStage> {
        let recorded = ctx
            .store()
            .save_story_progress(ctx.task_id, &epic.epic_id, &story.story_id, stage, progress)
            .await?;
        ctx.emit(
            EventType::StoryProgress,
            AGENT,
            &StoryProgressPayload::new(&epic.epic_id, &story.story_id, stage, Some(worker)),
        )
        .await;
        debug!(
            task_id = %ctx.task_id,
            epic_id = %epic.epic_id,
            story_id = %story.story_id,
            stage = %stage,
            "Story advanced"
        );
        Ok(recorded)
    }

    async fn run_story(
        &self,
        ctx: &PhaseContext<'_>,
        epic: &EpicExecution,
        story: &StoryExecution,
        service: Option<&Environment>,
    ) -> Result<()> {
        let worker = story
            .assigned_to
            .clone()
            .unwrap_or_else(|| format!("worker-{}", story.story_id));
        let request = EnvironmentRequest {
            network: service.and_then(|s| s.network.clone()),
            env: service.map(|s| s.env.clone()).unwrap_or_default(),
            ..Default::default()
        };
        let env = ctx
            .services
            .sandboxes
            .get_or_create(
                ctx.task_id,
                &story_repo_key(&epic.epic_id, &story.story_id),
                &request,
            )
            .await?;

        let scm = &ctx.services.scm;
        let workspace = env.workspace_path.as_path();
        let branch = story_branch(&story.story_id);
        scm.prepare_workspace(workspace, epic.target_repository.as_deref(), &branch)
            .await?;

        let mut reached = story.progress_stage;
        if reached > ProgressStage::NotStarted {
            info!(
                task_id = %ctx.task_id,
                story_id = %story.story_id,
                stage = %reached,
                "Resuming story"
            );
        }

        if !reached.is_at_least(ProgressStage::CodeWritten) {
            self.advance(ctx, epic, story, &worker, ProgressStage::CodeGenerating, StoryProgress::by(&worker))
                .await?;

            let prompt = prompts::build_story_prompt(ctx.description, epic, story);
            let mut request = ctx.request(AGENT, &format!("implement {}", story.story_id), prompt);
            request.workspace_path = env.workspace_path.clone();
            request.resume_token = story.session_token.clone();
            request.sandbox = Some(SandboxOptions {
                container_id: env.container_id.clone(),
                env: env.env.clone(),
            });
            let response = ctx.run_agent(request).await?;

            let progress = StoryProgress {
                session_token: response.session_id.clone(),
                cost: response.cost,
                tokens: response.token_usage.total(),
                ..StoryProgress::by(&worker)
            };
            reached = self
                .advance(ctx, epic, story, &worker, ProgressStage::CodeWritten, progress)
                .await?;
        }

        if !reached.is_at_least(ProgressStage::TestsPassed) {
            if let Some(command) = &ctx.services.sandboxes.config().test_command {
                let output = ctx.services.sandboxes.exec(&env, command).await?;
                if output.exit_code != 0 {
                    let detail = if output.stderr.trim().is_empty() {
                        &output.stdout
                    } else {
                        &output.stderr
                    };
                    bail!(
                        "Tests failed for story {} (exit {}): {}",
                        story.story_id,
                        output.exit_code,
                        truncate_chars(detail.trim(), 500)
                    );
                }
            }
            reached = self
                .advance(ctx, epic, story, &worker, ProgressStage::TestsPassed, StoryProgress::by(&worker))
                .await?;
        }

        if !reached.is_at_least(ProgressStage::Committed) {
            let message = format!("{}: {}", story.story_id, story.title);
            let commit = scm.commit_all(workspace, &message).await?;
            let mut progress = StoryProgress::by(&worker);
            match commit {
                Some(commit) => {
                    progress.commit_hash = Some(commit.hash);
                    progress.files_modified = Some(commit.files);
                }
                None => warn!(
                    task_id = %ctx.task_id,
                    story_id = %story.story_id,
                    "Story produced no changes to commit"
                ),
            }
            reached = self
                .advance(ctx, epic, story, &worker, ProgressStage::Committed, progress)
                .await?;
        }

        if !reached.is_at_least(ProgressStage::Pushed) {
            scm.push(workspace, &branch).await?;
            reached = self
                .advance(ctx, epic, story, &worker, ProgressStage::Pushed, StoryProgress::by(&worker))
                .await?;
        }

        if !reached.is_at_least(ProgressStage::MergedToEpic) {
            let target = epic_branch(epic);
            scm.merge(workspace, &branch, &target).await?;
            scm.push(workspace, &target).await?;
            self.advance(ctx, epic, story, &worker, ProgressStage::MergedToEpic, StoryProgress::by(&worker))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PhaseBody for ImplementationPhase {
    fn phase_type(&self) -> PhaseType {
        PhaseType::Implementation
    }

    async fn attempt(&self, ctx: &PhaseContext<'_>) -> AttemptOutcome {
        let map = match load_map(ctx).await {
            Ok(map) => map,
            Err(outcome) => return outcome,
        };
        let jobs = pending_stories(&map, ctx);
        if jobs.is_empty() {
            return AttemptOutcome::Success(PhaseOutput::text("No stories left to implement"));
        }

        let plans: Vec<StoryPlan> = jobs
            .iter()
            .map(|(epic, story)| StoryPlan {
                story_id: story.story_id.clone(),
                epic_id: epic.epic_id.clone(),
                repository: epic.target_repository.clone(),
                worker_id: story.assigned_to.clone(),
                files: story.files.clone(),
            })
            .collect();
        if let Err(violation) = validate_batch(&plans) {
            return AttemptOutcome::Fatal(anyhow!("Story batch rejected before dispatch: {violation}"));
        }

        let services = match self.provision_services(ctx, &map).await {
            Ok(services) => services,
            Err(e) => return AttemptOutcome::Fatal(e.into()),
        };

        info!(
            task_id = %ctx.task_id,
            stories = jobs.len(),
            parallel = ctx.services.max_parallel_stories,
            "Dispatching stories"
        );
        let semaphore = Semaphore::new(ctx.services.max_parallel_stories.max(1));
        let results = join_all(jobs.iter().map(|(epic, story)| {
            let semaphore = &semaphore;
            let service = epic
                .target_repository
                .as_ref()
                .and_then(|repo| services.get(repo));
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return StoryResult::Failed(anyhow!("Story dispatcher closed"));
                };
                if ctx.control_signal() == ControlSignal::Cancel {
                    return StoryResult::Cancelled;
                }
                match self.run_story(ctx, epic, story, service).await {
                    Ok(()) => StoryResult::Merged,
                    Err(e) => {
                        warn!(
                            task_id = %ctx.task_id,
                            story_id = %story.story_id,
                            error = %format!("{e:#}"),
                            "Story failed"
                        );
                        StoryResult::Failed(e)
                    }
                }
            }
        }))
        .await;

        let mut merged = 0;
        let mut cancelled = false;
        let mut failures = Vec::new();
        for ((_, story), result) in jobs.iter().zip(results) {
            match result {
                StoryResult::Merged => merged += 1,
                StoryResult::Cancelled => cancelled = true,
                StoryResult::Failed(e) => failures.push((story.story_id.clone(), format!("{e:#}"))),
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
        if failures.is_empty() {
            return AttemptOutcome::Success(PhaseOutput::text(format!(
                "{merged} story(ies) merged"
            )));
        }

        story_failures_outcome(&failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anvil_common::ErrorCode;

    use crate::control::TaskControl;
    use crate::engine::TaskOutcome;
    use crate::events::EventLog;
    use crate::testing::{Harness, reply};

    struct Seed<'a> {
        epic: &'a str,
        repo: Option<&'a str>,
        story: &'a str,
        worker: &'a str,
        file: &'a str,
    }

    async fn seed(h: &Harness, seeds: &[Seed<'_>]) {
        h.store.initialize("t1", "feature").await.unwrap();
        let seeds: Vec<(String, Option<String>, String, String, String)> = seeds
            .iter()
            .map(|s| {
                (
                    s.epic.to_string(),
                    s.repo.map(str::to_string),
                    s.story.to_string(),
                    s.worker.to_string(),
                    s.file.to_string(),
                )
            })
            .collect();
        h.store
            .update("t1", move |map| {
                for (epic, repo, story, worker, file) in seeds {
                    let mut e = EpicExecution::new(&epic, &epic);
                    if let Some(repo) = repo {
                        e = e.with_repository(&repo);
                    }
                    map.upsert_epic(e);
                    map.upsert_story(
                        &epic,
                        StoryExecution::new(&story, &story)
                            .assigned(&worker)
                            .with_files(vec![file]),
                    )?;
                }
                Ok(())
            })
            .await
            .unwrap();
    }

    fn two_stories() -> Vec<Seed<'static>> {
        vec![
            Seed {
                epic: "api",
                repo: None,
                story: "s1",
                worker: "dev-1",
                file: "src/a.rs",
            },
            Seed {
                epic: "web",
                repo: None,
                story: "s2",
                worker: "dev-2",
                file: "web/b.ts",
            },
        ]
    }

    fn engine(h: &Harness) -> crate::engine::PhaseEngine {
        h.engine().with_body(Arc::new(ImplementationPhase))
    }

    #[tokio::test]
    async fn walks_every_stage_in_its_own_sandbox() {
        let h = Harness::new();
        seed(&h, &two_stories()).await;

        let outcome = engine(&h)
            .run("t1", "", &[PhaseType::Implementation])
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);

        let map = h.store.load("t1").await.unwrap().unwrap();
        for (epic, story) in [("api", "s1"), ("web", "s2")] {
            let s = map.story(epic, story).unwrap();
            assert_eq!(s.progress_stage, ProgressStage::MergedToEpic);
            assert!(s.last_commit_hash.is_some());
            assert_eq!(s.session_token.as_deref(), Some("session-1"));
        }
        assert!((map.epic("api").unwrap().cost - 0.1).abs() < 1e-9);
        assert!((map.total_cost - 0.2).abs() < 1e-9);

        let requests = h.executor.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        let containers: BTreeSet<String> = requests
            .iter()
            .map(|r| r.sandbox.as_ref().unwrap().container_id.clone())
            .collect();
        assert_eq!(containers.len(), 2);

        let ops = h.scm.ops();
        assert!(ops.contains(&"merge story/s1 -> epic/api".to_string()));
        assert!(ops.contains(&"push epic/web".to_string()));

        let stages: Vec<ProgressStage> = h
            .events
            .get_events("t1")
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == EventType::StoryProgress)
            .filter_map(|e| e.payload_as::<StoryProgressPayload>().ok())
            .filter(|p| p.story_id == "s1")
            .map(|p| p.stage)
            .collect();
        assert_eq!(
            stages,
            vec![
                ProgressStage::CodeGenerating,
                ProgressStage::CodeWritten,
                ProgressStage::TestsPassed,
                ProgressStage::Committed,
                ProgressStage::Pushed,
                ProgressStage::MergedToEpic,
            ]
        );
        // Environments are gone once the run ends.
        assert_eq!(h.runtime.live_count(), 0);
    }

    #[tokio::test]
    async fn resumes_from_the_recorded_stage() {
        let h = Harness::new();
        seed(&h, &two_stories()[..1]).await;
        h.store
            .save_story_progress(
                "t1",
                "api",
                "s1",
                ProgressStage::Committed,
                StoryProgress {
                    commit_hash: Some("abc".into()),
                    ..StoryProgress::by("dev-1")
                },
            )
            .await
            .unwrap();

        engine(&h)
            .run("t1", "", &[PhaseType::Implementation])
            .await
            .unwrap();

        assert!(h.executor.requests.lock().unwrap().is_empty());
        let ops = h.scm.ops();
        assert!(!ops.iter().any(|op| op.starts_with("commit")));
        assert!(ops.contains(&"push story/s1".to_string()));
        let map = h.store.load("t1").await.unwrap().unwrap();
        let story = map.story("api", "s1").unwrap();
        assert_eq!(story.progress_stage, ProgressStage::MergedToEpic);
        assert_eq!(story.last_commit_hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn overlapping_batch_fails_before_any_sandbox() {
        let h = Harness::new();
        let mut seeds = two_stories();
        seeds[0].repo = Some("acme/app");
        seeds[1].repo = Some("acme/app");
        seeds[1].file = "./src/a.rs";
        seed(&h, &seeds).await;

        let outcome = engine(&h)
            .run("t1", "", &[PhaseType::Implementation])
            .await
            .unwrap();
        let TaskOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("acme-app:src/a.rs: s1, s2"));
        assert!(h.executor.requests.lock().unwrap().is_empty());
        assert!(h.scm.ops().is_empty());
    }

    #[tokio::test]
    async fn transient_story_failure_is_retried() {
        let h = Harness::new();
        seed(&h, &two_stories()).await;
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        h.executor.respond_with(move |request| {
            if request.label == "implement s2" && counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("429 Too Many Requests");
            }
            Ok(reply("done", 0.1))
        });

        let outcome = engine(&h)
            .run("t1", "", &[PhaseType::Implementation])
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);

        // s1 finished on the first attempt and is not redone.
        let labels = h.executor.labels();
        assert_eq!(labels.iter().filter(|l| *l == "implement s1").count(), 1);
        assert_eq!(labels.iter().filter(|l| *l == "implement s2").count(), 2);
        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.phase(PhaseType::Implementation, None).unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn auth_failure_is_fatal() {
        let h = Harness::new();
        seed(&h, &two_stories()[..1]).await;
        h.executor
            .respond_with(|_| Err(anyhow!("Invalid API key · Please run /login")));

        let outcome = engine(&h)
            .run("t1", "", &[PhaseType::Implementation])
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TaskOutcome::Failed {
                error_code: ErrorCode::Auth,
                ..
            }
        ));
        assert_eq!(h.executor.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_between_stories_stops_dispatch() {
        let mut config = crate::config::AnvilToml::default();
        config.engine.max_parallel_stories = 1;
        let h = Harness::with_config(config);
        seed(&h, &two_stories()).await;
        let control = h.control.clone();
        h.executor.respond_with(move |_| {
            control.request("t1", ControlSignal::Cancel).unwrap();
            Ok(reply("done", 0.1))
        });

        let outcome = engine(&h)
            .run("t1", "", &[PhaseType::Implementation])
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(h.executor.requests.lock().unwrap().len(), 1);
        assert_eq!(h.runtime.live_count(), 0);
        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(
            map.phase_status(PhaseType::Implementation, None),
            anvil_common::PhaseStatus::NotStarted
        );
    }

    #[tokio::test]
    async fn multi_repository_tasks_share_a_network() {
        let h = Harness::new();
        let mut seeds = two_stories();
        seeds[0].repo = Some("acme/api");
        seeds[1].repo = Some("acme/web");
        seed(&h, &seeds).await;

        engine(&h)
            .run("t1", "", &[PhaseType::Implementation])
            .await
            .unwrap();

        let requests = h.executor.requests.lock().unwrap().clone();
        let api = requests
            .iter()
            .find(|r| r.label == "implement s1")
            .unwrap();
        let env = &api.sandbox.as_ref().unwrap().env;
        assert_eq!(env.get("SERVICE_WEB_HOST").map(String::as_str), Some("service-web"));
        assert_eq!(env.get("ANVIL_NETWORK").map(String::as_str), Some("anvil-t1-net"));
    }

    #[tokio::test]
    async fn failing_tests_stop_the_story() {
        let mut config = crate::config::AnvilToml::default();
        config.sandbox.test_command = Some("cargo test".into());
        let h = Harness::with_config(config);
        *h.runtime.exit_code.lock().unwrap() = 101;
        seed(&h, &two_stories()[..1]).await;

        let outcome = engine(&h)
            .run("t1", "", &[PhaseType::Implementation])
            .await
            .unwrap();
        let TaskOutcome::Failed { error, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("Tests failed for story s1"));
        assert_eq!(h.runtime.execs.lock().unwrap().as_slice(), ["cargo test"]);
        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(
            map.story("api", "s1").unwrap().progress_stage,
            ProgressStage::CodeWritten
        );
    }
}
