//! Architecture: turn the request into epics, stories and a team.
//!
//! The architect replies with a JSON team plan. The plan is checked before
//! anything is recorded (ids present and unique, one story per worker, no
//! shared files); a bad plan goes back to the architect as a violation.
//! Accepted plans are appended to the event log first and then written to
//! the execution map, so a crash in between is repaired by replay.

use std::collections::{BTreeMap, HashSet};

use anvil_common::ids::{normalize_worker_id, resolve_epic_id, resolve_story_id};
use anvil_common::{
    EpicCreatedPayload, EpicExecution, EventType, PhaseType, StoryCreatedPayload,
    StoryExecution, TeamCompositionPayload, TeamMember,
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{agent_failure_outcome, epic_branch, load_map, prompts};
use crate::engine::{AttemptOutcome, PhaseBody, PhaseContext, PhaseOutput, Violation, ViolationCode};
use crate::util::extract_json_object;
use crate::validate::{StoryPlan, validate_batch};

const AGENT: &str = "architect";

#[derive(Debug, Clone, Deserialize)]
pub struct TeamPlan {
    #[serde(default)]
    pub team: Vec<PlannedMember>,
    #[serde(default)]
    pub epics: Vec<PlannedEpic>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedMember {
    #[serde(alias = "id")]
    pub worker_id: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedEpic {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "target_repository")]
    pub repository: Option<String>,
    #[serde(default, alias = "branch_name")]
    pub branch: Option<String>,
    #[serde(default)]
    pub stories: Vec<PlannedStory>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannedStory {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default, alias = "worker", alias = "assignee")]
    pub assigned_to: Option<String>,
}

/// A plan with resolved ids, ready to record.
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub team: Vec<TeamMember>,
    pub epics: Vec<EpicExecution>,
    /// epic id -> stories
    pub stories: Vec<(String, StoryExecution)>,
}

impl ResolvedPlan {
    pub fn assignments(&self) -> BTreeMap<String, String> {
        self.stories
            .iter()
            .filter_map(|(_, s)| s.assigned_to.clone().map(|w| (s.story_id.clone(), w)))
            .collect()
    }

    fn story_plans(&self) -> Vec<StoryPlan> {
        self.stories
            .iter()
            .map(|(epic_id, s)| StoryPlan {
                story_id: s.story_id.clone(),
                epic_id: epic_id.clone(),
                repository: self
                    .epics
                    .iter()
                    .find(|e| &e.epic_id == epic_id)
                    .and_then(|e| e.target_repository.clone()),
                worker_id: s.assigned_to.clone(),
                files: s.files.clone(),
            })
            .collect()
    }
}

fn invalid(message: impl Into<String>, details: Vec<String>) -> Violation {
    Violation::new(ViolationCode::InvalidPlan, message).with_details(details)
}

/// Parse the architect's reply into a plan.
pub fn parse_plan(output: &str) -> Result<TeamPlan, Violation> {
    let json = extract_json_object(output)
        .ok_or_else(|| invalid("The reply contained no JSON object", Vec::new()))?;
    serde_json::from_str(&json)
        .map_err(|e| invalid(format!("The team plan is not valid: {e}"), Vec::new()))
}

/// Resolve ids and check the plan. Stories without an assignee get a
/// dedicated worker so the one-story-per-worker rule holds.
pub fn resolve_plan(plan: &TeamPlan) -> Result<ResolvedPlan, Violation> {
    if plan.epics.is_empty() {
        return Err(invalid("The plan has no epics", Vec::new()));
    }

    let mut problems = Vec::new();
    let mut epics = Vec::new();
    let mut stories = Vec::new();
    let mut seen_epics = HashSet::new();
    let mut seen_stories = HashSet::new();

    for (i, planned) in plan.epics.iter().enumerate() {
        let Some(epic_id) = resolve_epic_id(planned.id.as_deref(), planned.title.as_deref())
        else {
            problems.push(format!("epic #{} has neither id nor title", i + 1));
            continue;
        };
        if !seen_epics.insert(epic_id.clone()) {
            problems.push(format!("epic {epic_id} appears more than once"));
            continue;
        }
        if planned.stories.is_empty() {
            problems.push(format!("epic {epic_id} has no stories"));
        }

        let mut epic = EpicExecution::new(&epic_id, planned.title.as_deref().unwrap_or_default());
        if let Some(repo) = &planned.repository {
            epic = epic.with_repository(repo);
        }
        epic.branch_name = Some(planned.branch.clone().unwrap_or_else(|| epic_branch(&epic)));

        for (j, planned_story) in planned.stories.iter().enumerate() {
            let Some(story_id) =
                resolve_story_id(planned_story.id.as_deref(), planned_story.title.as_deref())
            else {
                problems.push(format!("story #{} of epic {epic_id} has neither id nor title", j + 1));
                continue;
            };
            if !seen_stories.insert(story_id.clone()) {
                problems.push(format!("story {story_id} appears more than once"));
                continue;
            }
            let worker = planned_story
                .assigned_to
                .clone()
                .unwrap_or_else(|| format!("worker-{story_id}"));
            let story = StoryExecution::new(
                &story_id,
                planned_story.title.as_deref().unwrap_or_default(),
            )
            .assigned(&worker)
            .with_files(planned_story.files.clone());
            stories.push((epic.epic_id.clone(), story));
        }
        epics.push(epic);
    }

    if !problems.is_empty() {
        return Err(invalid(
            format!("{} problem(s) in the team plan", problems.len()),
            problems,
        ));
    }

    let mut team: Vec<TeamMember> = plan
        .team
        .iter()
        .map(|m| TeamMember::new(&m.worker_id, &m.role))
        .collect();
    for (_, story) in &stories {
        if let Some(worker) = &story.assigned_to
            && !team.iter().any(|m| &m.worker_id == worker)
        {
            team.push(TeamMember::new(worker, "developer"));
        }
    }

    let resolved = ResolvedPlan {
        team,
        epics,
        stories,
    };
    validate_batch(&resolved.story_plans())?;
    Ok(resolved)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchitecturePhase;

impl ArchitecturePhase {
    async fn record(&self, ctx: &PhaseContext<'_>, plan: &ResolvedPlan) -> anyhow::Result<()> {
        for epic in &plan.epics {
            ctx.emit(
                EventType::EpicCreated,
                AGENT,
                &EpicCreatedPayload {
                    id: epic.epic_id.clone(),
                    title: epic.title.clone(),
                    target_repository: epic.target_repository.clone(),
                    branch_name: epic.branch_name.clone(),
                },
            )
            .await;
        }
        for (epic_id, story) in &plan.stories {
            ctx.emit(
                EventType::StoryCreated,
                AGENT,
                &StoryCreatedPayload {
                    id: story.story_id.clone(),
                    epic_id: epic_id.clone(),
                    title: story.title.clone(),
                    files: story.files.clone(),
                    assigned_to: story.assigned_to.clone(),
                },
            )
            .await;
        }
        let assignments = plan.assignments();
        ctx.emit(
            EventType::TeamCompositionDefined,
            AGENT,
            &TeamCompositionPayload {
                id: ctx.task_id.to_string(),
                members: plan.team.clone(),
                assignments: assignments.clone(),
            },
        )
        .await;

        let epics = plan.epics.clone();
        let stories = plan.stories.clone();
        let team = plan.team.clone();
        ctx.store()
            .update(ctx.task_id, move |map| {
                for epic in epics {
                    map.upsert_epic(epic);
                }
                for (epic_id, story) in stories {
                    map.upsert_story(&epic_id, story)?;
                }
                map.team_composition = team;
                for (story, worker) in assignments {
                    map.story_assignments.insert(story, normalize_worker_id(&worker));
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PhaseBody for ArchitecturePhase {
    fn phase_type(&self) -> PhaseType {
        PhaseType::Architecture
    }

    async fn attempt(&self, ctx: &PhaseContext<'_>) -> AttemptOutcome {
        let map = match load_map(ctx).await {
            Ok(map) => map,
            Err(outcome) => return outcome,
        };
        let analysis = map
            .phase(PhaseType::Planning, None)
            .and_then(|p| p.output.clone());
        let feedback = ctx.feedback_text();
        let prompt = prompts::build_architecture_prompt(
            ctx.description,
            analysis.as_deref(),
            feedback.as_deref(),
        );

        let response = match ctx.run_agent(ctx.request(AGENT, "architecture", prompt)).await {
            Ok(response) => response,
            Err(e) => return agent_failure_outcome(e),
        };

        let plan = match parse_plan(&response.output).and_then(|p| resolve_plan(&p)) {
            Ok(plan) => plan,
            Err(violation) => return AttemptOutcome::RetryableViolation(violation),
        };

        if let Err(e) = self.record(ctx, &plan).await {
            return AttemptOutcome::Fatal(e);
        }

        info!(
            task_id = %ctx.task_id,
            epics = plan.epics.len(),
            stories = plan.stories.len(),
            workers = plan.team.len(),
            "Recorded team plan"
        );
        AttemptOutcome::Success(PhaseOutput::text(format!(
            "{} epic(s), {} story(ies), {} worker(s)",
            plan.epics.len(),
            plan.stories.len(),
            plan.team.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::engine::TaskOutcome;
    use crate::events::replay;
    use crate::events::EventLog;
    use crate::testing::{Harness, reply};

    const PLAN: &str = r#"Here is the plan:
```json
{
  "team": [{"worker_id": "Dev-1", "role": "backend"}, {"worker_id": "dev-2", "role": "frontend"}],
  "epics": [
    {"id": "API", "title": "API", "repository": "acme/api",
     "stories": [{"id": "S1", "title": "Login endpoint", "files": ["src/auth.rs"], "assigned_to": "dev-1"}]},
    {"title": "Web App",
     "stories": [{"title": "Login form", "files": ["web/login.tsx"], "worker": "dev-2"},
                 {"id": "s3", "title": "Styles", "files": ["web/app.css"]}]}
  ]
}
```"#;

    const OVERLAPPING: &str = r#"{"epics": [{"id": "api", "stories": [
        {"id": "s1", "files": ["src/lib.rs"], "assigned_to": "dev-1"},
        {"id": "s2", "files": ["./src/lib.rs"], "assigned_to": "dev-2"}]}]}"#;

    #[test]
    fn resolves_ids_and_fills_in_workers() {
        let plan = resolve_plan(&parse_plan(PLAN).unwrap()).unwrap();
        let epic_ids: Vec<_> = plan.epics.iter().map(|e| e.epic_id.as_str()).collect();
        assert_eq!(epic_ids, vec!["api", "web-app"]);
        assert_eq!(plan.epics[0].branch_name.as_deref(), Some("epic/api"));
        assert_eq!(plan.stories.len(), 3);
        assert_eq!(plan.stories[2].1.assigned_to.as_deref(), Some("worker-s3"));
        assert_eq!(plan.team.len(), 3);
        assert_eq!(plan.assignments().get("s1").map(String::as_str), Some("dev-1"));
    }

    #[test]
    fn overlapping_files_are_a_violation() {
        let err = resolve_plan(&parse_plan(OVERLAPPING).unwrap()).unwrap_err();
        assert_eq!(err.code, ViolationCode::FileOverlap);
        assert_eq!(err.details, vec!["api:src/lib.rs: s1, s2".to_string()]);
    }

    #[test]
    fn common_file_names_across_repositories_are_allowed() {
        let plan = r#"{"epics": [
            {"id": "api", "repository": "acme/api", "stories": [
                {"id": "s1", "files": ["README.md"], "assigned_to": "dev-1"}]},
            {"id": "web", "repository": "acme/web", "stories": [
                {"id": "s2", "files": ["README.md"], "assigned_to": "dev-2"}]}]}"#;
        let plan = resolve_plan(&parse_plan(plan).unwrap()).unwrap();
        assert_eq!(plan.stories.len(), 2);
    }

    #[test]
    fn duplicate_worker_is_a_violation() {
        let plan = r#"{"epics": [{"id": "api", "stories": [
            {"id": "s1", "files": ["a.rs"], "assigned_to": "dev-1"},
            {"id": "s2", "files": ["b.rs"], "assigned_to": "DEV-1"}]}]}"#;
        let err = resolve_plan(&parse_plan(plan).unwrap()).unwrap_err();
        assert_eq!(err.code, ViolationCode::DuplicateWorkerAssignment);
        assert_eq!(err.details, vec!["dev-1: s1, s2".to_string()]);
    }

    #[test]
    fn unparseable_reply_is_invalid_plan() {
        assert_eq!(parse_plan("no json here").unwrap_err().code, ViolationCode::InvalidPlan);
        let empty = resolve_plan(&parse_plan("{\"epics\": []}").unwrap()).unwrap_err();
        assert_eq!(empty.code, ViolationCode::InvalidPlan);
    }

    #[tokio::test]
    async fn records_plan_and_events_after_a_rejected_attempt() {
        let h = Harness::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        h.executor.respond_with(move |_| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(reply(if n == 0 { OVERLAPPING } else { PLAN }, 0.3))
        });
        let engine = h.engine().with_body(Arc::new(ArchitecturePhase));

        let outcome = engine.run("t1", "auth", &[PhaseType::Architecture]).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
        let prompts: Vec<String> = h
            .executor
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.prompt.clone())
            .collect();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("src/lib.rs: s1, s2"));

        let map = h.store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.epics().len(), 2);
        assert_eq!(map.story_ids().len(), 3);
        assert_eq!(map.team_composition.len(), 3);
        assert_eq!(map.epic("api").unwrap().target_repository.as_deref(), Some("acme/api"));

        // The log alone rebuilds the same structure.
        let events = h.events.get_events("t1").await.unwrap();
        let rebuilt = replay::rebuild("t1", &events);
        assert_eq!(rebuilt.story_ids(), map.story_ids());
        assert_eq!(rebuilt.team_composition, map.team_composition);
        assert_eq!(rebuilt.story_assignments, map.story_assignments);
    }
}
