//! The execution map: a task's durable record of phase, epic and story progress.
//!
//! Epics and stories are only reachable through accessor methods keyed by
//! normalized id, so callers never walk or deep-copy the nested structure
//! themselves.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, DetailedError};
use crate::ids::{normalize_epic_id, normalize_story_id, normalize_worker_id};
use crate::stage::ProgressStage;

/// One stage of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Planning,
    Architecture,
    Implementation,
    Review,
    Integration,
}

impl PhaseType {
    /// The fixed order phases run and resume in.
    pub const ORDER: [PhaseType; 5] = [
        PhaseType::Planning,
        PhaseType::Architecture,
        PhaseType::Implementation,
        PhaseType::Review,
        PhaseType::Integration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseType::Planning => "planning",
            PhaseType::Architecture => "architecture",
            PhaseType::Implementation => "implementation",
            PhaseType::Review => "review",
            PhaseType::Integration => "integration",
        }
    }

    /// Phases whose progress is tracked per epic and per story.
    pub fn is_story_scoped(self) -> bool {
        matches!(self, PhaseType::Implementation | PhaseType::Review)
    }
}

impl std::fmt::Display for PhaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "planning" | "plan" | "analysis" => Ok(PhaseType::Planning),
            "architecture" | "architect" => Ok(PhaseType::Architecture),
            "implementation" | "implement" => Ok(PhaseType::Implementation),
            "review" => Ok(PhaseType::Review),
            "integration" | "integrate" => Ok(PhaseType::Integration),
            _ => Err(CommonError::UnknownVariant {
                kind: "phase",
                value: s.to_string(),
            }),
        }
    }
}

/// Key under which a phase (optionally scoped to one epic) is stored in
/// [`ExecutionMap::phases`].
pub fn phase_key(phase: PhaseType, epic_id: Option<&str>) -> String {
    match epic_id {
        Some(epic) => format!("{}:{}", phase.as_str(), normalize_epic_id(epic)),
        None => phase.as_str().to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
    WaitingApproval,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::NotStarted => "not_started",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::WaitingApproval => "waiting_approval",
        };
        f.write_str(s)
    }
}

/// Status of an epic or story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Failed)
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkStatus::Pending => "pending",
            WorkStatus::InProgress => "in_progress",
            WorkStatus::Completed => "completed",
            WorkStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Paused,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub phase_type: PhaseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    pub status: PhaseStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub cost: f64,
}

impl PhaseExecution {
    pub fn new(phase_type: PhaseType, epic_id: Option<&str>) -> Self {
        Self {
            phase_type,
            epic_id: epic_id.map(normalize_epic_id),
            status: PhaseStatus::NotStarted,
            attempts: 0,
            started_at: None,
            completed_at: None,
            error: None,
            output: None,
            cost: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryExecution {
    pub story_id: String,
    #[serde(default)]
    pub title: String,
    pub status: WorkStatus,
    pub progress_stage: ProgressStage,
    #[serde(default)]
    pub assigned_to: Option<String>,
    /// Files the story declared it will touch.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub last_commit_hash: Option<String>,
    #[serde(default)]
    pub files_modified: Option<Vec<String>>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StoryExecution {
    pub fn new(story_id: &str, title: &str) -> Self {
        Self {
            story_id: normalize_story_id(story_id),
            title: title.to_string(),
            status: WorkStatus::Pending,
            progress_stage: ProgressStage::NotStarted,
            assigned_to: None,
            files: Vec::new(),
            last_commit_hash: None,
            files_modified: None,
            session_token: None,
            cost: 0.0,
            updated_at: None,
        }
    }

    pub fn assigned(mut self, worker: &str) -> Self {
        self.assigned_to = Some(normalize_worker_id(worker));
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicExecution {
    pub epic_id: String,
    #[serde(default)]
    pub title: String,
    pub status: WorkStatus,
    #[serde(default)]
    pub tech_lead_completed: bool,
    #[serde(default)]
    stories: Vec<StoryExecution>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub target_repository: Option<String>,
    #[serde(default)]
    pub pull_request: Option<String>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: u64,
}

impl EpicExecution {
    pub fn new(epic_id: &str, title: &str) -> Self {
        Self {
            epic_id: normalize_epic_id(epic_id),
            title: title.to_string(),
            status: WorkStatus::Pending,
            tech_lead_completed: false,
            stories: Vec::new(),
            branch_name: None,
            target_repository: None,
            pull_request: None,
            cost: 0.0,
            tokens: 0,
        }
    }

    pub fn with_repository(mut self, repo: &str) -> Self {
        self.target_repository = Some(repo.to_string());
        self
    }

    pub fn stories(&self) -> &[StoryExecution] {
        &self.stories
    }

    pub fn story(&self, story_id: &str) -> Option<&StoryExecution> {
        let id = normalize_story_id(story_id);
        self.stories.iter().find(|s| s.story_id == id)
    }

    pub fn story_mut(&mut self, story_id: &str) -> Option<&mut StoryExecution> {
        let id = normalize_story_id(story_id);
        self.stories.iter_mut().find(|s| s.story_id == id)
    }

    /// True when the epic has stories and every one of them is terminal.
    pub fn all_stories_terminal(&self) -> bool {
        !self.stories.is_empty() && self.stories.iter().all(StoryExecution::is_terminal)
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Derive the epic status from its stories. An epic becomes terminal only
    /// once every story is; it is `Failed` if any story failed.
    pub fn refresh_status(&mut self) {
        if self.all_stories_terminal() {
            self.status = if self.stories.iter().any(|s| s.status == WorkStatus::Failed) {
                WorkStatus::Failed
            } else {
                WorkStatus::Completed
            };
        } else if self
            .stories
            .iter()
            .any(|s| s.progress_stage != ProgressStage::NotStarted)
        {
            self.status = WorkStatus::InProgress;
        }
    }

    pub fn story_cost(&self) -> f64 {
        self.stories.iter().map(|s| s.cost).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMember {
    pub worker_id: String,
    pub role: String,
}

impl TeamMember {
    pub fn new(worker_id: &str, role: &str) -> Self {
        Self {
            worker_id: normalize_worker_id(worker_id),
            role: role.to_string(),
        }
    }
}

/// Durable, task-scoped aggregate of phase/epic/story progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMap {
    pub task_id: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub current_phase: Option<PhaseType>,
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseExecution>,
    #[serde(default)]
    epics: Vec<EpicExecution>,
    #[serde(default)]
    pub team_composition: Vec<TeamMember>,
    /// story id -> worker id
    #[serde(default)]
    pub story_assignments: BTreeMap<String, String>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub overhead_cost: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub overhead_tokens: u64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub detailed_errors: Vec<DetailedError>,
    /// Phase keys an operator has approved.
    #[serde(default)]
    pub approvals: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionMap {
    pub fn new(task_id: &str) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            current_phase: None,
            phases: BTreeMap::new(),
            epics: Vec::new(),
            team_composition: Vec::new(),
            story_assignments: BTreeMap::new(),
            total_cost: 0.0,
            overhead_cost: 0.0,
            total_tokens: 0,
            overhead_tokens: 0,
            errors: Vec::new(),
            detailed_errors: Vec::new(),
            approvals: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    // ---------------------------------------------------------------------
    // Phases
    // ---------------------------------------------------------------------

    pub fn phase(&self, phase: PhaseType, epic_id: Option<&str>) -> Option<&PhaseExecution> {
        self.phases.get(&phase_key(phase, epic_id))
    }

    pub fn phase_status(&self, phase: PhaseType, epic_id: Option<&str>) -> PhaseStatus {
        self.phase(phase, epic_id)
            .map(|p| p.status)
            .unwrap_or_default()
    }

    pub fn is_phase_completed(&self, phase: PhaseType, epic_id: Option<&str>) -> bool {
        self.phase_status(phase, epic_id) == PhaseStatus::Completed
    }

    /// Get the phase record, creating a `NotStarted` one if missing.
    pub fn phase_entry(&mut self, phase: PhaseType, epic_id: Option<&str>) -> &mut PhaseExecution {
        self.phases
            .entry(phase_key(phase, epic_id))
            .or_insert_with(|| PhaseExecution::new(phase, epic_id))
    }

    /// Task-level phases (not epic-scoped) that are completed, in pipeline order.
    pub fn completed_phases(&self) -> Vec<PhaseType> {
        PhaseType::ORDER
            .iter()
            .copied()
            .filter(|p| self.is_phase_completed(*p, None))
            .collect()
    }

    pub fn is_approved(&self, phase: PhaseType, epic_id: Option<&str>) -> bool {
        self.approvals.contains(&phase_key(phase, epic_id))
    }

    // ---------------------------------------------------------------------
    // Epics and stories
    // ---------------------------------------------------------------------

    pub fn epics(&self) -> &[EpicExecution] {
        &self.epics
    }

    pub fn epic(&self, epic_id: &str) -> Option<&EpicExecution> {
        let id = normalize_epic_id(epic_id);
        self.epics.iter().find(|e| e.epic_id == id)
    }

    pub fn epic_mut(&mut self, epic_id: &str) -> Option<&mut EpicExecution> {
        let id = normalize_epic_id(epic_id);
        self.epics.iter_mut().find(|e| e.epic_id == id)
    }

    /// Insert an epic, or refresh the descriptive fields of an existing one
    /// while keeping its stories and progress.
    pub fn upsert_epic(&mut self, epic: EpicExecution) -> &mut EpicExecution {
        let idx = match self.epics.iter().position(|e| e.epic_id == epic.epic_id) {
            Some(idx) => {
                let existing = &mut self.epics[idx];
                if !epic.title.is_empty() {
                    existing.title = epic.title;
                }
                if epic.target_repository.is_some() {
                    existing.target_repository = epic.target_repository;
                }
                if epic.branch_name.is_some() {
                    existing.branch_name = epic.branch_name;
                }
                idx
            }
            None => {
                self.epics.push(epic);
                self.epics.len() - 1
            }
        };
        &mut self.epics[idx]
    }

    pub fn story(&self, epic_id: &str, story_id: &str) -> Option<&StoryExecution> {
        self.epic(epic_id)?.story(story_id)
    }

    pub fn story_mut(&mut self, epic_id: &str, story_id: &str) -> Option<&mut StoryExecution> {
        self.epic_mut(epic_id)?.story_mut(story_id)
    }

    /// Find a story by id alone, returning the epic it belongs to.
    pub fn find_story(&self, story_id: &str) -> Option<(&EpicExecution, &StoryExecution)> {
        self.epics
            .iter()
            .find_map(|e| e.story(story_id).map(|s| (e, s)))
    }

    /// Insert or refresh a story under `epic_id`. A story belongs to exactly
    /// one epic: registering it under a second epic is rejected.
    pub fn upsert_story(
        &mut self,
        epic_id: &str,
        story: StoryExecution,
    ) -> Result<&mut StoryExecution, CommonError> {
        let epic_key = normalize_epic_id(epic_id);
        if let Some((owner, _)) = self.find_story(&story.story_id)
            && owner.epic_id != epic_key
        {
            return Err(CommonError::StoryInOtherEpic {
                story_id: story.story_id,
                epic_id: owner.epic_id.clone(),
            });
        }

        if self.epic(&epic_key).is_none() {
            return Err(CommonError::UnknownEpic { epic_id: epic_key });
        }

        if let Some(worker) = &story.assigned_to {
            self.story_assignments
                .insert(story.story_id.clone(), worker.clone());
        }

        let epic = self
            .epic_mut(&epic_key)
            .ok_or_else(|| CommonError::UnknownEpic {
                epic_id: epic_key.clone(),
            })?;

        let idx = match epic.stories.iter().position(|s| s.story_id == story.story_id) {
            Some(idx) => {
                let existing = &mut epic.stories[idx];
                if !story.title.is_empty() {
                    existing.title = story.title;
                }
                if story.assigned_to.is_some() {
                    existing.assigned_to = story.assigned_to;
                }
                if !story.files.is_empty() {
                    existing.files = story.files;
                }
                idx
            }
            None => {
                epic.stories.push(story);
                epic.stories.len() - 1
            }
        };
        Ok(&mut epic.stories[idx])
    }

    /// All `(epic_id, story_id)` pairs in plan order.
    pub fn story_ids(&self) -> Vec<(String, String)> {
        self.epics
            .iter()
            .flat_map(|e| {
                e.stories
                    .iter()
                    .map(move |s| (e.epic_id.clone(), s.story_id.clone()))
            })
            .collect()
    }

    // ---------------------------------------------------------------------
    // Cost accounting
    // ---------------------------------------------------------------------

    /// Cost and tokens spent outside any epic (planning, integration, ...).
    pub fn add_overhead(&mut self, cost: f64, tokens: u64) {
        self.overhead_cost += cost;
        self.overhead_tokens += tokens;
        self.recompute_totals();
    }

    /// Re-derive `total_cost` / `total_tokens` from epic costs plus overhead.
    pub fn recompute_totals(&mut self) {
        self.total_cost = self.epics.iter().map(|e| e.cost).sum::<f64>() + self.overhead_cost;
        self.total_tokens = self.epics.iter().map(|e| e.tokens).sum::<u64>() + self.overhead_tokens;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
