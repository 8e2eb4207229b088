//! Immutable structural facts appended to a task's event log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{PhaseType, TeamMember};
use crate::stage::ProgressStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskStarted,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    PhaseSkipped,
    PhaseWaitingApproval,
    EpicCreated,
    StoryCreated,
    TeamCompositionDefined,
    StoryProgress,
    EpicCompleted,
    TaskCancelled,
    TaskCompleted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TaskStarted => "task_started",
            EventType::PhaseStarted => "phase_started",
            EventType::PhaseCompleted => "phase_completed",
            EventType::PhaseFailed => "phase_failed",
            EventType::PhaseSkipped => "phase_skipped",
            EventType::PhaseWaitingApproval => "phase_waiting_approval",
            EventType::EpicCreated => "epic_created",
            EventType::StoryCreated => "story_created",
            EventType::TeamCompositionDefined => "team_composition_defined",
            EventType::StoryProgress => "story_progress",
            EventType::EpicCompleted => "epic_completed",
            EventType::TaskCancelled => "task_cancelled",
            EventType::TaskCompleted => "task_completed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable fact about a task. Never mutated after creation; derived
/// state only changes by appending another event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub task_id: String,
    pub event_type: EventType,
    pub agent_name: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        task_id: &str,
        event_type: EventType,
        agent_name: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            event_type,
            agent_name: agent_name.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Build an event from a typed payload.
    pub fn with_payload<P: Serialize>(
        task_id: &str,
        event_type: EventType,
        agent_name: &str,
        payload: &P,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(
            task_id,
            event_type,
            agent_name,
            serde_json::to_value(payload)?,
        ))
    }

    /// `(event_type, payload.id)`: append is at-least-once, so replay treats
    /// two events with the same key as one fact.
    pub fn dedup_key(&self) -> Option<(EventType, String)> {
        self.payload
            .get("id")
            .and_then(|v| v.as_str())
            .map(|id| (self.event_type, id.to_string()))
    }

    pub fn payload_as<P: DeserializeOwned>(&self) -> serde_json::Result<P> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicCreatedPayload {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub target_repository: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryCreatedPayload {
    pub id: String,
    pub epic_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub assigned_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamCompositionPayload {
    /// Stable id for deduplication, normally the task id.
    pub id: String,
    pub members: Vec<TeamMember>,
    /// story id -> worker id
    #[serde(default)]
    pub assignments: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCompletedPayload {
    /// The phase key (`implementation` or `implementation:<epic>`).
    pub id: String,
    pub phase: PhaseType,
    #[serde(default)]
    pub epic_id: Option<String>,
    #[serde(default)]
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryProgressPayload {
    /// `<story_id>:<stage>`, so each stage transition is one fact.
    pub id: String,
    pub epic_id: String,
    pub story_id: String,
    pub stage: ProgressStage,
    #[serde(default)]
    pub worker: Option<String>,
}

impl StoryProgressPayload {
    pub fn new(epic_id: &str, story_id: &str, stage: ProgressStage, worker: Option<&str>) -> Self {
        Self {
            id: format!("{}:{}", story_id, stage.as_str()),
            epic_id: epic_id.to_string(),
            story_id: story_id.to_string(),
            stage,
            worker: worker.map(str::to_string),
        }
    }
}
