//! Decide whether a phase already ran.
//!
//! The snapshot answers first. When it has no record the event log is
//! consulted, since a crash between appending `phase_completed` and writing
//! the snapshot leaves the log ahead; the snapshot is repaired in that case.

use std::sync::Arc;

use anvil_common::{
    Event, EventType, PhaseCompletedPayload, PhaseStatus, PhaseType, phase_key,
};
use anvil_common::ids::normalize_epic_id;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::StoreError;
use crate::events::EventLog;
use crate::memory::ExecutionMemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipSource {
    Snapshot,
    /// Every epic completed the phase individually.
    EpicRollup,
    EventLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Run,
    Skip(SkipSource),
}

impl SkipDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, SkipDecision::Skip(_))
    }
}

pub struct SkipLogic {
    store: Arc<ExecutionMemoryStore>,
    events: Option<Arc<dyn EventLog>>,
}

impl SkipLogic {
    pub fn new(store: Arc<ExecutionMemoryStore>, events: Option<Arc<dyn EventLog>>) -> Self {
        Self { store, events }
    }

    async fn events_for(&self, task_id: &str) -> Vec<Event> {
        let Some(log) = &self.events else {
            return Vec::new();
        };
        match log.get_events(task_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Event log unavailable for skip check");
                Vec::new()
            }
        }
    }

    /// Whether `phase` (or `phase` for one epic) is already completed.
    pub async fn check(
        &self,
        task_id: &str,
        phase: PhaseType,
        epic_id: Option<&str>,
    ) -> Result<SkipDecision, StoreError> {
        let Some(map) = self.store.load(task_id).await? else {
            return Ok(SkipDecision::Run);
        };

        if map.is_phase_completed(phase, epic_id) {
            return Ok(SkipDecision::Skip(SkipSource::Snapshot));
        }

        if epic_id.is_none()
            && phase.is_story_scoped()
            && !map.epics().is_empty()
            && map
                .epics()
                .iter()
                .all(|e| map.is_phase_completed(phase, Some(&e.epic_id)))
        {
            return Ok(SkipDecision::Skip(SkipSource::EpicRollup));
        }

        let wanted_epic = epic_id.map(normalize_epic_id);
        let logged = self.events_for(task_id).await.into_iter().any(|event| {
            event.event_type == EventType::PhaseCompleted
                && event
                    .payload_as::<PhaseCompletedPayload>()
                    .map(|p| p.phase == phase && p.epic_id.map(|e| normalize_epic_id(&e)) == wanted_epic)
                    .unwrap_or(false)
        });
        if !logged {
            return Ok(SkipDecision::Run);
        }

        info!(
            task_id = %task_id,
            phase = %phase_key(phase, epic_id),
            "Snapshot missed a logged completion; repairing"
        );
        self.store
            .update(task_id, |map| {
                let entry = map.phase_entry(phase, epic_id);
                entry.status = PhaseStatus::Completed;
                if entry.completed_at.is_none() {
                    entry.completed_at = Some(chrono::Utc::now());
                }
                Ok(())
            })
            .await?;
        Ok(SkipDecision::Skip(SkipSource::EventLog))
    }

    /// After skipping `phase`, make sure the structure later phases read
    /// (epics, stories, team) is present, replaying the event log if the
    /// snapshot lost it. Returns whether anything was restored.
    pub async fn restore_after_skip(
        &self,
        task_id: &str,
        phase: PhaseType,
    ) -> Result<bool, StoreError> {
        if phase == PhaseType::Planning || self.events.is_none() {
            return Ok(false);
        }
        let has_structure = self
            .store
            .load(task_id)
            .await?
            .map(|m| !m.epics().is_empty())
            .unwrap_or(false);
        if has_structure {
            return Ok(false);
        }

        let logged_structure = self
            .events_for(task_id)
            .await
            .iter()
            .any(|e| e.event_type == EventType::EpicCreated);
        if !logged_structure {
            return Ok(false);
        }

        let stats = self.store.rebuild_from_events(task_id).await?;
        Ok(stats.applied > 0)
    }
}
