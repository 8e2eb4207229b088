//! Where to pick a task back up after a restart.

use anvil_common::{EpicExecution, ExecutionMap, PhaseType, ProgressStage, StoryExecution};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumptionPoint {
    /// First phase not completed; `None` when every phase is done.
    pub resume_from_phase: Option<PhaseType>,
    pub resume_from_epic: Option<String>,
    pub resume_from_story: Option<String>,
    /// Stage already reached by `resume_from_story`.
    pub resume_from_stage: Option<ProgressStage>,
    pub completed_phases: Vec<PhaseType>,
    pub completed_epics: Vec<String>,
    pub completed_stories: Vec<String>,
}

impl ResumptionPoint {
    pub fn is_finished(&self) -> bool {
        self.resume_from_phase.is_none()
    }
}

/// A story is done for a phase once it no longer needs that phase's work.
fn story_done(phase: PhaseType, story: &StoryExecution) -> bool {
    match phase {
        PhaseType::Implementation => {
            story.is_terminal() || story.progress_stage.is_at_least(ProgressStage::MergedToEpic)
        }
        _ => story.is_terminal(),
    }
}

fn epic_done(map: &ExecutionMap, phase: PhaseType, epic: &EpicExecution) -> bool {
    map.is_phase_completed(phase, Some(&epic.epic_id))
        || (!epic.stories().is_empty() && epic.stories().iter().all(|s| story_done(phase, s)))
}

/// Compute the resumption point from one snapshot.
///
/// Phases are walked in pipeline order; the first phase not completed at
/// task level is the resume phase. For story-scoped phases the first
/// unfinished epic and its first unfinished story are reported too.
/// Completed epics and stories are judged against the resume phase (or
/// against review when everything is done).
pub fn compute(map: &ExecutionMap) -> ResumptionPoint {
    let completed_phases = map.completed_phases();
    let resume_from_phase = PhaseType::ORDER
        .iter()
        .copied()
        .find(|p| !map.is_phase_completed(*p, None));

    let judge_phase = match resume_from_phase {
        Some(p) if p.is_story_scoped() => p,
        _ => PhaseType::Review,
    };

    let completed_epics = map
        .epics()
        .iter()
        .filter(|e| epic_done(map, judge_phase, e))
        .map(|e| e.epic_id.clone())
        .collect();
    let completed_stories = map
        .epics()
        .iter()
        .flat_map(|e| e.stories())
        .filter(|s| story_done(judge_phase, s))
        .map(|s| s.story_id.clone())
        .collect();

    let mut point = ResumptionPoint {
        resume_from_phase,
        resume_from_epic: None,
        resume_from_story: None,
        resume_from_stage: None,
        completed_phases,
        completed_epics,
        completed_stories,
    };

    if let Some(phase) = resume_from_phase.filter(|p| p.is_story_scoped())
        && let Some(epic) = map.epics().iter().find(|e| !epic_done(map, phase, e))
    {
        point.resume_from_epic = Some(epic.epic_id.clone());
        if let Some(story) = epic.stories().iter().find(|s| !story_done(phase, s)) {
            point.resume_from_story = Some(story.story_id.clone());
            point.resume_from_stage = Some(story.progress_stage);
        }
    }

    point
}
