//! Rebuild execution-map structure from the event log.
//!
//! Appends are at-least-once, so events are deduplicated on
//! `(event_type, payload.id)` before they are applied. Applying is
//! monotonic: it adds epics, stories and completions but never moves a
//! recorded story stage backwards or un-completes a phase.

use std::collections::HashSet;

use anvil_common::ids::{normalize_story_id, normalize_worker_id};
use anvil_common::{
    EpicCreatedPayload, EpicExecution, Event, EventType, ExecutionMap, PhaseCompletedPayload,
    PhaseStatus, ProgressStage, StoryCreatedPayload, StoryExecution, StoryProgressPayload,
    TeamCompositionPayload, WorkStatus,
};
use serde::de::DeserializeOwned;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub duplicates: usize,
    pub malformed: usize,
}

/// A fresh execution map built only from events.
pub fn rebuild(task_id: &str, events: &[Event]) -> ExecutionMap {
    let mut map = ExecutionMap::new(task_id);
    apply(&mut map, events);
    map
}

fn payload<P: DeserializeOwned>(event: &Event, stats: &mut ReplayStats) -> Option<P> {
    match event.payload_as::<P>() {
        Ok(p) => Some(p),
        Err(e) => {
            stats.malformed += 1;
            warn!(
                task_id = %event.task_id,
                event_type = %event.event_type,
                error = %e,
                "Skipping event with malformed payload"
            );
            None
        }
    }
}

/// Apply structural events to `map`.
pub fn apply(map: &mut ExecutionMap, events: &[Event]) -> ReplayStats {
    let mut stats = ReplayStats::default();
    let mut seen = HashSet::new();

    for event in events {
        if let Some(key) = event.dedup_key()
            && !seen.insert(key)
        {
            stats.duplicates += 1;
            continue;
        }

        match event.event_type {
            EventType::EpicCreated => {
                let Some(p) = payload::<EpicCreatedPayload>(event, &mut stats) else {
                    continue;
                };
                let mut epic = EpicExecution::new(&p.id, &p.title);
                epic.target_repository = p.target_repository;
                epic.branch_name = p.branch_name;
                map.upsert_epic(epic);
            }
            EventType::StoryCreated => {
                let Some(p) = payload::<StoryCreatedPayload>(event, &mut stats) else {
                    continue;
                };
                if map.epic(&p.epic_id).is_none() {
                    map.upsert_epic(EpicExecution::new(&p.epic_id, ""));
                }
                let mut story = StoryExecution::new(&p.id, &p.title).with_files(p.files);
                if let Some(worker) = &p.assigned_to {
                    story = story.assigned(worker);
                }
                if let Err(e) = map.upsert_story(&p.epic_id, story) {
                    stats.malformed += 1;
                    warn!(task_id = %event.task_id, error = %e, "Skipping conflicting story event");
                    continue;
                }
            }
            EventType::TeamCompositionDefined => {
                let Some(p) = payload::<TeamCompositionPayload>(event, &mut stats) else {
                    continue;
                };
                map.team_composition = p.members;
                for (story, worker) in p.assignments {
                    map.story_assignments
                        .insert(normalize_story_id(&story), normalize_worker_id(&worker));
                }
            }
            EventType::PhaseCompleted => {
                let Some(p) = payload::<PhaseCompletedPayload>(event, &mut stats) else {
                    continue;
                };
                let entry = map.phase_entry(p.phase, p.epic_id.as_deref());
                if entry.status != PhaseStatus::Completed {
                    entry.status = PhaseStatus::Completed;
                    entry.completed_at = Some(event.timestamp);
                }
            }
            EventType::StoryProgress => {
                let Some(p) = payload::<StoryProgressPayload>(event, &mut stats) else {
                    continue;
                };
                if let Some(story) = map.story_mut(&p.epic_id, &p.story_id)
                    && p.stage > story.progress_stage
                {
                    story.progress_stage = p.stage;
                    if p.stage == ProgressStage::Completed {
                        story.status = WorkStatus::Completed;
                    } else if story.status == WorkStatus::Pending {
                        story.status = WorkStatus::InProgress;
                    }
                }
            }
            _ => continue,
        }
        stats.applied += 1;
    }

    let epic_ids: Vec<String> = map.epics().iter().map(|e| e.epic_id.clone()).collect();
    for id in epic_ids {
        if let Some(epic) = map.epic_mut(&id) {
            epic.refresh_status();
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_common::{PhaseType, TeamMember};
    use std::collections::BTreeMap;

    fn ev<P: serde::Serialize>(event_type: EventType, payload: &P) -> Event {
        Event::with_payload("t1", event_type, "architect", payload).unwrap()
    }

    fn epic(id: &str) -> Event {
        ev(
            EventType::EpicCreated,
            &EpicCreatedPayload {
                id: id.into(),
                title: format!("{id} work"),
                target_repository: Some(format!("acme/{id}")),
                branch_name: Some(format!("epic/{id}")),
            },
        )
    }

    fn story(id: &str, epic_id: &str, worker: &str, files: &[&str]) -> Event {
        ev(
            EventType::StoryCreated,
            &StoryCreatedPayload {
                id: id.into(),
                epic_id: epic_id.into(),
                title: format!("story {id}"),
                files: files.iter().map(|f| f.to_string()).collect(),
                assigned_to: Some(worker.into()),
            },
        )
    }

    fn team() -> Event {
        ev(
            EventType::TeamCompositionDefined,
            &TeamCompositionPayload {
                id: "t1".into(),
                members: vec![
                    TeamMember::new("dev-1", "backend"),
                    TeamMember::new("dev-2", "frontend"),
                ],
                assignments: BTreeMap::from([
                    ("s1".to_string(), "dev-1".to_string()),
                    ("s2".to_string(), "dev-2".to_string()),
                ]),
            },
        )
    }

    #[test]
    fn rebuild_reconstructs_epics_stories_and_team() {
        let events = vec![
            epic("api"),
            epic("web"),
            story("s1", "api", "dev-1", &["src/api.rs"]),
            story("s2", "web", "dev-2", &["web/app.tsx"]),
            team(),
        ];
        let map = rebuild("t1", &events);

        assert_eq!(map.epics().len(), 2);
        let api = map.epic("api").unwrap();
        assert_eq!(api.target_repository.as_deref(), Some("acme/api"));
        assert_eq!(api.branch_name.as_deref(), Some("epic/api"));
        assert_eq!(api.stories().len(), 1);

        let (owner, s2) = map.find_story("s2").unwrap();
        assert_eq!(owner.epic_id, "web");
        assert_eq!(s2.files, vec!["web/app.tsx".to_string()]);
        assert_eq!(s2.assigned_to.as_deref(), Some("dev-2"));

        assert_eq!(map.team_composition.len(), 2);
        assert_eq!(map.story_assignments.get("s1").map(String::as_str), Some("dev-1"));
    }

    #[test]
    fn duplicate_events_are_applied_once() {
        let events = vec![
            epic("api"),
            epic("api"),
            story("s1", "api", "dev-1", &[]),
            story("s1", "api", "dev-1", &[]),
        ];
        let mut map = ExecutionMap::new("t1");
        let stats = apply(&mut map, &events);
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.duplicates, 2);
        assert_eq!(map.epic("api").unwrap().stories().len(), 1);
    }

    #[test]
    fn phase_completion_and_progress_are_restored() {
        let events = vec![
            epic("api"),
            story("s1", "api", "dev-1", &[]),
            ev(
                EventType::PhaseCompleted,
                &PhaseCompletedPayload {
                    id: "architecture".into(),
                    phase: PhaseType::Architecture,
                    epic_id: None,
                    cost: 1.0,
                },
            ),
            ev(
                EventType::StoryProgress,
                &StoryProgressPayload::new("api", "s1", ProgressStage::Pushed, Some("dev-1")),
            ),
            ev(
                EventType::StoryProgress,
                &StoryProgressPayload::new("api", "s1", ProgressStage::Committed, Some("dev-1")),
            ),
        ];
        let map = rebuild("t1", &events);
        assert!(map.is_phase_completed(PhaseType::Architecture, None));
        let s1 = map.story("api", "s1").unwrap();
        assert_eq!(s1.progress_stage, ProgressStage::Pushed);
        assert_eq!(s1.status, WorkStatus::InProgress);
        assert_eq!(map.epic("api").unwrap().status, WorkStatus::InProgress);
    }

    #[test]
    fn apply_keeps_existing_progress() {
        let mut map = ExecutionMap::new("t1");
        map.upsert_epic(EpicExecution::new("api", ""));
        map.upsert_story("api", StoryExecution::new("s1", "")).unwrap();
        map.story_mut("api", "s1").unwrap().progress_stage = ProgressStage::MergedToEpic;

        apply(&mut map, &[story("s1", "api", "dev-1", &["a.rs"])]);

        let s1 = map.story("api", "s1").unwrap();
        assert_eq!(s1.progress_stage, ProgressStage::MergedToEpic);
        assert_eq!(s1.files, vec!["a.rs".to_string()]);
    }

    #[test]
    fn malformed_payloads_are_counted_and_skipped() {
        let bad = Event::new("t1", EventType::EpicCreated, "architect", serde_json::json!({"title": 3}));
        let mut map = ExecutionMap::new("t1");
        let stats = apply(&mut map, &[bad, epic("api")]);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.applied, 1);
        assert_eq!(map.epics().len(), 1);
    }
}
