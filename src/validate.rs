//! Pre-dispatch checks on a batch of stories.
//!
//! Both checks run before any sandbox is created: a batch where two stories
//! touch the same file, or where one worker holds several stories, would
//! otherwise race inside the implementation phase. Files are compared within
//! a repository; `README.md` in two different repositories is two files.

use std::collections::BTreeMap;

use anvil_common::ids::{normalize_repo_key, normalize_story_id, normalize_worker_id};
use anvil_common::ExecutionMap;

use crate::engine::attempt::{Violation, ViolationCode};

/// A story as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryPlan {
    pub story_id: String,
    pub epic_id: String,
    /// Target repository of the story's epic.
    pub repository: Option<String>,
    pub worker_id: Option<String>,
    pub files: Vec<String>,
}

impl StoryPlan {
    /// Plans for every story recorded in `map`, in plan order.
    pub fn from_map(map: &ExecutionMap) -> Vec<StoryPlan> {
        map.epics()
            .iter()
            .flat_map(|epic| {
                epic.stories().iter().map(move |story| StoryPlan {
                    story_id: story.story_id.clone(),
                    epic_id: epic.epic_id.clone(),
                    repository: epic.target_repository.clone(),
                    worker_id: story.assigned_to.clone(),
                    files: story.files.clone(),
                })
            })
            .collect()
    }

    /// The working tree the story's files live in: its repository, or its
    /// epic when the epic names none.
    fn scope(&self) -> String {
        match &self.repository {
            Some(repo) => normalize_repo_key(repo),
            None => self.epic_id.clone(),
        }
    }
}

/// A file within one working tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScopedFile {
    pub scope: String,
    pub path: String,
}

impl std::fmt::Display for ScopedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.path)
    }
}

fn normalize_path(path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let mut path = path.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.to_string()
}

/// Every file claimed by more than one story, with the claiming story ids.
pub fn file_conflicts(stories: &[StoryPlan]) -> BTreeMap<ScopedFile, Vec<String>> {
    let mut owners: BTreeMap<ScopedFile, Vec<String>> = BTreeMap::new();
    for story in stories {
        let story_id = normalize_story_id(&story.story_id);
        let scope = story.scope();
        for file in &story.files {
            let claimed = owners
                .entry(ScopedFile {
                    scope: scope.clone(),
                    path: normalize_path(file),
                })
                .or_default();
            if !claimed.contains(&story_id) {
                claimed.push(story_id.clone());
            }
        }
    }
    owners.retain(|_, ids| ids.len() > 1);
    owners
}

/// Reject a batch whose stories' file sets intersect. The violation lists
/// every conflicting file with the stories that claim it.
pub fn check_file_overlap(stories: &[StoryPlan]) -> Result<(), Violation> {
    let conflicts = file_conflicts(stories);
    if conflicts.is_empty() {
        return Ok(());
    }

    let details: Vec<String> = conflicts
        .iter()
        .map(|(file, ids)| format!("{file}: {}", ids.join(", ")))
        .collect();
    Err(Violation::new(
        ViolationCode::FileOverlap,
        format!("{} file(s) are claimed by more than one story", conflicts.len()),
    )
    .with_details(details))
}

/// Reject a batch where a worker is assigned more than one story.
pub fn check_worker_assignments(stories: &[StoryPlan]) -> Result<(), Violation> {
    let mut by_worker: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for story in stories {
        if let Some(worker) = &story.worker_id {
            by_worker
                .entry(normalize_worker_id(worker))
                .or_default()
                .push(normalize_story_id(&story.story_id));
        }
    }
    by_worker.retain(|_, ids| ids.len() > 1);
    if by_worker.is_empty() {
        return Ok(());
    }

    let details: Vec<String> = by_worker
        .iter()
        .map(|(worker, ids)| format!("{worker}: {}", ids.join(", ")))
        .collect();
    Err(Violation::new(
        ViolationCode::DuplicateWorkerAssignment,
        format!("{} worker(s) are assigned more than one story", by_worker.len()),
    )
    .with_details(details))
}

/// Run both checks, worker assignments first.
pub fn validate_batch(stories: &[StoryPlan]) -> Result<(), Violation> {
    check_worker_assignments(stories)?;
    check_file_overlap(stories)
}
