//! Durable execution memory.
//!
//! Each task owns a directory under the store root:
//!
//! ```text
//! <root>/<task_id>/
//!   execution-map.json             primary snapshot
//!   execution-map.checkpoint.json  copy written after every primary write
//!   summary.txt                    operator view, regenerated on write
//!   events.jsonl                   event log (see crate::events)
//!   .lock                          advisory lock file
//! ```
//!
//! Writes replace the primary atomically (temp file, fsync, rename), then the
//! checkpoint, then hand the snapshot to a background replicator that copies
//! it to the [`BackupStore`]. Reads walk primary, checkpoint, backup and
//! restore whatever they find into the primary. Mutations run under a
//! per-task async mutex plus an `fs2` advisory lock so two processes never
//! interleave read-modify-write cycles on one task.

pub mod backup;
pub mod classify;
pub mod resume;
pub mod summary;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anvil_common::ids::normalize_worker_id;
use anvil_common::{
    CommonError, DetailedError, EpicExecution, ExecutionMap, PhaseStatus, PhaseType,
    ProgressStage, StoryExecution, TaskStatus, WorkStatus, phase_key,
};
use chrono::Utc;
use dashmap::DashMap;
use fs2::FileExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::StoreError;
use crate::events::EventLog;
use crate::events::replay::{self, ReplayStats};

pub use backup::{BackupStore, DirectoryBackup, InMemoryBackup};
pub use resume::ResumptionPoint;

pub const PRIMARY_FILE: &str = "execution-map.json";
pub const CHECKPOINT_FILE: &str = "execution-map.checkpoint.json";
pub const SUMMARY_FILE: &str = "summary.txt";
const LOCK_FILE: &str = ".lock";

/// Who reports a story stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Reporter {
    /// No identity; only unassigned stories accept it.
    #[default]
    Unattributed,
    /// A story worker. Advances stories it owns, and claims unassigned ones.
    Worker(String),
    /// The review judge. Records review stages on any story.
    Judge,
}

/// Metadata recorded alongside a story stage.
#[derive(Debug, Clone, Default)]
pub struct StoryProgress {
    pub reporter: Reporter,
    pub commit_hash: Option<String>,
    pub files_modified: Option<Vec<String>>,
    pub session_token: Option<String>,
    pub cost: f64,
    pub tokens: u64,
}

impl StoryProgress {
    pub fn by(worker: &str) -> Self {
        Self {
            reporter: Reporter::Worker(worker.to_string()),
            ..Self::default()
        }
    }

    pub fn judge() -> Self {
        Self {
            reporter: Reporter::Judge,
            ..Self::default()
        }
    }
}

/// Holds a task's in-process mutex and its on-disk advisory lock.
struct TaskGuard {
    _guard: OwnedMutexGuard<()>,
    file: File,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Latest-wins background copy to the backup store.
#[derive(Default)]
struct Replicator {
    pending: DashMap<String, ExecutionMap>,
    gates: DashMap<String, Arc<Mutex<()>>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

enum Tier {
    Missing,
    Corrupt(serde_json::Error),
    Found(Box<ExecutionMap>),
}

pub struct ExecutionMemoryStore {
    root: PathBuf,
    backup: Option<Arc<dyn BackupStore>>,
    events: Option<Arc<dyn EventLog>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    replicator: Arc<Replicator>,
}

impl ExecutionMemoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backup: None,
            events: None,
            locks: DashMap::new(),
            replicator: Arc::new(Replicator::default()),
        }
    }

    pub fn with_backup(mut self, backup: Arc<dyn BackupStore>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Event log consulted when a task has no snapshot anywhere.
    pub fn with_event_log(mut self, events: Arc<dyn EventLog>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    pub fn primary_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(PRIMARY_FILE)
    }

    pub fn checkpoint_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(CHECKPOINT_FILE)
    }

    pub fn summary_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(SUMMARY_FILE)
    }

    // ---------------------------------------------------------------------
    // Locking
    // ---------------------------------------------------------------------

    async fn lock_task(&self, task_id: &str) -> Result<TaskGuard, StoreError> {
        validate_task_id(task_id)?;
        let mutex = self
            .locks
            .entry(task_id.to_string())
            .or_default()
            .value()
            .clone();
        let guard = mutex.lock_owned().await;

        let dir = self.task_dir(task_id);
        let lock_err = |message: String| StoreError::Lock {
            task_id: task_id.to_string(),
            message,
        };
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            std::fs::create_dir_all(&dir)?;
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(dir.join(LOCK_FILE))?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|e| lock_err(e.to_string()))?
        .map_err(|e| lock_err(e.to_string()))?;

        Ok(TaskGuard {
            _guard: guard,
            file,
        })
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    async fn read_tier(&self, task_id: &str, path: &Path) -> Result<Tier, StoreError> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Tier::Missing),
            Err(source) => {
                return Err(StoreError::ReadFailed {
                    task_id: task_id.to_string(),
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Ok(match serde_json::from_slice(&content) {
            Ok(map) => Tier::Found(Box::new(map)),
            Err(e) => Tier::Corrupt(e),
        })
    }

    async fn load_unlocked(&self, task_id: &str) -> Result<Option<ExecutionMap>, StoreError> {
        let primary = self.primary_path(task_id);
        let mut primary_corrupt = None;
        match self.read_tier(task_id, &primary).await? {
            Tier::Found(map) => return Ok(Some(*map)),
            Tier::Corrupt(e) => {
                warn!(task_id = %task_id, error = %e, "Primary execution map is corrupt");
                primary_corrupt = Some(e);
            }
            Tier::Missing => {}
        }

        let checkpoint = self.checkpoint_path(task_id);
        match self.read_tier(task_id, &checkpoint).await? {
            Tier::Found(map) => {
                info!(task_id = %task_id, "Restoring execution map from checkpoint");
                self.write_local(&map).await?;
                return Ok(Some(*map));
            }
            Tier::Corrupt(e) => {
                warn!(task_id = %task_id, error = %e, "Checkpoint execution map is corrupt");
            }
            Tier::Missing => {}
        }

        if let Some(backup) = &self.backup {
            match backup.load(task_id).await {
                Ok(Some(map)) => {
                    info!(task_id = %task_id, "Restoring execution map from backup");
                    self.write_local(&map).await?;
                    return Ok(Some(map));
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "Backup read failed"),
            }
        }

        match primary_corrupt {
            Some(source) => Err(StoreError::Corrupt {
                path: primary,
                source,
            }),
            None => Ok(None),
        }
    }

    /// Load a task's map from the first usable tier.
    pub async fn load(&self, task_id: &str) -> Result<Option<ExecutionMap>, StoreError> {
        let _guard = self.lock_task(task_id).await?;
        self.load_unlocked(task_id).await
    }

    async fn load_required(&self, task_id: &str) -> Result<ExecutionMap, StoreError> {
        self.load_unlocked(task_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                task_id: task_id.to_string(),
            })
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    async fn write_local(&self, map: &ExecutionMap) -> Result<(), StoreError> {
        let task_id = map.task_id.as_str();
        let json = serde_json::to_vec_pretty(map).map_err(|source| StoreError::Serialize {
            task_id: task_id.to_string(),
            source,
        })?;

        for path in [self.primary_path(task_id), self.checkpoint_path(task_id)] {
            write_atomic(&path, &json)
                .await
                .map_err(|source| StoreError::WriteFailed {
                    task_id: task_id.to_string(),
                    path: path.clone(),
                    source,
                })?;
        }

        let summary_path = self.summary_path(task_id);
        if let Err(e) = tokio::fs::write(&summary_path, summary::render(map)).await {
            warn!(task_id = %task_id, error = %e, "Failed to write summary");
        }
        Ok(())
    }

    fn replicate(&self, map: &ExecutionMap) {
        let Some(backup) = self.backup.clone() else {
            return;
        };
        let task_id = map.task_id.clone();
        self.replicator.pending.insert(task_id.clone(), map.clone());

        let replicator = self.replicator.clone();
        let handle = tokio::spawn(async move {
            let gate = replicator
                .gates
                .entry(task_id.clone())
                .or_default()
                .value()
                .clone();
            let _gate = gate.lock().await;
            // A later write may have already shipped the newest snapshot.
            let Some((_, latest)) = replicator.pending.remove(&task_id) else {
                return;
            };
            match backup.save(&latest).await {
                Ok(()) => debug!(task_id = %task_id, "Replicated execution map"),
                Err(e) => warn!(task_id = %task_id, error = %e, "Backup replication failed"),
            }
        });

        if let Ok(mut handles) = self.replicator.handles.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    async fn persist(&self, map: &ExecutionMap) -> Result<(), StoreError> {
        self.write_local(map).await?;
        self.replicate(map);
        Ok(())
    }

    /// Wait for every replication started so far.
    pub async fn flush_replication(&self) {
        let handles = self
            .replicator
            .handles
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Load an existing map (from any tier or by replaying the event log)
    /// or create a new one. Idempotent.
    pub async fn initialize(
        &self,
        task_id: &str,
        description: &str,
    ) -> Result<ExecutionMap, StoreError> {
        let _guard = self.lock_task(task_id).await?;
        if let Some(map) = self.load_unlocked(task_id).await? {
            return Ok(map);
        }

        let events = match &self.events {
            Some(log) => log
                .get_events(task_id)
                .await
                .map_err(|e| StoreError::EventLog {
                    task_id: task_id.to_string(),
                    message: format!("{e:#}"),
                })?,
            None => Vec::new(),
        };

        let mut map = if events.is_empty() {
            info!(task_id = %task_id, "Creating execution map");
            ExecutionMap::new(task_id)
        } else {
            info!(task_id = %task_id, events = events.len(), "Rebuilding execution map from events");
            replay::rebuild(task_id, &events)
        };
        map.description = description.to_string();
        self.persist(&map).await?;
        Ok(map)
    }

    /// Replace a task's map wholesale.
    pub async fn save(&self, map: &ExecutionMap) -> Result<(), StoreError> {
        let _guard = self.lock_task(&map.task_id).await?;
        let mut map = map.clone();
        map.touch();
        self.persist(&map).await
    }

    /// Read-modify-write under the task lock. Nothing is written when `f`
    /// fails.
    pub async fn update<R, F>(&self, task_id: &str, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut ExecutionMap) -> Result<R, StoreError> + Send,
        R: Send,
    {
        let _guard = self.lock_task(task_id).await?;
        let mut map = self.load_required(task_id).await?;
        let result = f(&mut map)?;
        map.touch();
        self.persist(&map).await?;
        Ok(result)
    }

    /// Compute where to resume from one snapshot read under the task lock.
    pub async fn get_resumption_point(&self, task_id: &str) -> Result<ResumptionPoint, StoreError> {
        let _guard = self.lock_task(task_id).await?;
        let map = self.load_required(task_id).await?;
        Ok(resume::compute(&map))
    }

    // ---------------------------------------------------------------------
    // Story progress
    // ---------------------------------------------------------------------

    /// Record that a story reached `stage`. Returns the stage now recorded,
    /// which is never earlier than what was recorded before. Only the
    /// assigned worker may advance an assigned story; an unassigned story
    /// is claimed by the first worker that reports on it. The judge may
    /// record review stages on any story.
    pub async fn save_story_progress(
        &self,
        task_id: &str,
        epic_id: &str,
        story_id: &str,
        stage: ProgressStage,
        progress: StoryProgress,
    ) -> Result<ProgressStage, StoreError> {
        self.update(task_id, move |map| {
            if map.epic(epic_id).is_none() {
                map.upsert_epic(EpicExecution::new(epic_id, ""));
            }
            if map.story(epic_id, story_id).is_none() {
                map.upsert_story(epic_id, StoryExecution::new(story_id, ""))?;
            }

            let story = map
                .story_mut(epic_id, story_id)
                .ok_or_else(|| CommonError::UnknownStory {
                    epic_id: epic_id.to_string(),
                    story_id: story_id.to_string(),
                })?;

            match &progress.reporter {
                Reporter::Worker(raw) => {
                    let worker = normalize_worker_id(raw);
                    match &story.assigned_to {
                        Some(owner) if *owner != worker => {
                            return Err(StoreError::NotOwner {
                                story_id: story.story_id.clone(),
                                owner: owner.clone(),
                                worker,
                            });
                        }
                        Some(_) => {}
                        None => story.assigned_to = Some(worker),
                    }
                }
                Reporter::Judge => {
                    if stage < ProgressStage::JudgeEvaluating {
                        return Err(StoreError::ReviewStageOnly {
                            story_id: story.story_id.clone(),
                            stage: stage.to_string(),
                        });
                    }
                }
                Reporter::Unattributed => {
                    if let Some(owner) = &story.assigned_to {
                        return Err(StoreError::NotOwner {
                            story_id: story.story_id.clone(),
                            owner: owner.clone(),
                            worker: "an unattributed caller".to_string(),
                        });
                    }
                }
            }

            if stage > story.progress_stage {
                story.progress_stage = stage;
            } else if stage < story.progress_stage {
                debug!(
                    story_id = %story.story_id,
                    recorded = %story.progress_stage,
                    reported = %stage,
                    "Ignoring stage regression"
                );
            }

            if stage == ProgressStage::Completed {
                story.status = WorkStatus::Completed;
            } else if story.status == WorkStatus::Pending
                && story.progress_stage != ProgressStage::NotStarted
            {
                story.status = WorkStatus::InProgress;
            }

            if progress.commit_hash.is_some() {
                story.last_commit_hash = progress.commit_hash;
            }
            if progress.files_modified.is_some() {
                story.files_modified = progress.files_modified;
            }
            if progress.session_token.is_some() {
                story.session_token = progress.session_token;
            }
            story.cost += progress.cost;
            story.updated_at = Some(Utc::now());

            let recorded = story.progress_stage;
            let story_key = story.story_id.clone();
            let owner = story.assigned_to.clone();
            if let Some(owner) = owner {
                map.story_assignments.insert(story_key, owner);
            }

            if let Some(epic) = map.epic_mut(epic_id) {
                epic.cost += progress.cost;
                epic.tokens += progress.tokens;
                epic.refresh_status();
            }
            map.recompute_totals();
            Ok(recorded)
        })
        .await
    }

    /// Mark a story failed; the epic becomes terminal once all its stories are.
    pub async fn mark_story_failed(
        &self,
        task_id: &str,
        epic_id: &str,
        story_id: &str,
    ) -> Result<(), StoreError> {
        self.update(task_id, |map| {
            let epic = map
                .epic_mut(epic_id)
                .ok_or_else(|| CommonError::UnknownEpic {
                    epic_id: epic_id.to_string(),
                })?;
            let story = epic
                .story_mut(story_id)
                .ok_or_else(|| CommonError::UnknownStory {
                    epic_id: epic_id.to_string(),
                    story_id: story_id.to_string(),
                })?;
            story.status = WorkStatus::Failed;
            story.updated_at = Some(Utc::now());
            epic.refresh_status();
            Ok(())
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Errors and approvals
    // ---------------------------------------------------------------------

    /// Classify a failure and append it to the map's error lists.
    pub async fn record_error(
        &self,
        task_id: &str,
        phase: &str,
        message: &str,
    ) -> Result<DetailedError, StoreError> {
        let detailed = classify::classify(phase, message);
        let record = detailed.clone();
        self.update(task_id, move |map| {
            map.errors.push(classify::error_line(&record));
            map.detailed_errors.push(record);
            Ok(())
        })
        .await?;
        Ok(detailed)
    }

    /// Resolve open errors for a phase key and any epic-scoped keys under it.
    pub async fn mark_errors_resolved(&self, task_id: &str, phase: &str) -> Result<usize, StoreError> {
        let prefix = format!("{phase}:");
        self.update(task_id, |map| {
            let mut resolved = 0;
            for err in map.detailed_errors.iter_mut().filter(|e| !e.resolved) {
                if err.phase == phase || err.phase.starts_with(&prefix) {
                    err.resolved = true;
                    resolved += 1;
                }
            }
            Ok(resolved)
        })
        .await
    }

    /// Release an approval gate. The phase runs on the next `run`.
    pub async fn approve(
        &self,
        task_id: &str,
        phase: PhaseType,
        epic_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update(task_id, |map| {
            map.approvals.insert(phase_key(phase, epic_id));
            let entry = map.phase_entry(phase, epic_id);
            if entry.status == PhaseStatus::WaitingApproval {
                entry.status = PhaseStatus::NotStarted;
            }
            if map.status == TaskStatus::AwaitingApproval {
                map.status = TaskStatus::Pending;
            }
            Ok(())
        })
        .await
    }

    /// Merge the task's event log into its snapshot (or into a new one).
    pub async fn rebuild_from_events(&self, task_id: &str) -> Result<ReplayStats, StoreError> {
        let Some(log) = &self.events else {
            warn!(task_id = %task_id, "No event log configured; nothing to rebuild from");
            return Ok(ReplayStats::default());
        };
        let _guard = self.lock_task(task_id).await?;
        let events = log
            .get_events(task_id)
            .await
            .map_err(|e| StoreError::EventLog {
                task_id: task_id.to_string(),
                message: format!("{e:#}"),
            })?;

        let mut map = self
            .load_unlocked(task_id)
            .await?
            .unwrap_or_else(|| ExecutionMap::new(task_id));
        let stats = replay::apply(&mut map, &events);
        map.touch();
        self.persist(&map).await?;
        info!(
            task_id = %task_id,
            applied = stats.applied,
            duplicates = stats.duplicates,
            "Rebuilt execution map from events"
        );
        Ok(stats)
    }
}

fn validate_task_id(task_id: &str) -> Result<(), StoreError> {
    let invalid = task_id.trim().is_empty()
        || task_id == "."
        || task_id == ".."
        || task_id.contains(['/', '\\']);
    if invalid {
        return Err(StoreError::InvalidTaskId(task_id.to_string()));
    }
    Ok(())
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventLog;
    use anvil_common::{EpicCreatedPayload, ErrorCode, Event, EventType, StoryCreatedPayload};

    fn store(dir: &Path) -> (ExecutionMemoryStore, Arc<InMemoryBackup>) {
        let backup = Arc::new(InMemoryBackup::new());
        let store = ExecutionMemoryStore::new(dir.join("tasks")).with_backup(backup.clone());
        (store, backup)
    }

    async fn seeded(store: &ExecutionMemoryStore, task: &str) {
        store.initialize(task, "add billing").await.unwrap();
        store
            .update(task, |map| {
                map.upsert_epic(EpicExecution::new("api", "API"));
                map.upsert_story("api", StoryExecution::new("s1", "model").assigned("dev-1"))?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        let first = store.initialize("t1", "add billing").await.unwrap();
        store
            .update("t1", |map| {
                map.phase_entry(PhaseType::Planning, None).status = PhaseStatus::Completed;
                Ok(())
            })
            .await
            .unwrap();
        let second = store.initialize("t1", "something else").await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.description, "add billing");
        assert!(second.is_phase_completed(PhaseType::Planning, None));
    }

    #[tokio::test]
    async fn write_produces_primary_checkpoint_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        seeded(&store, "t1").await;

        assert!(store.primary_path("t1").exists());
        assert!(store.checkpoint_path("t1").exists());
        let summary = std::fs::read_to_string(store.summary_path("t1")).unwrap();
        assert!(summary.contains("Task: t1"));
        assert!(!store.task_dir("t1").join("execution-map.json.tmp").exists());
    }

    #[tokio::test]
    async fn deleted_local_copies_come_back_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let (store, backup) = store(dir.path());
        seeded(&store, "t1").await;
        store.flush_replication().await;
        assert_eq!(backup.len(), 1);

        std::fs::remove_file(store.primary_path("t1")).unwrap();
        std::fs::remove_file(store.checkpoint_path("t1")).unwrap();

        let map = store.load("t1").await.unwrap().unwrap();
        assert!(map.story("api", "s1").is_some());
        assert!(store.primary_path("t1").exists());
    }

    #[tokio::test]
    async fn corrupt_primary_falls_back_to_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        seeded(&store, "t1").await;

        std::fs::write(store.primary_path("t1"), "{ truncated").unwrap();
        let map = store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.epics().len(), 1);

        let restored = std::fs::read_to_string(store.primary_path("t1")).unwrap();
        assert!(serde_json::from_str::<ExecutionMap>(&restored).is_ok());
    }

    #[tokio::test]
    async fn corrupt_primary_without_fallback_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ExecutionMemoryStore::new(dir.path());
        std::fs::create_dir_all(store.task_dir("t1")).unwrap();
        std::fs::write(store.primary_path("t1"), "nope").unwrap();

        let err = store.load("t1").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn backup_failure_does_not_fail_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, backup) = store(dir.path());
        backup.set_failing(true);

        seeded(&store, "t1").await;
        store.flush_replication().await;

        assert!(backup.is_empty());
        assert!(store.load("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_on_missing_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let err = store.update("ghost", |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn failing_update_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        seeded(&store, "t1").await;

        let result: Result<(), _> = store
            .update("t1", |map| {
                map.description = "changed".into();
                Err(StoreError::Lock {
                    task_id: "t1".into(),
                    message: "abort".into(),
                })
            })
            .await;
        assert!(result.is_err());
        let map = store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.description, "add billing");
    }

    #[tokio::test]
    async fn rejects_path_like_task_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        for bad in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(
                store.initialize(bad, "").await,
                Err(StoreError::InvalidTaskId(_))
            ));
        }
    }

    #[tokio::test]
    async fn story_stage_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        seeded(&store, "t1").await;

        let stage = store
            .save_story_progress("t1", "api", "s1", ProgressStage::Pushed, StoryProgress::by("dev-1"))
            .await
            .unwrap();
        assert_eq!(stage, ProgressStage::Pushed);

        let stage = store
            .save_story_progress(
                "t1",
                "api",
                "s1",
                ProgressStage::CodeWritten,
                StoryProgress {
                    commit_hash: Some("abc123".into()),
                    ..StoryProgress::by("dev-1")
                },
            )
            .await
            .unwrap();
        assert_eq!(stage, ProgressStage::Pushed);

        let map = store.load("t1").await.unwrap().unwrap();
        let s1 = map.story("api", "s1").unwrap();
        assert_eq!(s1.progress_stage, ProgressStage::Pushed);
        assert_eq!(s1.last_commit_hash.as_deref(), Some("abc123"));
        assert_eq!(s1.status, WorkStatus::InProgress);
    }

    #[tokio::test]
    async fn only_the_owner_advances_a_story() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        seeded(&store, "t1").await;

        let err = store
            .save_story_progress("t1", "api", "s1", ProgressStage::Committed, StoryProgress::by("dev-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotOwner { .. }));

        let map = store.load("t1").await.unwrap().unwrap();
        assert_eq!(
            map.story("api", "s1").unwrap().progress_stage,
            ProgressStage::NotStarted
        );
    }

    #[tokio::test]
    async fn anonymous_and_judge_reports_are_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        seeded(&store, "t1").await;

        let err = store
            .save_story_progress("t1", "api", "s1", ProgressStage::Pushed, StoryProgress::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotOwner { .. }));

        let err = store
            .save_story_progress("t1", "api", "s1", ProgressStage::Committed, StoryProgress::judge())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReviewStageOnly { .. }));

        let stage = store
            .save_story_progress(
                "t1",
                "api",
                "s1",
                ProgressStage::JudgeEvaluating,
                StoryProgress::judge(),
            )
            .await
            .unwrap();
        assert_eq!(stage, ProgressStage::JudgeEvaluating);

        let map = store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.story("api", "s1").unwrap().assigned_to.as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn progress_cost_rolls_up_to_epic_and_task() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        seeded(&store, "t1").await;

        store
            .save_story_progress(
                "t1",
                "api",
                "s1",
                ProgressStage::CodeWritten,
                StoryProgress {
                    cost: 1.5,
                    tokens: 300,
                    ..StoryProgress::by("dev-1")
                },
            )
            .await
            .unwrap();
        store
            .update("t1", |map| {
                map.add_overhead(0.5, 100);
                Ok(())
            })
            .await
            .unwrap();

        let map = store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.epic("api").unwrap().cost, 1.5);
        assert_eq!(map.total_cost, 2.0);
        assert_eq!(map.total_tokens, 400);
    }

    #[tokio::test]
    async fn concurrent_progress_updates_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        store.initialize("t1", "").await.unwrap();
        store
            .update("t1", |map| {
                map.upsert_epic(EpicExecution::new("api", ""));
                for i in 0..8 {
                    map.upsert_story("api", StoryExecution::new(&format!("s{i}"), ""))?;
                }
                Ok(())
            })
            .await
            .unwrap();

        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .save_story_progress(
                            "t1",
                            "api",
                            &format!("s{i}"),
                            ProgressStage::Committed,
                            StoryProgress::by(&format!("dev-{i}")),
                        )
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let map = store.load("t1").await.unwrap().unwrap();
        assert!(
            map.epic("api")
                .unwrap()
                .stories()
                .iter()
                .all(|s| s.progress_stage == ProgressStage::Committed)
        );
    }

    #[tokio::test]
    async fn resumption_point_reads_the_stored_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        seeded(&store, "t1").await;
        store
            .update("t1", |map| {
                map.phase_entry(PhaseType::Planning, None).status = PhaseStatus::Completed;
                map.phase_entry(PhaseType::Architecture, None).status = PhaseStatus::Completed;
                Ok(())
            })
            .await
            .unwrap();
        store
            .save_story_progress("t1", "api", "s1", ProgressStage::TestsPassed, StoryProgress::by("dev-1"))
            .await
            .unwrap();

        let point = store.get_resumption_point("t1").await.unwrap();
        assert_eq!(point.resume_from_phase, Some(PhaseType::Implementation));
        assert_eq!(point.resume_from_epic.as_deref(), Some("api"));
        assert_eq!(point.resume_from_story.as_deref(), Some("s1"));
        assert_eq!(point.resume_from_stage, Some(ProgressStage::TestsPassed));
    }

    #[tokio::test]
    async fn errors_are_classified_and_resolved_by_phase() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        store.initialize("t1", "").await.unwrap();

        let err = store
            .record_error("t1", "implementation:api", "error: 429 Too Many Requests")
            .await
            .unwrap();
        assert_eq!(err.error_code, ErrorCode::RateLimit);
        store.record_error("t1", "review", "judge crashed").await.unwrap();

        assert_eq!(store.mark_errors_resolved("t1", "implementation").await.unwrap(), 1);
        let map = store.load("t1").await.unwrap().unwrap();
        assert_eq!(map.errors.len(), 2);
        assert!(map.errors[0].starts_with("[implementation:api] rate_limit"));
        assert_eq!(map.detailed_errors.iter().filter(|e| e.resolved).count(), 1);
    }

    #[tokio::test]
    async fn approve_releases_waiting_phase() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        store.initialize("t1", "").await.unwrap();
        store
            .update("t1", |map| {
                map.phase_entry(PhaseType::Review, None).status = PhaseStatus::WaitingApproval;
                map.status = TaskStatus::AwaitingApproval;
                Ok(())
            })
            .await
            .unwrap();

        store.approve("t1", PhaseType::Review, None).await.unwrap();
        let map = store.load("t1").await.unwrap().unwrap();
        assert!(map.is_approved(PhaseType::Review, None));
        assert_eq!(map.phase_status(PhaseType::Review, None), PhaseStatus::NotStarted);
        assert_eq!(map.status, TaskStatus::Pending);
    }

    fn structural_events(task: &str) -> Vec<Event> {
        vec![
            Event::with_payload(
                task,
                EventType::EpicCreated,
                "architect",
                &EpicCreatedPayload {
                    id: "api".into(),
                    title: "API".into(),
                    target_repository: None,
                    branch_name: None,
                },
            )
            .unwrap(),
            Event::with_payload(
                task,
                EventType::StoryCreated,
                "architect",
                &StoryCreatedPayload {
                    id: "s1".into(),
                    epic_id: "api".into(),
                    title: "model".into(),
                    files: vec!["src/model.rs".into()],
                    assigned_to: Some("dev-1".into()),
                },
            )
            .unwrap(),
        ]
    }

    #[tokio::test]
    async fn initialize_replays_events_when_no_snapshot_exists() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemoryEventLog::new());
        for event in structural_events("t1") {
            log.try_append(&event).await.unwrap();
        }
        let store = ExecutionMemoryStore::new(dir.path()).with_event_log(log);

        let map = store.initialize("t1", "rebuilt").await.unwrap();
        assert_eq!(map.description, "rebuilt");
        assert_eq!(
            map.story("api", "s1").unwrap().assigned_to.as_deref(),
            Some("dev-1")
        );
    }

    #[tokio::test]
    async fn rebuild_merges_events_into_existing_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(InMemoryEventLog::new());
        let store = ExecutionMemoryStore::new(dir.path()).with_event_log(log.clone());
        store.initialize("t1", "").await.unwrap();
        store
            .update("t1", |map| {
                map.phase_entry(PhaseType::Planning, None).status = PhaseStatus::Completed;
                Ok(())
            })
            .await
            .unwrap();

        for event in structural_events("t1") {
            log.try_append(&event).await.unwrap();
        }
        let stats = store.rebuild_from_events("t1").await.unwrap();
        assert_eq!(stats.applied, 2);

        let map = store.load("t1").await.unwrap().unwrap();
        assert!(map.is_phase_completed(PhaseType::Planning, None));
        assert!(map.story("api", "s1").is_some());
    }
}
