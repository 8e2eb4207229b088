//! Append-only per-task event log.
//!
//! The log is the authoritative record of structural facts (epics, stories,
//! team composition, completed phases). The execution map is a snapshot that
//! can always be rebuilt from it, see [`replay`].

pub mod replay;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anvil_common::{Event, EventType};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

pub const EVENTS_FILE: &str = "events.jsonl";

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append one event, reporting failures.
    async fn try_append(&self, event: &Event) -> Result<()>;

    /// All events for a task, in append order.
    async fn get_events(&self, task_id: &str) -> Result<Vec<Event>>;

    /// Append one event. Failures are logged and never reach the caller.
    async fn append(&self, event: &Event) {
        if let Err(e) = self.try_append(event).await {
            warn!(
                task_id = %event.task_id,
                event_type = %event.event_type,
                error = %e,
                "Failed to append event"
            );
        }
    }
}

/// Build an event from a typed payload and append it.
pub async fn emit<P: Serialize + Sync>(
    log: &dyn EventLog,
    task_id: &str,
    event_type: EventType,
    agent_name: &str,
    payload: &P,
) {
    match Event::with_payload(task_id, event_type, agent_name, payload) {
        Ok(event) => log.append(&event).await,
        Err(e) => warn!(
            task_id = %task_id,
            event_type = %event_type,
            error = %e,
            "Failed to serialize event payload"
        ),
    }
}

/// `<root>/<task_id>/events.jsonl`, one JSON event per line.
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    root: PathBuf,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id).join(EVENTS_FILE)
    }
}

fn append_line(path: &Path, line: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    // One write per event keeps concurrent appends line-atomic.
    file.write_all(line)?;
    file.flush()
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn try_append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Failed to serialize event")?;
        line.push(b'\n');
        let path = self.path_for(&event.task_id);
        let display = path.display().to_string();
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .context("Event append task failed")?
            .with_context(|| format!("Failed to append to {display}"))
    }

    async fn get_events(&self, task_id: &str) -> Result<Vec<Event>> {
        let path = self.path_for(task_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };

        let mut events = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                // A torn final line after a crash is expected; skip it.
                Err(e) => warn!(
                    task_id = %task_id,
                    line = lineno + 1,
                    error = %e,
                    "Skipping malformed event line"
                ),
            }
        }
        Ok(events)
    }
}

/// Process-local log for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    events: Mutex<HashMap<String, Vec<Event>>>,
    failing: AtomicBool,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn try_append(&self, event: &Event) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("event log unavailable");
        }
        let mut events = self
            .events
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        events
            .entry(event.task_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn get_events(&self, task_id: &str) -> Result<Vec<Event>> {
        let events = self
            .events
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        Ok(events.get(task_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_common::EpicCreatedPayload;
    use std::sync::Arc;

    fn epic_event(task: &str, id: &str) -> Event {
        Event::with_payload(
            task,
            EventType::EpicCreated,
            "architect",
            &EpicCreatedPayload {
                id: id.into(),
                title: id.to_uppercase(),
                target_repository: None,
                branch_name: None,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn jsonl_preserves_append_order_per_task() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path());

        for id in ["a", "b", "c"] {
            log.try_append(&epic_event("t1", id)).await.unwrap();
        }
        log.try_append(&epic_event("t2", "z")).await.unwrap();

        let events = log.get_events("t1").await.unwrap();
        let ids: Vec<_> = events
            .iter()
            .map(|e| e.dedup_key().unwrap().1)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(log.get_events("t2").await.unwrap().len(), 1);
        assert!(log.get_events("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jsonl_skips_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlEventLog::new(dir.path());
        log.try_append(&epic_event("t1", "a")).await.unwrap();

        let path = log.path_for("t1");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"id\": \"trunc");
        std::fs::write(&path, content).unwrap();

        assert_eq!(log.get_events("t1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_keep_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(JsonlEventLog::new(dir.path()));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move {
                    log.try_append(&epic_event("t1", &format!("e{i}"))).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(log.get_events("t1").await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn append_swallows_failures() {
        let log = InMemoryEventLog::new();
        log.set_failing(true);
        log.append(&epic_event("t1", "a")).await;
        log.set_failing(false);
        assert!(log.get_events("t1").await.unwrap().is_empty());

        emit(
            &log,
            "t1",
            EventType::TaskStarted,
            "engine",
            &serde_json::json!({"id": "run-1"}),
        )
        .await;
        assert_eq!(log.get_events("t1").await.unwrap().len(), 1);
    }
}
