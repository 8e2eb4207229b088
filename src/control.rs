//! Cooperative pause and cancel signals.
//!
//! The engine polls [`TaskControl::check`] before every phase and between
//! stories. Signals are level-triggered: a cancel stays set until cleared,
//! so every poll after the request observes it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub const CANCEL_MARKER: &str = "cancel";
pub const PAUSE_MARKER: &str = "pause";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Continue,
    Pause,
    Cancel,
}

pub trait TaskControl: Send + Sync {
    /// Current signal for a task. Cancel wins over pause.
    fn check(&self, task_id: &str) -> ControlSignal;

    fn request(&self, task_id: &str, signal: ControlSignal) -> Result<()>;

    /// Clear any pending signal, typically when a run starts.
    fn clear(&self, task_id: &str) -> Result<()>;
}

/// Marker files in each task directory, so another process can signal a
/// running task: `<root>/<task_id>/cancel` and `<root>/<task_id>/pause`.
#[derive(Debug, Clone)]
pub struct FileControl {
    root: PathBuf,
}

impl FileControl {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn marker(&self, task_id: &str, name: &str) -> PathBuf {
        self.root.join(task_id).join(name)
    }
}

impl TaskControl for FileControl {
    fn check(&self, task_id: &str) -> ControlSignal {
        if self.marker(task_id, CANCEL_MARKER).exists() {
            ControlSignal::Cancel
        } else if self.marker(task_id, PAUSE_MARKER).exists() {
            ControlSignal::Pause
        } else {
            ControlSignal::Continue
        }
    }

    fn request(&self, task_id: &str, signal: ControlSignal) -> Result<()> {
        let name = match signal {
            ControlSignal::Continue => return self.clear(task_id),
            ControlSignal::Pause => PAUSE_MARKER,
            ControlSignal::Cancel => CANCEL_MARKER,
        };
        let path = self.marker(task_id, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, chrono::Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn clear(&self, task_id: &str) -> Result<()> {
        for name in [CANCEL_MARKER, PAUSE_MARKER] {
            let path = self.marker(task_id, name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to remove {}", path.display()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryControl {
    signals: DashMap<String, ControlSignal>,
}

impl InMemoryControl {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskControl for InMemoryControl {
    fn check(&self, task_id: &str) -> ControlSignal {
        self.signals
            .get(task_id)
            .map(|s| *s)
            .unwrap_or(ControlSignal::Continue)
    }

    fn request(&self, task_id: &str, signal: ControlSignal) -> Result<()> {
        let mut entry = self
            .signals
            .entry(task_id.to_string())
            .or_insert(ControlSignal::Continue);
        // Cancel is sticky; a later pause does not downgrade it.
        if *entry != ControlSignal::Cancel || signal == ControlSignal::Continue {
            *entry = signal;
        }
        Ok(())
    }

    fn clear(&self, task_id: &str) -> Result<()> {
        self.signals.remove(task_id);
        Ok(())
    }
}
