//! Secondary copies of execution maps.
//!
//! Replication is best effort: the store never waits on or fails because of
//! a backup. Reads fall back to the backup only when both local copies are
//! unusable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anvil_common::ExecutionMap;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn save(&self, map: &ExecutionMap) -> Result<()>;
    async fn load(&self, task_id: &str) -> Result<Option<ExecutionMap>>;
}

/// One JSON file per task under a backup root, typically on another volume.
#[derive(Debug, Clone)]
pub struct DirectoryBackup {
    root: PathBuf,
}

impl DirectoryBackup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.root.join(format!("{task_id}.json"))
    }
}

#[async_trait]
impl BackupStore for DirectoryBackup {
    async fn save(&self, map: &ExecutionMap) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create backup dir {}", self.root.display()))?;

        let path = self.path_for(&map.task_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(map).context("Failed to serialize backup")?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write backup {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move backup into {}", path.display()))?;
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<ExecutionMap>> {
        let path = self.path_for(task_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read backup {}", path.display()));
            }
        };
        let map = serde_json::from_str(&content)
            .with_context(|| format!("Backup {} is corrupt", path.display()))?;
        Ok(Some(map))
    }
}

/// Process-local backup, for embedding and tests. Can be switched into a
/// failing mode to exercise degraded replication.
#[derive(Debug, Default)]
pub struct InMemoryBackup {
    maps: Mutex<HashMap<String, ExecutionMap>>,
    failing: AtomicBool,
}

impl InMemoryBackup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.maps.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BackupStore for InMemoryBackup {
    async fn save(&self, map: &ExecutionMap) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("backup target unavailable");
        }
        let mut maps = self
            .maps
            .lock()
            .map_err(|_| anyhow::anyhow!("backup lock poisoned"))?;
        maps.insert(map.task_id.clone(), map.clone());
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<Option<ExecutionMap>> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("backup target unavailable");
        }
        let maps = self
            .maps
            .lock()
            .map_err(|_| anyhow::anyhow!("backup lock poisoned"))?;
        Ok(maps.get(task_id).cloned())
    }
}
