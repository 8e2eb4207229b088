//! CLI command implementations.
//!
//! | Module    | Commands handled                                              |
//! |-----------|---------------------------------------------------------------|
//! | `project` | `Init`                                                        |
//! | `run`     | `Run`                                                         |
//! | `task`    | `ResumePoint`, `Status`, `Events`, `Approve`, `Cancel`, `Pause`, `Rebuild`, `Errors` |
//! | `config`  | `Config`                                                      |

pub mod config;
pub mod project;
pub mod run;
pub mod task;

use std::sync::Arc;

use anvil::config::Config;
use anvil::events::{EventLog, JsonlEventLog};
use anvil::memory::ExecutionMemoryStore;
use anvil::memory::backup::DirectoryBackup;

pub use config::cmd_config;
pub use project::cmd_init;
pub use run::{RunOptions, cmd_run};
pub use task::{
    cmd_approve, cmd_cancel, cmd_errors, cmd_events, cmd_pause, cmd_rebuild, cmd_resume_point,
    cmd_status,
};

/// The task store and event log every command shares.
pub(crate) fn open_store(config: &Config) -> (Arc<ExecutionMemoryStore>, Arc<dyn EventLog>) {
    let events: Arc<dyn EventLog> = Arc::new(JsonlEventLog::new(config.tasks_dir.clone()));
    let mut store = ExecutionMemoryStore::new(config.tasks_dir.clone()).with_event_log(events.clone());
    if let Some(dir) = &config.backup_dir {
        store = store.with_backup(Arc::new(DirectoryBackup::new(dir.clone())));
    }
    (Arc::new(store), events)
}
