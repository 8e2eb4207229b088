//! Typed error hierarchy for the Anvil orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError`: execution-memory persistence and recovery
//! - `SandboxError`: isolated environment lifecycle
//! - `EngineError`: phase engine policy and execution failures

use std::path::PathBuf;

use anvil_common::CommonError;
use thiserror::Error;

/// Errors from the execution memory store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid task id '{0}'")]
    InvalidTaskId(String),

    #[error("No execution map for task {task_id}")]
    NotFound { task_id: String },

    #[error("Failed to write execution map for task {task_id} at {path}: {source}")]
    WriteFailed {
        task_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read execution map for task {task_id} at {path}: {source}")]
    ReadFailed {
        task_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Execution map at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize execution map for task {task_id}: {source}")]
    Serialize {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to lock task {task_id}: {message}")]
    Lock { task_id: String, message: String },

    #[error("Story {story_id} is owned by {owner}; {worker} may not advance it")]
    NotOwner {
        story_id: String,
        owner: String,
        worker: String,
    },

    #[error("The judge may only record review stages on story {story_id}, not {stage}")]
    ReviewStageOnly { story_id: String, stage: String },

    #[error("Failed to read event log for task {task_id}: {message}")]
    EventLog { task_id: String, message: String },

    #[error(transparent)]
    Model(#[from] CommonError),
}

/// Errors from the sandbox manager and container runtime.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to run container runtime: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Failed to create environment {repo_key} for task {task_id}: {message}")]
    CreateFailed {
        task_id: String,
        repo_key: String,
        message: String,
    },

    #[error("Failed to create network {network}: {message}")]
    NetworkFailed { network: String, message: String },

    #[error("{resource} is still in use")]
    InUse { resource: String },

    #[error("Command timed out after {secs}s in {container}")]
    ExecTimeout { container: String, secs: u64 },

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

/// Errors from the phase engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "Budget ceiling ${ceiling:.2} exceeded for phase {phase}: spent ${spent:.2} + estimated ${estimated:.2}"
    )]
    BudgetExceeded {
        phase: String,
        spent: f64,
        estimated: f64,
        ceiling: f64,
    },

    #[error("Phase {phase} gave up after {attempts} attempts: {violation}")]
    RetriesExhausted {
        phase: String,
        attempts: u32,
        violation: String,
    },

    #[error("Task {task_id} was cancelled")]
    Cancelled { task_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
