//! The seam between the engine and whatever actually runs an AI worker.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Where an agent call should run when it is bound to a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOptions {
    pub container_id: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub agent_id: String,
    pub prompt: String,
    pub workspace_path: PathBuf,
    pub task_id: String,
    /// Short human label used in logs ("implement s-1").
    pub label: String,
    pub resume_token: Option<String>,
    pub attachments: Vec<PathBuf>,
    pub sandbox: Option<SandboxOptions>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub output: String,
    pub cost: f64,
    pub token_usage: TokenUsage,
    pub session_id: Option<String>,
}

/// Opaque collaborator that runs one agent invocation.
///
/// The engine only consumes the returned cost and usage for budget
/// accounting and hands the output string to phase-specific parsing.
/// Implementations are expected to honor `request.timeout`.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse>;
}
