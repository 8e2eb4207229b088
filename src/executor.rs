//! Agent CLI executor.
//!
//! Runs the agent CLI (`claude` by default) once per request, either on the
//! host in the request's workspace or inside the request's sandbox through
//! `docker exec`. The prompt goes over stdin; output is the CLI's
//! `stream-json` event stream, whose final `result` event carries the
//! answer, cost, usage and session id.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anvil_common::{AgentExecutor, AgentRequest, AgentResponse, TokenUsage};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::sandbox::MOUNT_TARGET;
use crate::util::truncate_chars;

/// Events from the CLI's `stream-json` output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Assistant {
        message: AssistantMessage,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: f64,
        #[serde(default)]
        usage: TokenUsage,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Everything read from one run's stdout.
#[derive(Debug, Default, PartialEq)]
struct StreamSummary {
    text: String,
    result: Option<String>,
    is_error: bool,
    cost: f64,
    usage: TokenUsage,
    session_id: Option<String>,
    saw_result: bool,
}

impl StreamSummary {
    fn push_line(&mut self, label: &str, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message }) => {
                for block in message.content {
                    match block {
                        ContentBlock::ToolUse { name, input } => {
                            let target = input
                                .get("file_path")
                                .or_else(|| input.get("command"))
                                .and_then(Value::as_str)
                                .map(|s| truncate_chars(s, 80))
                                .unwrap_or_default();
                            debug!(agent = %label, tool = %name, target = %target, "Agent tool use");
                        }
                        ContentBlock::Text { text } => {
                            self.text.push_str(&text);
                            self.text.push('\n');
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            Ok(StreamEvent::Result {
                result,
                is_error,
                total_cost_usd,
                usage,
                session_id,
            }) => {
                self.saw_result = true;
                self.result = result;
                self.is_error = is_error;
                self.cost = total_cost_usd;
                self.usage = usage;
                self.session_id = session_id;
            }
            Ok(StreamEvent::Other) => {}
            // Not an event: plain output from the CLI or the container.
            Err(_) => {
                self.text.push_str(line);
                self.text.push('\n');
            }
        }
    }

    fn output(&self) -> String {
        self.result
            .clone()
            .unwrap_or_else(|| self.text.trim_end().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ClaudeCliExecutor {
    cmd: String,
    flags: Vec<String>,
    docker_cmd: String,
    default_timeout: Duration,
}

impl ClaudeCliExecutor {
    pub fn new(cmd: impl Into<String>, flags: Vec<String>, default_timeout: Duration) -> Self {
        Self {
            cmd: cmd.into(),
            flags,
            docker_cmd: "docker".to_string(),
            default_timeout,
        }
    }

    pub fn with_docker_cmd(mut self, docker_cmd: impl Into<String>) -> Self {
        self.docker_cmd = docker_cmd.into();
        self
    }

    fn agent_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = self.flags.clone();
        args.extend(
            ["--print", "--output-format", "stream-json", "--verbose"]
                .iter()
                .map(|s| s.to_string()),
        );
        if request.sandbox.is_some() {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(token) = &request.resume_token {
            args.push("--resume".to_string());
            args.push(token.clone());
        }
        args
    }

    /// Program and arguments for a request.
    pub fn command_line(&self, request: &AgentRequest) -> (String, Vec<String>) {
        match &request.sandbox {
            Some(sandbox) => {
                let mut args = vec![
                    "exec".to_string(),
                    "-i".to_string(),
                    "-w".to_string(),
                    MOUNT_TARGET.to_string(),
                ];
                for (key, value) in &sandbox.env {
                    args.push("-e".to_string());
                    args.push(format!("{key}={value}"));
                }
                args.push(sandbox.container_id.clone());
                args.push(self.cmd.clone());
                args.extend(self.agent_args(request));
                (self.docker_cmd.clone(), args)
            }
            None => (self.cmd.clone(), self.agent_args(request)),
        }
    }

    fn prompt_text(request: &AgentRequest) -> String {
        if request.attachments.is_empty() {
            return request.prompt.clone();
        }
        let mut prompt = request.prompt.clone();
        prompt.push_str("\n\nAttached files:\n");
        for path in &request.attachments {
            prompt.push_str("- ");
            prompt.push_str(&attachment_path(request, path));
            prompt.push('\n');
        }
        prompt
    }

    async fn drive(&self, mut child: Child, label: &str, prompt: String) -> Result<AgentResponse> {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("Failed to write prompt to agent")?;
            stdin.shutdown().await.context("Failed to close agent stdin")?;
        }

        let mut stderr = child.stderr.take().context("Failed to get agent stderr")?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let stdout = child.stdout.take().context("Failed to get agent stdout")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut summary = StreamSummary::default();
        while let Some(line) = lines.next_line().await? {
            summary.push_line(label, &line);
        }

        let status = child.wait().await.context("Failed to wait for agent")?;
        let stderr = stderr_task.await.unwrap_or_default();

        if summary.is_error || !status.success() {
            let detail = summary
                .result
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| stderr.trim().to_string());
            bail!(
                "Agent {label} failed ({status}): {}",
                truncate_chars(&detail, 2000)
            );
        }
        if !summary.saw_result {
            debug!(agent = %label, "Agent produced no result event");
        }

        Ok(AgentResponse {
            output: summary.output(),
            cost: summary.cost,
            token_usage: summary.usage,
            session_id: summary.session_id,
        })
    }
}

/// Attachment paths as the agent will see them: inside the sandbox they are
/// rewritten under the mount point when they live in the workspace.
fn attachment_path(request: &AgentRequest, path: &Path) -> String {
    if request.sandbox.is_some()
        && let Ok(rel) = path.strip_prefix(&request.workspace_path)
    {
        return PathBuf::from(MOUNT_TARGET).join(rel).display().to_string();
    }
    path.display().to_string()
}

#[async_trait]
impl AgentExecutor for ClaudeCliExecutor {
    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse> {
        let (program, args) = self.command_line(&request);
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let label = if request.label.is_empty() {
            request.agent_id.clone()
        } else {
            request.label.clone()
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if request.sandbox.is_none() {
            cmd.current_dir(&request.workspace_path);
        }

        info!(
            task_id = %request.task_id,
            agent = %label,
            sandboxed = request.sandbox.is_some(),
            "Starting agent"
        );
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn agent command '{program}'"))?;

        let prompt = Self::prompt_text(&request);
        match tokio::time::timeout(timeout, self.drive(child, &label, prompt)).await {
            Ok(result) => result,
            // Dropping the future drops the child, which kills it.
            Err(_) => bail!("Agent {label} timed out after {}s", timeout.as_secs()),
        }
    }
}
