//! Fakes and fixtures shared by the crate's unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anvil_common::{AgentExecutor, AgentRequest, AgentResponse, TokenUsage};
use anyhow::Result;
use async_trait::async_trait;

use crate::config::AnvilToml;
use crate::control::InMemoryControl;
use crate::engine::{PhaseEngine, PhaseServices};
use crate::events::InMemoryEventLog;
use crate::memory::ExecutionMemoryStore;
use crate::sandbox::SandboxManager;
use crate::sandbox::fake::FakeRuntime;
use crate::scm::{CommitInfo, SourceControl};

type Responder = Box<dyn Fn(&AgentRequest) -> Result<AgentResponse> + Send + Sync>;

pub fn reply(output: &str, cost: f64) -> AgentResponse {
    AgentResponse {
        output: output.to_string(),
        cost,
        token_usage: TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        },
        session_id: Some("session-1".to_string()),
    }
}

/// Records every request and answers through a swappable responder.
pub struct FakeExecutor {
    pub requests: Mutex<Vec<AgentRequest>>,
    responder: Mutex<Responder>,
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(|_| Ok(reply("ok", 0.1)))),
        }
    }
}

impl FakeExecutor {
    pub fn respond_with(
        &self,
        f: impl Fn(&AgentRequest) -> Result<AgentResponse> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap() = Box::new(f);
    }

    pub fn labels(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.label.clone())
            .collect()
    }
}

#[async_trait]
impl AgentExecutor for FakeExecutor {
    async fn execute(&self, request: AgentRequest) -> Result<AgentResponse> {
        let response = {
            let responder = self.responder.lock().unwrap();
            (*responder)(&request)
        };
        self.requests.lock().unwrap().push(request);
        response
    }
}

/// Source control that only records what it was asked to do.
#[derive(Default)]
pub struct FakeScm {
    pub ops: Mutex<Vec<String>>,
    commits: AtomicUsize,
}

impl FakeScm {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl SourceControl for FakeScm {
    async fn prepare_workspace(
        &self,
        workspace: &Path,
        _repository: Option<&str>,
        branch: &str,
    ) -> Result<()> {
        std::fs::create_dir_all(workspace)?;
        self.record(format!("prepare {branch}"));
        Ok(())
    }

    async fn commit_all(&self, _workspace: &Path, message: &str) -> Result<Option<CommitInfo>> {
        let n = self.commits.fetch_add(1, Ordering::SeqCst);
        self.record(format!("commit {message}"));
        Ok(Some(CommitInfo {
            hash: format!("{n:040x}"),
            files: vec!["src/lib.rs".to_string()],
        }))
    }

    async fn push(&self, _workspace: &Path, branch: &str) -> Result<bool> {
        self.record(format!("push {branch}"));
        Ok(true)
    }

    async fn merge(&self, _workspace: &Path, from: &str, into: &str) -> Result<()> {
        self.record(format!("merge {from} -> {into}"));
        Ok(())
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: AnvilToml,
    pub store: Arc<ExecutionMemoryStore>,
    pub events: Arc<InMemoryEventLog>,
    pub runtime: Arc<FakeRuntime>,
    pub sandboxes: Arc<SandboxManager>,
    pub control: Arc<InMemoryControl>,
    pub executor: Arc<FakeExecutor>,
    pub scm: Arc<FakeScm>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AnvilToml::default())
    }

    pub fn with_config(config: AnvilToml) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let events = Arc::new(InMemoryEventLog::new());
        let store = Arc::new(
            ExecutionMemoryStore::new(dir.path().join("tasks")).with_event_log(events.clone()),
        );
        let runtime = Arc::new(FakeRuntime::default());
        let sandboxes = Arc::new(SandboxManager::new(
            runtime.clone(),
            config.sandbox.clone(),
            dir.path().join("workspaces"),
        ));
        Self {
            dir,
            config,
            store,
            events,
            runtime,
            sandboxes,
            control: Arc::new(InMemoryControl::new()),
            executor: Arc::new(FakeExecutor::default()),
            scm: Arc::new(FakeScm::default()),
        }
    }

    pub fn services(&self) -> PhaseServices {
        PhaseServices {
            store: self.store.clone(),
            events: self.events.clone(),
            sandboxes: self.sandboxes.clone(),
            executor: self.executor.clone(),
            scm: self.scm.clone(),
            control: self.control.clone(),
            max_parallel_stories: self.config.engine.max_parallel_stories,
            agent_timeout: Duration::from_secs(5),
        }
    }

    /// An engine with no phase bodies registered.
    pub fn engine(&self) -> PhaseEngine {
        PhaseEngine::new(&self.config, self.services())
    }
}
