//! Per-task isolated execution environments.
//!
//! Each task gets its own containers, keyed by `(task_id, repo_key)` and
//! never shared with another task. Multi-service tasks additionally get a
//! task-scoped network where each service is reachable under a
//! deterministic `{role}-{repoName}` alias, with discovery variables
//! injected into every peer.

pub mod config;
pub mod runtime;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anvil_common::ids::{normalize_repo_key, repository_name};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub use config::SandboxConfig;
pub use runtime::{ContainerRuntime, ContainerSpec, DockerCli, ExecOutput};

use crate::errors::SandboxError;

pub const MOUNT_TARGET: &str = "/workspace";

/// Cleanup attempts before a deferred resource is reported as orphaned.
const MAX_CLEANUP_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Environment {
    pub task_id: String,
    pub repo_key: String,
    pub container_id: String,
    pub container_name: String,
    pub workspace_path: PathBuf,
    pub network: Option<String>,
    pub alias: Option<String>,
    /// Variables passed to every exec and agent call in this environment
    pub env: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Per-call overrides on top of the manager's [`SandboxConfig`].
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRequest {
    pub image: Option<String>,
    pub env: BTreeMap<String, String>,
    pub network: Option<String>,
    pub alias: Option<String>,
}

/// One service of a multi-service task.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub repo_key: String,
    /// Repository reference; its name forms the alias
    pub repository: String,
    pub role: String,
    pub port: Option<u16>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupTarget {
    Container(String),
    Network(String),
}

impl std::fmt::Display for CleanupTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupTarget::Container(id) => write!(f, "container {id}"),
            CleanupTarget::Network(name) => write!(f, "network {name}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeferredCleanup {
    pub task_id: String,
    pub target: CleanupTarget,
    pub attempts: u32,
    pub deferred_at: DateTime<Utc>,
}

pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    workspaces_root: PathBuf,
    /// task id -> repo key -> environment
    environments: Mutex<HashMap<String, BTreeMap<String, Environment>>>,
    networks: Mutex<HashMap<String, String>>,
    deferred: Mutex<Vec<DeferredCleanup>>,
    orphans: Mutex<Vec<DeferredCleanup>>,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: SandboxConfig,
        workspaces_root: PathBuf,
    ) -> Self {
        Self {
            runtime,
            config,
            workspaces_root,
            environments: Mutex::new(HashMap::new()),
            networks: Mutex::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            orphans: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn network_name(&self, task_id: &str) -> String {
        format!(
            "{}-{}-net",
            self.config.network_prefix,
            normalize_repo_key(task_id)
        )
    }

    /// Return the task's environment for `repo_key`, creating it on first use.
    ///
    /// Creation failures are returned as [`SandboxError::CreateFailed`] and
    /// leave nothing registered.
    pub async fn get_or_create(
        &self,
        task_id: &str,
        repo_key: &str,
        request: &EnvironmentRequest,
    ) -> Result<Environment, SandboxError> {
        let key = normalize_repo_key(repo_key);
        let mut environments = self.environments.lock().await;
        if let Some(existing) = environments.get(task_id).and_then(|m| m.get(&key)) {
            return Ok(existing.clone());
        }

        let create_failed = |message: String| SandboxError::CreateFailed {
            task_id: task_id.to_string(),
            repo_key: key.clone(),
            message,
        };

        let workspace_path = self
            .workspaces_root
            .join(normalize_repo_key(task_id))
            .join(&key);
        tokio::fs::create_dir_all(&workspace_path)
            .await
            .map_err(|e| create_failed(format!("workspace {}: {e}", workspace_path.display())))?;

        let mut env = self.config.env.clone();
        env.extend(request.env.clone());

        let container_name = format!(
            "{}-{}-{}",
            self.config.network_prefix,
            normalize_repo_key(task_id),
            key
        );
        let spec = ContainerSpec {
            name: container_name.clone(),
            image: request
                .image
                .clone()
                .unwrap_or_else(|| self.config.image().to_string()),
            workspace: workspace_path.clone(),
            mount_target: MOUNT_TARGET.to_string(),
            memory: self.config.memory.clone(),
            cpus: self.config.cpus,
            env: env.clone(),
            volumes: self.config.volumes.clone(),
            labels: BTreeMap::from([
                ("anvil.task".to_string(), task_id.to_string()),
                ("anvil.repo".to_string(), key.clone()),
            ]),
            network: request.network.clone(),
            network_alias: request.alias.clone(),
        };

        let container_id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| create_failed(e.to_string()))?;

        info!(
            task_id = %task_id,
            repo_key = %key,
            container = %container_name,
            "Created sandbox environment"
        );

        let environment = Environment {
            task_id: task_id.to_string(),
            repo_key: key.clone(),
            container_id,
            container_name,
            workspace_path,
            network: request.network.clone(),
            alias: request.alias.clone(),
            env,
            created_at: Utc::now(),
        };
        environments
            .entry(task_id.to_string())
            .or_default()
            .insert(key, environment.clone());
        Ok(environment)
    }

    pub async fn environment(&self, task_id: &str, repo_key: &str) -> Option<Environment> {
        let key = normalize_repo_key(repo_key);
        self.environments
            .lock()
            .await
            .get(task_id)
            .and_then(|m| m.get(&key))
            .cloned()
    }

    pub async fn environments(&self, task_id: &str) -> Vec<Environment> {
        self.environments
            .lock()
            .await
            .get(task_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Provision every service of a multi-service task on one network.
    ///
    /// A single service needs no network and is created plainly.
    pub async fn provision_services(
        &self,
        task_id: &str,
        services: &[ServiceSpec],
    ) -> Result<Vec<Environment>, SandboxError> {
        if services.len() < 2 {
            let mut out = Vec::new();
            for service in services {
                let request = EnvironmentRequest {
                    image: service.image.clone(),
                    ..Default::default()
                };
                out.push(
                    self.get_or_create(task_id, &service.repo_key, &request)
                        .await?,
                );
            }
            return Ok(out);
        }

        let network = self.network_name(task_id);
        self.runtime.create_network(&network).await?;
        self.networks
            .lock()
            .await
            .insert(task_id.to_string(), network.clone());

        let aliases: Vec<String> = services
            .iter()
            .map(|s| service_alias(&s.role, &s.repository))
            .collect();
        let discovery = discovery_env(services, &aliases);

        let mut out = Vec::with_capacity(services.len());
        for ((service, alias), vars) in services.iter().zip(&aliases).zip(discovery) {
            let mut env = vars;
            env.insert("ANVIL_NETWORK".to_string(), network.clone());
            env.insert("ANVIL_SERVICE_ALIAS".to_string(), alias.clone());

            let request = EnvironmentRequest {
                image: service.image.clone(),
                env: env.clone(),
                network: Some(network.clone()),
                alias: Some(alias.clone()),
            };
            let mut environment = self
                .get_or_create(task_id, &service.repo_key, &request)
                .await?;

            // Created earlier without a network: attach it now and record
            // the discovery variables for later exec calls.
            if environment.network.as_deref() != Some(network.as_str()) {
                self.runtime
                    .connect_network(&network, &environment.container_id, alias)
                    .await?;
                let mut environments = self.environments.lock().await;
                if let Some(registered) = environments
                    .get_mut(task_id)
                    .and_then(|m| m.get_mut(&environment.repo_key))
                {
                    registered.network = Some(network.clone());
                    registered.alias = Some(alias.clone());
                    registered.env.extend(env);
                    environment = registered.clone();
                }
            }
            out.push(environment);
        }

        info!(
            task_id = %task_id,
            network = %network,
            services = out.len(),
            "Provisioned multi-service sandbox"
        );
        Ok(out)
    }

    /// Run a shell command inside an environment with its variables set.
    pub async fn exec(
        &self,
        environment: &Environment,
        command: &str,
    ) -> Result<ExecOutput, SandboxError> {
        self.runtime
            .exec(
                &environment.container_id,
                command,
                &environment.env,
                Duration::from_secs(self.config.timeout),
            )
            .await
    }

    /// Tear down every environment (and the network) of a task.
    ///
    /// Returns the number of environments destroyed. Resources that could
    /// not be removed are logged and queued for [`Self::retry_deferred`];
    /// either way the task has no registered environments afterwards.
    pub async fn destroy_all(&self, task_id: &str) -> usize {
        let environments = self
            .environments
            .lock()
            .await
            .remove(task_id)
            .unwrap_or_default();

        let mut destroyed = 0;
        for environment in environments.into_values() {
            let target = CleanupTarget::Container(environment.container_id.clone());
            match self.runtime.remove_container(&environment.container_id).await {
                Ok(()) => {
                    destroyed += 1;
                    info!(
                        task_id = %task_id,
                        repo_key = %environment.repo_key,
                        "Destroyed sandbox environment"
                    );
                }
                Err(e) => self.defer(task_id, target, &e).await,
            }
        }

        let network = self.networks.lock().await.remove(task_id);
        if let Some(network) = network
            && let Err(e) = self.runtime.remove_network(&network).await
        {
            self.defer(task_id, CleanupTarget::Network(network), &e).await;
        }

        destroyed
    }

    async fn defer(&self, task_id: &str, target: CleanupTarget, err: &SandboxError) {
        match err {
            SandboxError::InUse { .. } => {
                warn!(task_id = %task_id, resource = %target, "Resource still in use, deferring cleanup")
            }
            _ => {
                warn!(task_id = %task_id, resource = %target, error = %err, "Cleanup failed, deferring")
            }
        }
        self.deferred.lock().await.push(DeferredCleanup {
            task_id: task_id.to_string(),
            target,
            attempts: 1,
            deferred_at: Utc::now(),
        });
    }

    /// Retry deferred cleanups. Returns how many were resolved.
    ///
    /// Containers are retried before networks so a network freed by the same
    /// pass is removable.
    pub async fn retry_deferred(&self) -> usize {
        let mut pending = std::mem::take(&mut *self.deferred.lock().await);
        pending.sort_by_key(|d| matches!(d.target, CleanupTarget::Network(_)));

        let mut resolved = 0;
        let mut remaining = Vec::new();
        for mut item in pending {
            let result = match &item.target {
                CleanupTarget::Container(id) => self.runtime.remove_container(id).await,
                CleanupTarget::Network(name) => self.runtime.remove_network(name).await,
            };
            match result {
                Ok(()) => {
                    resolved += 1;
                    info!(task_id = %item.task_id, resource = %item.target, "Deferred cleanup succeeded");
                }
                Err(e) => {
                    item.attempts += 1;
                    if item.attempts >= MAX_CLEANUP_ATTEMPTS {
                        error!(
                            task_id = %item.task_id,
                            resource = %item.target,
                            attempts = item.attempts,
                            error = %e,
                            "Giving up on cleanup; resource orphaned"
                        );
                        self.orphans.lock().await.push(item);
                    } else {
                        remaining.push(item);
                    }
                }
            }
        }

        self.deferred.lock().await.extend(remaining);
        resolved
    }

    pub async fn deferred(&self) -> Vec<DeferredCleanup> {
        self.deferred.lock().await.clone()
    }

    /// Resources that exhausted their cleanup retries.
    pub async fn orphans(&self) -> Vec<DeferredCleanup> {
        self.orphans.lock().await.clone()
    }
}

/// `{role}-{repoName}`, normalized.
pub fn service_alias(role: &str, repository: &str) -> String {
    normalize_repo_key(&format!("{}-{}", role, repository_name(repository)))
}

fn env_token(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Discovery variables for each service, describing every peer.
///
/// Every peer gets `{ROLE}_{REPO}_URL` and `{ROLE}_{REPO}_HOST`; a peer whose
/// role is unique in the task additionally gets the short `{ROLE}_URL`.
pub fn discovery_env(services: &[ServiceSpec], aliases: &[String]) -> Vec<BTreeMap<String, String>> {
    let mut role_counts: HashMap<String, usize> = HashMap::new();
    for service in services {
        *role_counts.entry(env_token(&service.role)).or_default() += 1;
    }

    services
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let mut vars = BTreeMap::new();
            for (j, peer) in services.iter().enumerate() {
                if i == j {
                    continue;
                }
                let host = &aliases[j];
                let url = match peer.port {
                    Some(port) => format!("http://{host}:{port}"),
                    None => format!("http://{host}"),
                };
                let role = env_token(&peer.role);
                let repo = env_token(&repository_name(&peer.repository));
                vars.insert(format!("{role}_{repo}_URL"), url.clone());
                vars.insert(format!("{role}_{repo}_HOST"), host.clone());
                if role_counts.get(&role) == Some(&1) {
                    vars.insert(format!("{role}_URL"), url);
                }
            }
            vars
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory container runtime shared by unit tests.

    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::runtime::{ContainerRuntime, ContainerSpec, ExecOutput};
    use crate::errors::SandboxError;

    #[derive(Default)]
    pub struct FakeRuntime {
        pub live: Mutex<BTreeMap<String, ContainerSpec>>,
        pub networks: Mutex<BTreeSet<String>>,
        pub connections: Mutex<Vec<(String, String, String)>>,
        pub busy: Mutex<BTreeSet<String>>,
        pub fail_create: Mutex<bool>,
        pub execs: Mutex<Vec<String>>,
        pub exit_code: Mutex<i32>,
        counter: AtomicUsize,
    }

    impl FakeRuntime {
        pub fn live_count(&self) -> usize {
            self.live.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn create_network(&self, name: &str) -> Result<(), SandboxError> {
            self.networks.lock().unwrap().insert(name.to_string());
            Ok(())
        }

        async fn remove_network(&self, name: &str) -> Result<(), SandboxError> {
            if self.busy.lock().unwrap().contains(name) {
                return Err(SandboxError::InUse {
                    resource: format!("network {name}"),
                });
            }
            self.networks.lock().unwrap().remove(name);
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
            if *self.fail_create.lock().unwrap() {
                return Err(SandboxError::Runtime("image pull failed".into()));
            }
            let id = format!("c{}", self.counter.fetch_add(1, Ordering::SeqCst));
            self.live.lock().unwrap().insert(id.clone(), spec.clone());
            Ok(id)
        }

        async fn connect_network(
            &self,
            network: &str,
            container_id: &str,
            alias: &str,
        ) -> Result<(), SandboxError> {
            self.connections.lock().unwrap().push((
                network.to_string(),
                container_id.to_string(),
                alias.to_string(),
            ));
            Ok(())
        }

        async fn remove_container(&self, container_id: &str) -> Result<(), SandboxError> {
            if self.busy.lock().unwrap().contains(container_id) {
                return Err(SandboxError::InUse {
                    resource: format!("container {container_id}"),
                });
            }
            self.live.lock().unwrap().remove(container_id);
            Ok(())
        }

        async fn exec(
            &self,
            _container_id: &str,
            command: &str,
            _env: &BTreeMap<String, String>,
            _timeout: Duration,
        ) -> Result<ExecOutput, SandboxError> {
            self.execs.lock().unwrap().push(command.to_string());
            Ok(ExecOutput {
                exit_code: *self.exit_code.lock().unwrap(),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}
