//! Container runtime seam.
//!
//! The sandbox manager only needs lifecycle calls, so the runtime is a small
//! trait. `DockerCli` drives the `docker` binary; tests substitute a fake.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::SandboxError;

/// Everything needed to start one sandbox container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host workspace mounted at `mount_target`
    pub workspace: PathBuf,
    pub mount_target: String,
    pub memory: String,
    pub cpus: f64,
    pub env: BTreeMap<String, String>,
    pub volumes: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub network: Option<String>,
    pub network_alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a network. Creating one that already exists is not an error.
    async fn create_network(&self, name: &str) -> Result<(), SandboxError>;

    /// Remove a network. Removing a missing one is not an error; a network
    /// with attached endpoints yields `SandboxError::InUse`.
    async fn remove_network(&self, name: &str) -> Result<(), SandboxError>;

    /// Start a long-lived container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError>;

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        alias: &str,
    ) -> Result<(), SandboxError>;

    /// Force-remove a container. Removing a missing one is not an error.
    async fn remove_container(&self, container_id: &str) -> Result<(), SandboxError>;

    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;
}

/// Drives the docker CLI through `tokio::process`.
#[derive(Debug, Clone)]
pub struct DockerCli {
    cmd: String,
}

impl DockerCli {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }

    async fn run(&self, args: &[String]) -> Result<ExecOutput, SandboxError> {
        debug!(cmd = %self.cmd, args = ?args, "container runtime call");
        let output = Command::new(&self.cmd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(SandboxError::Spawn)?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Build the `docker run` argument list for a spec.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--memory".to_string(),
        spec.memory.clone(),
        "--cpus".to_string(),
        spec.cpus.to_string(),
        "-v".to_string(),
        format!("{}:{}", spec.workspace.display(), spec.mount_target),
        "-w".to_string(),
        spec.mount_target.clone(),
    ];

    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for (source, target) in &spec.volumes {
        args.push("-v".to_string());
        args.push(format!("{source}:{target}"));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
        if let Some(alias) = &spec.network_alias {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
    }

    args.push(spec.image.clone());
    args.extend(["sleep".to_string(), "infinity".to_string()]);
    args
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such") || lower.contains("not found")
}

fn is_in_use(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("in use") || lower.contains("active endpoints")
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_network(&self, name: &str) -> Result<(), SandboxError> {
        let out = self
            .run(&[
                "network".into(),
                "create".into(),
                "--label".into(),
                "anvil.managed=true".into(),
                name.into(),
            ])
            .await?;
        if out.success() || out.stderr.contains("already exists") {
            Ok(())
        } else {
            Err(SandboxError::NetworkFailed {
                network: name.to_string(),
                message: out.stderr,
            })
        }
    }

    async fn remove_network(&self, name: &str) -> Result<(), SandboxError> {
        let out = self
            .run(&["network".into(), "rm".into(), name.into()])
            .await?;
        match out {
            o if o.success() || is_missing(&o.stderr) => Ok(()),
            o if is_in_use(&o.stderr) => Err(SandboxError::InUse {
                resource: format!("network {name}"),
            }),
            o => Err(SandboxError::Runtime(o.stderr)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let out = self.run(&run_args(spec)).await?;
        if !out.success() {
            return Err(SandboxError::Runtime(out.stderr));
        }
        out.stdout
            .lines()
            .last()
            .map(str::to_string)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SandboxError::Runtime("docker run returned no container id".into()))
    }

    async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
        alias: &str,
    ) -> Result<(), SandboxError> {
        let out = self
            .run(&[
                "network".into(),
                "connect".into(),
                "--alias".into(),
                alias.into(),
                network.into(),
                container_id.into(),
            ])
            .await?;
        if out.success() || out.stderr.contains("already exists") {
            Ok(())
        } else {
            Err(SandboxError::NetworkFailed {
                network: network.to_string(),
                message: out.stderr,
            })
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), SandboxError> {
        let out = self
            .run(&["rm".into(), "-f".into(), container_id.into()])
            .await?;
        match out {
            o if o.success() || is_missing(&o.stderr) => Ok(()),
            o if is_in_use(&o.stderr) || o.stderr.contains("removal of container") => {
                Err(SandboxError::InUse {
                    resource: format!("container {container_id}"),
                })
            }
            o => Err(SandboxError::Runtime(o.stderr)),
        }
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        let mut args = vec!["exec".to_string()];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.extend([
            container_id.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);

        tokio::time::timeout(timeout, self.run(&args))
            .await
            .map_err(|_| SandboxError::ExecTimeout {
                container: container_id.to_string(),
                secs: timeout.as_secs(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_include_limits_mounts_and_network() {
        let spec = ContainerSpec {
            name: "anvil-t1-api".into(),
            image: "node:22-slim".into(),
            workspace: PathBuf::from("/work/t1/api"),
            mount_target: "/workspace".into(),
            memory: "4g".into(),
            cpus: 2.0,
            env: BTreeMap::from([("NODE_ENV".to_string(), "test".to_string())]),
            volumes: BTreeMap::new(),
            labels: BTreeMap::from([("anvil.task".to_string(), "t1".to_string())]),
            network: Some("anvil-t1-net".into()),
            network_alias: Some("backend-api".into()),
        };
        let args = run_args(&spec);
        let joined = args.join(" ");

        assert!(joined.starts_with("run -d --name anvil-t1-api --memory 4g --cpus 2"));
        assert!(joined.contains("-v /work/t1/api:/workspace -w /workspace"));
        assert!(joined.contains("--label anvil.task=t1"));
        assert!(joined.contains("-e NODE_ENV=test"));
        assert!(joined.contains("--network anvil-t1-net --network-alias backend-api"));
        assert!(joined.ends_with("node:22-slim sleep infinity"));
    }

    #[test]
    fn run_args_without_network_omit_alias() {
        let spec = ContainerSpec {
            name: "c".into(),
            image: "img".into(),
            mount_target: "/workspace".into(),
            network_alias: Some("ignored".into()),
            ..Default::default()
        };
        let args = run_args(&spec);
        assert!(!args.iter().any(|a| a == "--network-alias"));
    }

    #[test]
    fn stderr_classification() {
        assert!(is_missing("Error: No such container: abc"));
        assert!(is_missing("network anvil-net not found"));
        assert!(is_in_use(
            "error while removing network: network anvil-net has active endpoints"
        ));
        assert!(!is_in_use("permission denied"));
    }
}
