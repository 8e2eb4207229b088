use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE: &str = "debian:bookworm-slim";

/// Container settings for per-task sandboxes (`[sandbox]` in anvil.toml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Seconds allowed for a single exec inside the sandbox
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// host path or volume name -> container path
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Prefix for container and network names
    #[serde(default = "default_network_prefix")]
    pub network_prefix: String,
    /// Container runtime CLI
    #[serde(default = "default_docker_cmd")]
    pub docker_cmd: String,
    /// Run inside the sandbox after code is written; non-zero exit fails the story stage
    #[serde(default)]
    pub test_command: Option<String>,
}

fn default_memory() -> String {
    "4g".to_string()
}

fn default_cpus() -> f64 {
    2.0
}

fn default_timeout() -> u64 {
    1800
}

fn default_network_prefix() -> String {
    "anvil".to_string()
}

fn default_docker_cmd() -> String {
    "docker".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: None,
            memory: default_memory(),
            cpus: default_cpus(),
            timeout: default_timeout(),
            volumes: BTreeMap::new(),
            env: BTreeMap::new(),
            network_prefix: default_network_prefix(),
            docker_cmd: default_docker_cmd(),
            test_command: None,
        }
    }
}

impl SandboxConfig {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }
}
