//! Unified configuration for Anvil.
//!
//! Settings are read from `.anvil/anvil.toml`, then overridden from `ANVIL_*`
//! environment variables, then from CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! name = "billing"
//!
//! [engine]
//! max_attempts = 3
//! multi_team = true
//! max_parallel_stories = 4
//! agent_timeout_secs = 1800
//!
//! [budget]
//! task_ceiling = 50.0
//! warn_ratio = 0.8
//! hard_stop = false
//!
//! [phases.overrides."impl*"]
//! ceiling = 10.0
//! estimated_cost = 2.5
//!
//! [phases.overrides."integration"]
//! requires_approval = true
//!
//! [storage]
//! backup_root = "/mnt/shared/anvil-backups"
//!
//! [sandbox]
//! image = "node:22-slim"
//! memory = "8g"
//! test_command = "npm test"
//!
//! [agent]
//! cmd = "claude"
//!
//! [logging]
//! level = "info"
//! json = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anvil_common::PhaseType;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxConfig;

pub const ANVIL_DIR: &str = ".anvil";
pub const CONFIG_FILE: &str = "anvil.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name (defaults to the directory name)
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per phase before a retryable violation becomes fatal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Run story-scoped phases once per epic
    #[serde(default)]
    pub multi_team: bool,
    #[serde(default = "default_max_parallel_stories")]
    pub max_parallel_stories: usize,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_parallel_stories() -> usize {
    4
}

fn default_agent_timeout_secs() -> u64 {
    1800
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            multi_team: false,
            max_parallel_stories: default_max_parallel_stories(),
            agent_timeout_secs: default_agent_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Dollar ceiling for the whole task. Non-positive means unlimited.
    #[serde(default = "default_task_ceiling")]
    pub task_ceiling: f64,
    /// Fraction of the ceiling at which a warning is raised
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
    /// Block phases that would exceed the ceiling instead of warning
    #[serde(default)]
    pub hard_stop: bool,
}

fn default_task_ceiling() -> f64 {
    50.0
}

fn default_warn_ratio() -> f64 {
    0.8
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            task_ceiling: default_task_ceiling(),
            warn_ratio: default_warn_ratio(),
            hard_stop: false,
        }
    }
}

/// Phase-specific override settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub ceiling: Option<f64>,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
    #[serde(default)]
    pub requires_approval: Option<bool>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasesConfig {
    /// Pattern-based overrides (e.g. "impl*" -> PhaseOverride)
    #[serde(default)]
    pub overrides: BTreeMap<String, PhaseOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Where task directories live (default: `.anvil/tasks`)
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Backup replication target (default: `~/.anvil/backups/<project>`)
    #[serde(default)]
    pub backup_root: Option<PathBuf>,
    /// Disable backup replication entirely
    #[serde(default)]
    pub disable_backup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent CLI command (default: "claude")
    #[serde(default)]
    pub cmd: Option<String>,
    /// Extra flags passed before the generated ones
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rolling log files (default: `.anvil/logs`)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Write JSON lines to the rolling file
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            json: false,
        }
    }
}

/// The complete anvil.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnvilToml {
    #[serde(default)]
    pub project: ProjectConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub phases: PhasesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Resolved policy for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSettings {
    pub ceiling: f64,
    pub estimated_cost: f64,
    pub requires_approval: bool,
    pub max_attempts: u32,
}

impl AnvilToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse anvil.toml")
    }

    /// Load `.anvil/anvil.toml`, or defaults when the file doesn't exist.
    pub fn load_or_default(anvil_dir: &Path) -> Result<Self> {
        let config_path = anvil_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize anvil.toml")
    }

    /// Apply `ANVIL_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides through a lookup function.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ANVIL_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.engine.max_attempts = v;
        }
        if let Some(v) = lookup("ANVIL_MULTI_TEAM") {
            self.engine.multi_team = parse_flag(&v);
        }
        if let Some(v) = lookup("ANVIL_MAX_PARALLEL_STORIES").and_then(|v| v.parse().ok()) {
            self.engine.max_parallel_stories = v;
        }
        if let Some(v) = lookup("ANVIL_TASK_CEILING").and_then(|v| v.parse().ok()) {
            self.budget.task_ceiling = v;
        }
        if let Some(v) = lookup("ANVIL_HARD_STOP") {
            self.budget.hard_stop = parse_flag(&v);
        }
        if let Some(v) = lookup("ANVIL_BACKUP_DIR") {
            self.storage.backup_root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ANVIL_SANDBOX_IMAGE") {
            self.sandbox.image = Some(v);
        }
        if let Some(v) = lookup("ANVIL_AGENT_CMD").or_else(|| lookup("CLAUDE_CMD")) {
            self.agent.cmd = Some(v);
        }
        if let Some(v) = lookup("ANVIL_LOG_JSON") {
            self.logging.json = parse_flag(&v);
        }
    }

    pub fn agent_cmd(&self) -> String {
        self.agent
            .cmd
            .clone()
            .unwrap_or_else(|| "claude".to_string())
    }

    /// Effective policy for a phase, applying every matching override in
    /// pattern order.
    pub fn phase_settings(&self, phase: PhaseType) -> PhaseSettings {
        phase_settings(&self.engine, &self.budget, &self.phases, phase)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.max_attempts == 0 {
            warnings.push("engine.max_attempts is 0: phases will never run".to_string());
        }
        if self.engine.max_parallel_stories == 0 {
            warnings.push("engine.max_parallel_stories must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.budget.warn_ratio) {
            warnings.push(format!(
                "budget.warn_ratio {} should be between 0 and 1",
                self.budget.warn_ratio
            ));
        }
        if self.sandbox.cpus <= 0.0 {
            warnings.push(format!("sandbox.cpus {} must be positive", self.sandbox.cpus));
        }

        for pattern in self.phases.overrides.keys() {
            if !PhaseType::ORDER
                .iter()
                .any(|p| pattern_matches(pattern, p.as_str()))
            {
                warnings.push(format!(
                    "Override pattern '{}' does not match any phase",
                    pattern
                ));
            }
        }

        warnings
    }
}

/// Shared resolution used by both the file config and the engine settings.
pub fn phase_settings(
    engine: &EngineConfig,
    budget: &BudgetConfig,
    phases: &PhasesConfig,
    phase: PhaseType,
) -> PhaseSettings {
    let mut settings = PhaseSettings {
        ceiling: budget.task_ceiling,
        estimated_cost: 0.0,
        requires_approval: false,
        max_attempts: engine.max_attempts,
    };

    for (pattern, over) in &phases.overrides {
        if pattern_matches(pattern, phase.as_str()) {
            if let Some(ceiling) = over.ceiling {
                settings.ceiling = ceiling;
            }
            if let Some(estimate) = over.estimated_cost {
                settings.estimated_cost = estimate;
            }
            if let Some(approval) = over.requires_approval {
                settings.requires_approval = approval;
            }
            if let Some(attempts) = over.max_attempts {
                settings.max_attempts = attempts;
            }
        }
    }

    settings
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Check if a pattern matches a phase name.
/// Supports simple glob patterns:
/// - `*` matches any sequence of characters
/// - `?` matches any single character
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    glob_match(&pattern, &name)
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

/// Runtime configuration: the parsed file plus resolved directories.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub anvil_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub workspaces_dir: PathBuf,
    pub log_dir: PathBuf,
    pub toml: AnvilToml,
}

impl Config {
    /// Load configuration for a project: file, then environment.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let anvil_dir = project_dir.join(ANVIL_DIR);
        let mut toml = AnvilToml::load_or_default(&anvil_dir)?;
        toml.apply_env();
        Ok(Self::from_toml(project_dir, toml))
    }

    pub fn from_toml(project_dir: PathBuf, toml: AnvilToml) -> Self {
        let anvil_dir = project_dir.join(ANVIL_DIR);
        let tasks_dir = toml
            .storage
            .root
            .as_ref()
            .map(|p| resolve(&project_dir, p))
            .unwrap_or_else(|| anvil_dir.join("tasks"));

        let backup_dir = if toml.storage.disable_backup {
            None
        } else {
            toml.storage
                .backup_root
                .as_ref()
                .map(|p| resolve(&project_dir, p))
                .or_else(|| {
                    let project = toml.project.name.clone().unwrap_or_else(|| {
                        project_dir
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_else(|| "default".to_string())
                    });
                    dirs::home_dir().map(|home| home.join(ANVIL_DIR).join("backups").join(project))
                })
        };

        let log_dir = toml
            .logging
            .dir
            .as_ref()
            .map(|p| resolve(&project_dir, p))
            .unwrap_or_else(|| anvil_dir.join("logs"));

        Self {
            workspaces_dir: anvil_dir.join("workspaces"),
            project_dir,
            anvil_dir,
            tasks_dir,
            backup_dir,
            log_dir,
            toml,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.anvil_dir.join(CONFIG_FILE)
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.tasks_dir).context("Failed to create tasks directory")?;
        std::fs::create_dir_all(&self.workspaces_dir)
            .context("Failed to create workspaces directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
