//! `anvil run`: drive a task through its phases.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;

use anvil::config::Config;
use anvil::control::{ControlSignal, FileControl, TaskControl};
use anvil::engine::{PhaseEngine, PhaseServices, TaskOutcome};
use anvil::events::EventLog;
use anvil::executor::ClaudeCliExecutor;
use anvil::logging;
use anvil::notify::{ConsoleNotifier, FanoutNotifier, TracingNotifier};
use anvil::sandbox::{DockerCli, SandboxManager};
use anvil::scm::GitCli;
use anvil_common::PhaseType;
use tracing::warn;

use super::open_store;

pub struct RunOptions {
    pub description: Option<String>,
    pub from_phase: Option<String>,
    pub multi_team: bool,
    pub verbose: bool,
}

/// The pipeline from `from` onwards.
fn phases_from(from: Option<&str>) -> Result<Vec<PhaseType>> {
    let Some(from) = from else {
        return Ok(PhaseType::ORDER.to_vec());
    };
    let start: PhaseType = from.parse()?;
    Ok(PhaseType::ORDER
        .iter()
        .copied()
        .skip_while(|p| *p != start)
        .collect())
}

fn build_services(config: &Config) -> PhaseServices {
    let toml = &config.toml;
    let (store, events) = open_store(config);
    let runtime = Arc::new(DockerCli::new(toml.sandbox.docker_cmd.clone()));
    let sandboxes = SandboxManager::new(
        runtime,
        toml.sandbox.clone(),
        config.workspaces_dir.clone(),
    );
    let executor = ClaudeCliExecutor::new(
        toml.agent_cmd(),
        toml.agent.flags.clone(),
        toml.engine.agent_timeout(),
    )
    .with_docker_cmd(toml.sandbox.docker_cmd.clone());

    PhaseServices {
        store,
        events,
        sandboxes: Arc::new(sandboxes),
        executor: Arc::new(executor),
        scm: Arc::new(GitCli::new()),
        control: Arc::new(FileControl::new(config.tasks_dir.clone())),
        max_parallel_stories: toml.engine.max_parallel_stories,
        agent_timeout: toml.engine.agent_timeout(),
    }
}

pub async fn cmd_run(project_dir: &Path, task: &str, options: RunOptions) -> Result<()> {
    let mut config = Config::load(project_dir)?;
    if options.multi_team {
        config.toml.engine.multi_team = true;
    }
    config.ensure_directories()?;
    let _log_guard = logging::init(&config.toml.logging, Some(&config.log_dir), options.verbose)?;

    let phases = phases_from(options.from_phase.as_deref())?;
    if phases.is_empty() {
        bail!("No phases to run");
    }

    let services = build_services(&config);
    let store = services.store.clone();
    let control = services.control.clone();

    let known = store.load(task).await?.is_some()
        || !services.events.get_events(task).await?.is_empty();
    let description = match options.description {
        Some(description) => description,
        None if known => String::new(),
        None => bail!("Task '{task}' does not exist yet; pass --description to start it"),
    };

    let engine = PhaseEngine::new(&config.toml, services)
        .with_notifier(Arc::new(
            FanoutNotifier::new()
                .with(ConsoleNotifier)
                .with(TracingNotifier),
        ))
        .with_default_bodies();

    println!(
        "{} {} ({})",
        style("Running").bold(),
        style(task).cyan(),
        phases
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
    );

    let interrupt = {
        let task = task.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} Cancelling {task}...", style("!").yellow());
                if let Err(e) = control.request(&task, ControlSignal::Cancel) {
                    warn!(task_id = %task, error = %e, "Could not record cancel request");
                }
            }
        })
    };
    let result = engine.run(task, &description, &phases).await;
    interrupt.abort();
    store.flush_replication().await;

    match result? {
        TaskOutcome::Completed => {
            let cost = store.load(task).await?.map(|m| m.total_cost).unwrap_or_default();
            println!(
                "{} Task {} finished its phases (${cost:.2} spent)",
                style("✓").green(),
                style(task).bold()
            );
        }
        TaskOutcome::Cancelled => {
            println!("{} Task {} cancelled", style("■").yellow(), style(task).bold());
        }
        TaskOutcome::Paused { phase } => {
            println!(
                "{} Task {} paused before {phase}. Resume with: anvil run {task}",
                style("‖").yellow(),
                style(task).bold()
            );
        }
        TaskOutcome::AwaitingApproval { phase } => {
            println!(
                "{} {phase} needs approval. Run: anvil approve {task} {phase}",
                style("?").cyan()
            );
        }
        TaskOutcome::Failed {
            phase,
            error,
            error_code,
        } => {
            bail!("Task {task} failed in {phase} [{error_code}]: {error}");
        }
    }
    Ok(())
}
