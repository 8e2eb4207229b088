//! Inspection and control commands for a single task.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;

use anvil::config::Config;
use anvil::control::{ControlSignal, FileControl, TaskControl};
use anvil::events::EventLog;
use anvil::memory::summary;
use anvil_common::{ExecutionMap, PhaseType};

use super::open_store;

async fn load_map(config: &Config, task: &str) -> Result<ExecutionMap> {
    let (store, _) = open_store(config);
    match store.load(task).await? {
        Some(map) => Ok(map),
        None => bail!("No task '{task}' in {}", config.tasks_dir.display()),
    }
}

pub async fn cmd_resume_point(project_dir: &Path, task: &str, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let (store, _) = open_store(&config);
    let point = store.get_resumption_point(task).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&point)?);
        return Ok(());
    }

    match point.resume_from_phase {
        None => println!("{} Every phase of {task} is complete", style("✓").green()),
        Some(phase) => {
            println!("Resume from: {}", style(phase).bold());
            if let Some(epic) = &point.resume_from_epic {
                println!("  epic:  {epic}");
            }
            if let Some(story) = &point.resume_from_story {
                match point.resume_from_stage {
                    Some(stage) => println!("  story: {story} (at {stage})"),
                    None => println!("  story: {story}"),
                }
            }
        }
    }
    let phases: Vec<&str> = point.completed_phases.iter().map(|p| p.as_str()).collect();
    println!("Completed phases:  {}", list_or_none(&phases));
    println!("Completed epics:   {}", list_or_none(&point.completed_epics));
    println!("Completed stories: {}", list_or_none(&point.completed_stories));
    Ok(())
}

fn list_or_none<S: AsRef<str>>(items: &[S]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(", ")
    }
}

pub async fn cmd_status(project_dir: &Path, task: &str) -> Result<()> {
    let config = Config::load(project_dir)?;
    let map = load_map(&config, task).await?;
    print!("{}", summary::render(&map));
    Ok(())
}

pub async fn cmd_events(project_dir: &Path, task: &str, json: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let (_, events) = open_store(&config);
    let events = events.get_events(task).await?;

    if json {
        for event in &events {
            println!("{}", serde_json::to_string(event)?);
        }
        return Ok(());
    }
    if events.is_empty() {
        println!("No events recorded for {task}");
        return Ok(());
    }
    for event in &events {
        let id = event
            .payload
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        println!(
            "{}  {:<26} {:<12} {}",
            style(event.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
            event.event_type.as_str(),
            event.agent_name,
            id
        );
    }
    Ok(())
}

pub async fn cmd_approve(
    project_dir: &Path,
    task: &str,
    phase: &str,
    epic: Option<&str>,
) -> Result<()> {
    let config = Config::load(project_dir)?;
    let phase: PhaseType = phase.parse()?;
    let (store, _) = open_store(&config);
    store.approve(task, phase, epic).await?;
    store.flush_replication().await;

    let scope = epic.map(|e| format!(" (epic {e})")).unwrap_or_default();
    println!(
        "{} Approved {phase}{scope} for {task}. Continue with: anvil run {task}",
        style("✓").green()
    );
    Ok(())
}

fn request_signal(project_dir: &Path, task: &str, signal: ControlSignal) -> Result<Config> {
    let config = Config::load(project_dir)?;
    FileControl::new(config.tasks_dir.clone()).request(task, signal)?;
    Ok(config)
}

pub fn cmd_cancel(project_dir: &Path, task: &str) -> Result<()> {
    request_signal(project_dir, task, ControlSignal::Cancel)?;
    println!("Cancel requested for {task}; the run stops before its next unit of work.");
    Ok(())
}

pub fn cmd_pause(project_dir: &Path, task: &str) -> Result<()> {
    request_signal(project_dir, task, ControlSignal::Pause)?;
    println!("Pause requested for {task}; the run stops at the next phase boundary.");
    Ok(())
}

pub async fn cmd_rebuild(project_dir: &Path, task: &str) -> Result<()> {
    let config = Config::load(project_dir)?;
    let (store, _) = open_store(&config);
    let stats = store.rebuild_from_events(task).await?;
    store.flush_replication().await;
    println!(
        "Rebuilt {task}: {} applied, {} duplicate, {} malformed",
        stats.applied, stats.duplicates, stats.malformed
    );
    Ok(())
}

pub async fn cmd_errors(project_dir: &Path, task: &str, all: bool) -> Result<()> {
    let config = Config::load(project_dir)?;
    let map = load_map(&config, task).await?;

    let shown: Vec<_> = map
        .detailed_errors
        .iter()
        .filter(|e| all || !e.resolved)
        .collect();
    if shown.is_empty() {
        println!("No {}errors for {task}", if all { "" } else { "open " });
        return Ok(());
    }

    for err in shown {
        let marker = if err.resolved {
            style("resolved").dim()
        } else {
            style("open").red()
        };
        println!(
            "{} [{}] {} ({}, {})",
            style(err.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
            err.phase,
            style(err.error_code).bold(),
            err.severity,
            marker
        );
        println!("    {}", err.message.lines().next().unwrap_or_default());
        println!("    {}", style(&err.hypothesis).dim());
        for fix in &err.suggested_fixes {
            println!("    → {fix}");
        }
    }
    Ok(())
}
