//! Configuration view and validation commands: `anvil config`.

use anyhow::Result;
use console::style;
use std::path::Path;

use anvil::config::{AnvilToml, Config};
use anvil_common::PhaseType;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = Config::load(project_dir)?;
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No anvil.toml found at {}; using defaults.", config_path.display());
            }
            println!();
            // Effective values, after environment overrides.
            print!("{}", config.toml.to_toml_string()?);
            println!();
            println!("Resolved directories:");
            println!("  tasks      = {}", config.tasks_dir.display());
            println!("  workspaces = {}", config.workspaces_dir.display());
            println!("  logs       = {}", config.log_dir.display());
            match &config.backup_dir {
                Some(dir) => println!("  backups    = {}", dir.display()),
                None => println!("  backups    = (disabled)"),
            }
            println!();
            println!("Phase policy:");
            for phase in PhaseType::ORDER {
                let s = config.toml.phase_settings(phase);
                println!(
                    "  {:<15} ceiling=${:.2} estimate=${:.2} attempts={} approval={}",
                    phase.as_str(),
                    s.ceiling,
                    s.estimated_cost,
                    s.max_attempts,
                    s.requires_approval
                );
            }
        }
        Some(ConfigCommands::Validate) => {
            if !config_path.exists() {
                println!("No anvil.toml found. Using defaults (valid).");
                return Ok(());
            }
            let warnings = config.toml.validate();
            if warnings.is_empty() {
                println!("{} Configuration is valid.", style("✓").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {warning}");
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("anvil.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(&config.anvil_dir)?;
            AnvilToml::default().save(&config_path)?;
            println!("Created anvil.toml at {}", config_path.display());
        }
    }

    Ok(())
}
