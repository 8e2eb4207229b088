//! `anvil init`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use anvil::config::{AnvilToml, CONFIG_FILE, Config};

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let config = Config::load(project_dir)?;
    std::fs::create_dir_all(&config.anvil_dir)
        .with_context(|| format!("Failed to create {}", config.anvil_dir.display()))?;
    config.ensure_directories()?;

    let config_path = config.config_path();
    if config_path.exists() {
        println!(
            "Anvil project already initialized at {}",
            style(config.anvil_dir.display()).bold()
        );
        return Ok(());
    }
    AnvilToml::default().save(&config_path)?;

    println!(
        "{} Initialized anvil project at {}",
        style("✓").green(),
        style(config.anvil_dir.display()).bold()
    );
    println!();
    println!("  .anvil/");
    println!("  ├── {CONFIG_FILE:<12} # Engine, budget, sandbox and agent settings");
    println!("  ├── tasks/       # Execution maps and event logs");
    println!("  ├── workspaces/  # Per-story sandbox workspaces");
    println!("  └── logs/        # Rolling log files");
    println!();
    println!("Next: anvil run <task> --description \"...\"");
    Ok(())
}
