use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Crash-safe multi-agent development orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, env = "ANVIL_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .anvil/ with a default anvil.toml
    Init,
    /// Run a task, resuming wherever it stopped
    Run {
        task: String,
        /// What to build (required the first time a task runs)
        #[arg(short, long)]
        description: Option<String>,
        /// Start at this phase instead of planning
        #[arg(long)]
        from_phase: Option<String>,
        /// Run implementation and review once per epic
        #[arg(long)]
        multi_team: bool,
    },
    /// Show where a task would resume
    ResumePoint {
        task: String,
        #[arg(long)]
        json: bool,
    },
    /// Summarize a task's phases, epics and stories
    Status { task: String },
    /// List a task's structural events
    Events {
        task: String,
        #[arg(long)]
        json: bool,
    },
    /// Release an approval gate
    Approve {
        task: String,
        phase: String,
        /// Approve one epic's phase in multi-team mode
        #[arg(long)]
        epic: Option<String>,
    },
    /// Ask a running task to stop and tear down its sandboxes
    Cancel { task: String },
    /// Ask a running task to stop at the next phase boundary
    Pause { task: String },
    /// Merge the event log back into the execution map
    Rebuild { task: String },
    /// Show classified errors for a task
    Errors {
        task: String,
        /// Include resolved errors
        #[arg(long)]
        all: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default anvil.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Run {
            task,
            description,
            from_phase,
            multi_team,
        } => {
            let options = cmd::RunOptions {
                description: description.clone(),
                from_phase: from_phase.clone(),
                multi_team: *multi_team,
                verbose: cli.verbose,
            };
            cmd::cmd_run(&project_dir, task, options).await?;
        }
        Commands::ResumePoint { task, json } => {
            cmd::cmd_resume_point(&project_dir, task, *json).await?
        }
        Commands::Status { task } => cmd::cmd_status(&project_dir, task).await?,
        Commands::Events { task, json } => cmd::cmd_events(&project_dir, task, *json).await?,
        Commands::Approve { task, phase, epic } => {
            cmd::cmd_approve(&project_dir, task, phase, epic.as_deref()).await?
        }
        Commands::Cancel { task } => cmd::cmd_cancel(&project_dir, task)?,
        Commands::Pause { task } => cmd::cmd_pause(&project_dir, task)?,
        Commands::Rebuild { task } => cmd::cmd_rebuild(&project_dir, task).await?,
        Commands::Errors { task, all } => cmd::cmd_errors(&project_dir, task, *all).await?,
    }

    Ok(())
}
