//! Tracing setup for the CLI.
//!
//! Diagnostics go to stderr so command output on stdout stays parseable.
//! With a log directory configured, a daily rolling file receives the same
//! events (JSON lines when `logging.json` is set).

use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

pub const LOG_ENV: &str = "ANVIL_LOG";
const LOG_FILE: &str = "anvil.log";

fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .with_context(|| format!("Invalid log level '{level}'"))
}

/// Filter from `ANVIL_LOG`, then `RUST_LOG`, then the configured level.
fn build_filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        parse_level(&config.level)?
    };
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .unwrap_or_default();
    Ok(EnvFilter::builder()
        .with_default_directive(default.into())
        .parse_lossy(directives))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init(config: &LoggingConfig, log_dir: Option<&Path>, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config, verbose)?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(filter.clone());

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, LOG_FILE));

    let file_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_current_span(true)
            .with_target(true)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(Some(guard))
}
