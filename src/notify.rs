//! Operator notifications for phase lifecycle and budget warnings.

use std::time::Duration;

use async_trait::async_trait;
use console::style;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PhaseStart,
    PhaseComplete,
    PhaseError,
    BudgetWarning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub task_id: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

impl Notification {
    pub fn new(kind: NotificationKind, task_id: &str, phase: &str) -> Self {
        Self {
            kind,
            task_id: task_id.to_string(),
            phase: phase.to_string(),
            duration_ms: None,
            error: None,
            suggestions: Vec::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>, suggestions: Vec<String>) -> Self {
        self.error = Some(error.into());
        self.suggestions = suggestions;
        self
    }
}

/// Delivery is fire-and-forget; a notifier must never fail the engine.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

/// Writes notifications into the tracing stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, n: &Notification) {
        match n.kind {
            NotificationKind::PhaseStart => {
                info!(task_id = %n.task_id, phase = %n.phase, "Phase started")
            }
            NotificationKind::PhaseComplete => info!(
                task_id = %n.task_id,
                phase = %n.phase,
                duration_ms = n.duration_ms.unwrap_or_default(),
                "Phase completed"
            ),
            NotificationKind::PhaseError => error!(
                task_id = %n.task_id,
                phase = %n.phase,
                error = n.error.as_deref().unwrap_or_default(),
                suggestions = ?n.suggestions,
                "Phase failed"
            ),
            NotificationKind::BudgetWarning => warn!(
                task_id = %n.task_id,
                phase = %n.phase,
                detail = n.error.as_deref().unwrap_or_default(),
                "Budget warning"
            ),
        }
    }
}

/// Fans notifications out to any number of in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, notification: &Notification) {
        // No subscribers is not an error.
        let _ = self.tx.send(notification.clone());
    }
}

/// Styled one-line progress for the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, n: &Notification) {
        match n.kind {
            NotificationKind::PhaseStart => {
                println!("{} {}", style("▶").cyan(), style(&n.phase).bold());
            }
            NotificationKind::PhaseComplete => {
                let secs = n.duration_ms.unwrap_or_default() as f64 / 1000.0;
                println!(
                    "{} {} {}",
                    style("✓").green(),
                    style(&n.phase).bold(),
                    style(format!("({secs:.1}s)")).dim()
                );
            }
            NotificationKind::PhaseError => {
                println!(
                    "{} {}: {}",
                    style("✗").red(),
                    style(&n.phase).bold(),
                    n.error.as_deref().unwrap_or("failed")
                );
                for suggestion in &n.suggestions {
                    println!("    {} {}", style("→").dim(), suggestion);
                }
            }
            NotificationKind::BudgetWarning => {
                println!(
                    "{} {}: {}",
                    style("!").yellow(),
                    style(&n.phase).bold(),
                    n.error.as_deref().unwrap_or("budget warning")
                );
            }
        }
    }
}

/// Delivers to several notifiers in order.
#[derive(Default)]
pub struct FanoutNotifier {
    targets: Vec<Box<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: impl Notifier + 'static) -> Self {
        self.targets.push(Box::new(notifier));
        self
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, notification: &Notification) {
        for target in &self.targets {
            target.notify(notification).await;
        }
    }
}
