//! Per-task spend tracking and the pre-phase budget check.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Result of checking an estimated phase cost against a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BudgetDecision {
    Allow,
    /// Projected spend crossed the warning ratio but stays under the ceiling.
    Warn { projected: f64, ceiling: f64 },
    /// Projected spend exceeds the ceiling.
    Block { projected: f64, ceiling: f64 },
}

impl BudgetDecision {
    pub fn is_block(&self) -> bool {
        matches!(self, BudgetDecision::Block { .. })
    }
}

/// Holds one spend counter per task.
///
/// Counters are updated through `DashMap` entry guards, so concurrent story
/// workers recording spend on the same task never lose an update.
#[derive(Debug)]
pub struct BudgetGuard {
    spend: DashMap<String, f64>,
    warn_ratio: f64,
    hard_stop: bool,
}

impl BudgetGuard {
    pub fn new(warn_ratio: f64, hard_stop: bool) -> Self {
        Self {
            spend: DashMap::new(),
            warn_ratio,
            hard_stop,
        }
    }

    /// Whether a `Block` decision should end the task.
    pub fn hard_stop(&self) -> bool {
        self.hard_stop
    }

    /// Check `spent + estimated` against `ceiling`. A ceiling of zero or
    /// less means unlimited.
    pub fn check(&self, task_id: &str, estimated: f64, ceiling: f64) -> BudgetDecision {
        if ceiling <= 0.0 {
            return BudgetDecision::Allow;
        }
        let projected = self.spent(task_id) + estimated.max(0.0);
        if projected > ceiling {
            BudgetDecision::Block { projected, ceiling }
        } else if projected >= ceiling * self.warn_ratio {
            BudgetDecision::Warn { projected, ceiling }
        } else {
            BudgetDecision::Allow
        }
    }

    /// Add actual spend. Returns the new total.
    pub fn record(&self, task_id: &str, cost: f64) -> f64 {
        let mut entry = self.spend.entry(task_id.to_string()).or_insert(0.0);
        *entry += cost.max(0.0);
        *entry
    }

    /// Start a task's counter from a persisted total, e.g. after a restart.
    /// Never lowers an existing counter.
    pub fn seed(&self, task_id: &str, spent: f64) {
        let mut entry = self.spend.entry(task_id.to_string()).or_insert(0.0);
        if spent > *entry {
            *entry = spent;
        }
    }

    pub fn spent(&self, task_id: &str) -> f64 {
        self.spend.get(task_id).map(|v| *v).unwrap_or(0.0)
    }

    /// Drop a task's counter once it reaches a terminal state.
    pub fn release(&self, task_id: &str) {
        self.spend.remove(task_id);
    }
}

impl Default for BudgetGuard {
    fn default() -> Self {
        Self::new(0.8, false)
    }
}
