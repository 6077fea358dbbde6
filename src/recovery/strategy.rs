//! Recovery strategies and the system analysis that selects between them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checkpoint::Checkpoint;

/// Strategies in the order they are tried, cheapest first.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Restore from the newest clean checkpoint
    Hot,
    /// Merge every available source, repairing as needed
    Warm,
    /// Rebuild from the transaction log
    Cold,
    /// Salvage fragments, or leave a placeholder task
    Emergency,
}

impl RecoveryStrategy {
    pub const ORDER: [RecoveryStrategy; 4] = [
        RecoveryStrategy::Hot,
        RecoveryStrategy::Warm,
        RecoveryStrategy::Cold,
        RecoveryStrategy::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStrategy::Hot => "hot",
            RecoveryStrategy::Warm => "warm",
            RecoveryStrategy::Cold => "cold",
            RecoveryStrategy::Emergency => "emergency",
        }
    }

    /// Whether this strategy can run against `analysis`.
    pub fn accepts(self, analysis: &SystemAnalysis) -> bool {
        match self {
            RecoveryStrategy::Hot => analysis.clean_checkpoint.is_some(),
            RecoveryStrategy::Warm => {
                analysis.task_files > 0 || analysis.tx_records > 0 || analysis.checkpoints > 0
            }
            RecoveryStrategy::Cold => analysis.tx_records > 0,
            RecoveryStrategy::Emergency => true,
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of what recovery has to work with.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAnalysis {
    pub analyzed_at: DateTime<Utc>,
    /// Backup the hot strategy would restore from
    #[serde(skip)]
    pub clean_checkpoint: Option<Checkpoint>,
    pub clean_checkpoint_id: Option<String>,
    pub checkpoints: usize,
    pub task_files: usize,
    pub readable_tasks: usize,
    pub corrupted_tasks: Vec<String>,
    pub tx_records: usize,
    pub tx_skipped_lines: usize,
}

impl SystemAnalysis {
    pub fn is_healthy(&self) -> bool {
        self.corrupted_tasks.is_empty() && self.tx_skipped_lines == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Succeeded,
    Partial,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedTask {
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyAttempt {
    pub strategy: RecoveryStrategy,
    pub error: String,
}

/// Outcome of one recovery run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub strategy: RecoveryStrategy,
    pub status: RecoveryStatus,
    /// Tasks written back to storage
    pub restored: Vec<String>,
    /// Tasks already current on disk
    pub unchanged: Vec<String>,
    pub failed: Vec<FailedTask>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    /// Strategies that were tried first and failed
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<StrategyAttempt>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RecoveryReport {
    pub(crate) fn new(strategy: RecoveryStrategy, started_at: DateTime<Utc>) -> Self {
        Self {
            strategy,
            status: RecoveryStatus::Succeeded,
            restored: Vec::new(),
            unchanged: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
            checkpoint_id: None,
            attempts: Vec::new(),
            started_at,
            completed_at: started_at,
        }
    }

    pub fn recovered_count(&self) -> usize {
        self.restored.len() + self.unchanged.len()
    }

    pub(crate) fn fail(&mut self, task_id: impl Into<String>, reason: impl Into<String>) {
        self.failed.push(FailedTask {
            task_id: task_id.into(),
            reason: reason.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn analysis() -> SystemAnalysis {
        SystemAnalysis {
            analyzed_at: Utc.timestamp_opt(0, 0).unwrap(),
            clean_checkpoint: None,
            clean_checkpoint_id: None,
            checkpoints: 0,
            task_files: 0,
            readable_tasks: 0,
            corrupted_tasks: Vec::new(),
            tx_records: 0,
            tx_skipped_lines: 0,
        }
    }

    #[test]
    fn empty_system_only_accepts_emergency() {
        let a = analysis();
        let accepted: Vec<_> = RecoveryStrategy::ORDER
            .into_iter()
            .filter(|s| s.accepts(&a))
            .collect();
        assert_eq!(accepted, vec![RecoveryStrategy::Emergency]);
    }

    #[test]
    fn transaction_history_enables_warm_and_cold() {
        let a = SystemAnalysis {
            tx_records: 3,
            ..analysis()
        };
        assert!(!RecoveryStrategy::Hot.accepts(&a));
        assert!(RecoveryStrategy::Warm.accepts(&a));
        assert!(RecoveryStrategy::Cold.accepts(&a));
    }
}
