//! Transaction log
//!
//! Append-only record of every accepted task write, stored as JSONL at
//! `.gemini-tasks/metadata/transactions.jsonl`. Each record carries the full
//! task as written, so the log alone is enough to rebuild task state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lock::LockProvider;
use crate::storage::Storage;
use crate::task::Task;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TxOp {
    Create,
    Update,
    Delete,
    Restore,
    Recover,
}

impl fmt::Display for TxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxOp::Create => "create",
            TxOp::Update => "update",
            TxOp::Delete => "delete",
            TxOp::Restore => "restore",
            TxOp::Recover => "recover",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TxRecord {
    pub tx_id: String,
    pub task_id: String,
    pub op: TxOp,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub version: u64,
    /// Task as written by this transaction
    pub task: Task,
}

/// Filter for selecting transaction records
#[derive(Debug, Clone, Default)]
pub struct TxFilter {
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl TxFilter {
    pub fn matches(&self, record: &TxRecord) -> bool {
        if let Some(task_id) = &self.task_id {
            if &record.task_id != task_id {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if record.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = &self.since {
            if &record.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Result of reading the log: parsed records plus lines that were unreadable
#[derive(Debug, Clone, Default)]
pub struct TxReplay {
    pub records: Vec<TxRecord>,
    pub skipped_lines: usize,
}

impl TxReplay {
    /// Records grouped per task id, each group in log order.
    pub fn by_task(&self) -> BTreeMap<String, Vec<&TxRecord>> {
        let mut groups: BTreeMap<String, Vec<&TxRecord>> = BTreeMap::new();
        for record in &self.records {
            groups.entry(record.task_id.clone()).or_default().push(record);
        }
        groups
    }
}

/// Transaction log manager
#[derive(Clone)]
pub struct TxLog {
    storage: Storage,
    locks: Arc<dyn LockProvider>,
    lock_timeout_ms: u64,
}

impl fmt::Debug for TxLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxLog")
            .field("path", &self.storage.transactions_file())
            .field("lock_timeout_ms", &self.lock_timeout_ms)
            .finish()
    }
}

impl TxLog {
    pub fn new(storage: Storage, locks: Arc<dyn LockProvider>, lock_timeout_ms: u64) -> Self {
        Self {
            storage,
            locks,
            lock_timeout_ms,
        }
    }

    pub fn is_available(&self) -> bool {
        self.storage.transactions_file().exists()
    }

    /// Append a record under the log's lock
    pub fn append(&self, record: &TxRecord) -> Result<()> {
        let path = self.storage.transactions_file();
        let _lock = self.locks.lock(&path, self.lock_timeout_ms)?;
        self.storage.append_jsonl(&path, record)
    }

    /// Read every readable record in log order
    pub fn read_all(&self) -> Result<TxReplay> {
        let path = self.storage.transactions_file();
        if !path.exists() {
            return Ok(TxReplay::default());
        }
        let _lock = self.locks.lock(&path, self.lock_timeout_ms)?;
        let (records, skipped_lines) = self.storage.read_jsonl_lenient(&path)?;
        Ok(TxReplay {
            records,
            skipped_lines,
        })
    }

    /// Matching records, newest first
    pub fn read_filtered(&self, filter: &TxFilter, limit: Option<usize>) -> Result<Vec<TxRecord>> {
        let mut records: Vec<TxRecord> = self
            .read_all()?
            .records
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect();
        records.reverse();
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::FsLockProvider;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(tx: &str, task_id: &str, op: TxOp, secs: i64) -> TxRecord {
        let task = Task::new(task_id, "title", at(secs));
        TxRecord {
            tx_id: tx.to_string(),
            task_id: task_id.to_string(),
            op,
            timestamp: at(secs),
            session_id: Some("s1".to_string()),
            version: task.version,
            task,
        }
    }

    #[test]
    fn append_and_group_records() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path());
        let log = TxLog::new(storage, Arc::new(FsLockProvider), 1000);
        assert!(!log.is_available());

        log.append(&record("1", "a", TxOp::Create, 0)).unwrap();
        log.append(&record("2", "b", TxOp::Create, 1)).unwrap();
        log.append(&record("3", "a", TxOp::Update, 2)).unwrap();
        assert!(log.is_available());

        let replay = log.read_all().unwrap();
        assert_eq!(replay.records.len(), 3);
        let groups = replay.by_task();
        let a: Vec<TxOp> = groups["a"].iter().map(|r| r.op).collect();
        assert_eq!(a, vec![TxOp::Create, TxOp::Update]);
    }

    #[test]
    fn filtered_reads_are_newest_first() {
        let temp = TempDir::new().unwrap();
        let log = TxLog::new(Storage::new(temp.path()), Arc::new(FsLockProvider), 1000);
        for (i, task) in ["a", "b", "a"].iter().enumerate() {
            log.append(&record(&i.to_string(), task, TxOp::Update, i as i64))
                .unwrap();
        }
        let filter = TxFilter {
            task_id: Some("a".to_string()),
            ..TxFilter::default()
        };
        let records = log.read_filtered(&filter, Some(1)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tx_id, "2");
    }
}
