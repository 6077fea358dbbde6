//! Checkpoints: immutable, integrity-hashed snapshots of task state.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::integrity;
use crate::lock::LockProvider;
use crate::storage::{validate_entity_id, Storage};
use crate::task::Task;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Manual,
    Automatic,
    Emergency,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckpointKind::Manual => "manual",
            CheckpointKind::Automatic => "automatic",
            CheckpointKind::Emergency => "emergency",
        })
    }
}

/// Live task ids grouped by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct QueueSnapshot(pub BTreeMap<String, Vec<String>>);

impl QueueSnapshot {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut queues: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for task in tasks.iter().filter(|task| !task.is_deleted()) {
            queues
                .entry(task.status.as_str().to_string())
                .or_default()
                .push(task.id.clone());
        }
        for ids in queues.values_mut() {
            ids.sort();
        }
        Self(queues)
    }

    pub fn queue(&self, status: &str) -> &[String] {
        self.0.get(status).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub task_snapshot: Vec<Task>,
    pub queue_snapshot: QueueSnapshot,
    #[serde(default)]
    pub active_transactions: Vec<String>,
    #[serde(rename = "type")]
    pub kind: CheckpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Canonical-JSON byte length of the task snapshot
    pub size: usize,
    pub integrity_hash: String,
}

impl Checkpoint {
    pub fn new(
        id: impl Into<String>,
        timestamp: DateTime<Utc>,
        session_id: impl Into<String>,
        mut tasks: Vec<Task>,
        active_transactions: Vec<String>,
        kind: CheckpointKind,
    ) -> Result<Self> {
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        let size = integrity::canonical_json(&tasks)?.len();
        let mut checkpoint = Self {
            id: id.into(),
            timestamp,
            session_id: session_id.into(),
            queue_snapshot: QueueSnapshot::from_tasks(&tasks),
            task_snapshot: tasks,
            active_transactions,
            kind,
            reason: None,
            size,
            integrity_hash: String::new(),
        };
        checkpoint.integrity_hash = checkpoint.compute_hash()?;
        Ok(checkpoint)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Result<Self> {
        self.reason = Some(reason.into());
        self.integrity_hash = self.compute_hash()?;
        Ok(self)
    }

    /// Hash over every field except the hash itself, snapshots included.
    pub fn compute_hash(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.integrity_hash = String::new();
        integrity::hash_canonical(&unsealed)
    }

    pub fn verify(&self) -> Result<()> {
        let actual = self.compute_hash()?;
        if actual != self.integrity_hash {
            return Err(Error::integrity(
                format!("checkpoint {}", self.id),
                format!(
                    "integrity hash mismatch (stored {}, computed {actual})",
                    self.integrity_hash
                ),
            ));
        }
        Ok(())
    }

    pub fn live_tasks(&self) -> impl Iterator<Item = &Task> {
        self.task_snapshot.iter().filter(|task| !task.is_deleted())
    }
}

/// One line of a checkpoint listing
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: CheckpointKind,
    pub task_count: usize,
    pub size: usize,
    pub valid: bool,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            id: checkpoint.id.clone(),
            timestamp: checkpoint.timestamp,
            session_id: checkpoint.session_id.clone(),
            kind: checkpoint.kind,
            task_count: checkpoint.live_tasks().count(),
            size: checkpoint.size,
            valid: checkpoint.verify().is_ok(),
        }
    }
}

/// Reads and writes checkpoint files.
#[derive(Clone)]
pub struct CheckpointStore {
    storage: Storage,
    locks: Arc<dyn LockProvider>,
    lock_timeout_ms: u64,
}

impl fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("dir", &self.storage.checkpoints_dir())
            .finish_non_exhaustive()
    }
}

impl CheckpointStore {
    pub fn new(storage: Storage, locks: Arc<dyn LockProvider>, lock_timeout_ms: u64) -> Self {
        Self {
            storage,
            locks,
            lock_timeout_ms,
        }
    }

    /// Write a new checkpoint. Existing checkpoints are never overwritten.
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        validate_entity_id("checkpoint", &checkpoint.id)?;
        let path = self.storage.checkpoint_file(&checkpoint.id);
        fs::create_dir_all(self.storage.checkpoints_dir())?;
        let _lock = self.locks.lock(&path, self.lock_timeout_ms)?;
        if path.exists() {
            return Err(Error::OperationFailed(format!(
                "checkpoint already exists: {}",
                checkpoint.id
            )));
        }
        self.storage.write_json(&path, checkpoint)?;
        Ok(path)
    }

    /// Load a checkpoint without verifying it. Unparseable files are integrity failures.
    pub fn load(&self, id: &str) -> Result<Checkpoint> {
        validate_entity_id("checkpoint", id)?;
        let path = self.storage.checkpoint_file(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    entity: "checkpoint",
                    id: id.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&content).map_err(|err| {
            Error::integrity(
                format!("checkpoint {id}"),
                format!("unreadable checkpoint file: {err}"),
            )
        })
    }

    pub fn load_verified(&self, id: &str) -> Result<Checkpoint> {
        let checkpoint = self.load(id)?;
        checkpoint.verify()?;
        if checkpoint.id != id {
            return Err(Error::integrity(
                format!("checkpoint {id}"),
                format!("file holds checkpoint {}", checkpoint.id),
            ));
        }
        Ok(checkpoint)
    }

    /// Readable checkpoints, oldest first (timestamp, then id).
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for id in self.storage.list_checkpoint_ids()? {
            match self.load(&id) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(Error::Integrity { detail, .. }) => {
                    tracing::warn!(checkpoint_id = %id, %detail, "skipping unreadable checkpoint");
                }
                Err(Error::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        checkpoints.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(checkpoints)
    }

    pub fn summaries(&self) -> Result<Vec<CheckpointSummary>> {
        Ok(self.list()?.iter().map(CheckpointSummary::from).collect())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.storage.list_checkpoint_ids()?.len())
    }

    /// Newest checkpoint that passes verification, optionally for one session.
    pub fn latest_valid(&self, session_id: Option<&str>) -> Result<Option<Checkpoint>> {
        let mut checkpoints = self.list()?;
        checkpoints.reverse();
        for checkpoint in checkpoints {
            if let Some(session_id) = session_id {
                if checkpoint.session_id != session_id {
                    continue;
                }
            }
            match checkpoint.verify() {
                Ok(()) => return Ok(Some(checkpoint)),
                Err(err) => {
                    tracing::warn!(checkpoint_id = %checkpoint.id, error = %err, "skipping corrupted checkpoint");
                }
            }
        }
        Ok(None)
    }

    /// Delete the oldest checkpoints so at most `max` remain.
    pub fn prune(&self, max: usize) -> Result<Vec<String>> {
        let checkpoints = self.list()?;
        let excess = checkpoints.len().saturating_sub(max);
        let mut removed = Vec::with_capacity(excess);
        for checkpoint in checkpoints.into_iter().take(excess) {
            let path = self.storage.checkpoint_file(&checkpoint.id);
            let _lock = self.locks.lock(&path, self.lock_timeout_ms)?;
            if self.storage.remove_file(&path)? {
                tracing::debug!(checkpoint_id = %checkpoint.id, "pruned checkpoint");
                removed.push(checkpoint.id);
            }
        }
        Ok(removed)
    }
}
