//! Time and identity sources.
//!
//! Engines never call `Utc::now()` or mint ids directly; they go through a
//! [`Clock`] and an [`IdGenerator`] so tests can pin both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use ulid::Ulid;
use uuid::Uuid;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Kinds of identifiers minted by the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Task,
    Session,
    Checkpoint,
    Operation,
    Transaction,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Task => "task",
            IdKind::Session => "session",
            IdKind::Checkpoint => "cp",
            IdKind::Operation => "op",
            IdKind::Transaction => "tx",
        }
    }
}

/// Source of fresh identifiers.
pub trait IdGenerator: Send + Sync {
    fn generate(&self, kind: IdKind) -> String;
}

/// Production ids: uuid v4 for sessions, prefixed lowercase ULIDs otherwise.
///
/// ULIDs sort by creation time, which keeps checkpoint and transaction files
/// in creation order on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct UlidIdGenerator;

impl IdGenerator for UlidIdGenerator {
    fn generate(&self, kind: IdKind) -> String {
        match kind {
            IdKind::Session => Uuid::new_v4().to_string(),
            IdKind::Operation | IdKind::Transaction => Ulid::new().to_string().to_lowercase(),
            other => format!(
                "{}-{}",
                other.prefix(),
                Ulid::new().to_string().to_lowercase()
            ),
        }
    }
}

/// Deterministic ids (`task-0001`, `session-0002`, ...) sharing one counter.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self, kind: IdKind) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{:04}", kind.prefix(), n)
    }
}
