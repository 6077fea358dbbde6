//! Cross-session persistence.
//!
//! [`CrossSessionEngine`] owns one session per process. On
//! [`initialize`](CrossSessionEngine::initialize) it records the session,
//! looks for sessions that stopped without ending and recovers each of them
//! once. While running it heartbeats the session file, checkpoints on a timer
//! or after a number of operations, and wraps task saves and loads with
//! conflict detection, optional write buffering and a prefetch cache.
//!
//! Shutdown order matters: timers stop first, buffered writes are flushed,
//! the final checkpoint is taken, and only then is the session marked ended.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::checkpoint::{Checkpoint, CheckpointKind, CheckpointStore};
use crate::clock::IdKind;
use crate::config::ConflictResolution;
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::persistence::{CacheStats, TaskPersistenceEngine};
use crate::recovery::{
    next_version, RecoveryReport, RecoveryStatus, RecoveryStrategy, TaskRecoveryManager,
};
use crate::session::{ProcessInfo, Session, SessionCounters};
use crate::storage::validate_entity_id;
use crate::task::{normalize_title, Task};
use crate::txlog::TxOp;

/// Outcome of recovering one crashed session during startup.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashRecovery {
    pub crashed_session_id: String,
    pub last_activity: DateTime<Utc>,
    /// Checkpoint replayed, if the crashed session left a valid one
    pub checkpoint_id: Option<String>,
    pub strategy: RecoveryStrategy,
    pub status: RecoveryStatus,
    pub restored: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub session_id: String,
    pub crashed_sessions: Vec<CrashRecovery>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOutcome {
    pub operation_id: String,
    pub task: Task,
    /// Held in the write buffer rather than written through
    pub buffered: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub operation_id: String,
    pub task: Task,
    pub cache_hit: bool,
    /// The stored copy was corrupted and had to be rebuilt
    pub recovered: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub written: Vec<String>,
    /// Buffered writes dropped because a newer copy was already stored
    pub conflicts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub checkpoint_id: String,
    pub restored: usize,
    /// Live tasks absent from the checkpoint, now deleted
    pub tombstoned: usize,
    pub discarded_writes: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub session_id: String,
    pub force: bool,
    pub flushed: usize,
    pub checkpoint_id: Option<String>,
    pub checkpoint_kind: Option<CheckpointKind>,
    pub removed_sessions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub session_id: Option<String>,
    pub counters: SessionCounters,
    pub buffered_writes: usize,
    pub operations_since_checkpoint: u64,
    pub prefetch: CacheStats,
    pub store_cache: CacheStats,
    pub checkpoints: usize,
    pub timers_running: bool,
}

/// One line of `metadata/conflicts.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub operation_id: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub policy: ConflictResolution,
    pub incoming_version: u64,
    pub stored_version: u64,
    pub incoming_updated_at: DateTime<Utc>,
    pub stored_updated_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

struct PrefetchCache {
    capacity: usize,
    entries: HashMap<String, Task>,
    order: VecDeque<String>,
    /// Bumped on every removal so a load that raced a write is not cached
    epoch: u64,
    hits: u64,
    misses: u64,
}

impl PrefetchCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
            epoch: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, id: &str) -> Option<Task> {
        let found = self.entries.get(id).cloned();
        match found {
            Some(_) => self.hits += 1,
            None => self.misses += 1,
        }
        found
    }

    fn insert(&mut self, task: Task) {
        if self.capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&task.id) {
            while self.entries.len() >= self.capacity {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            self.order.push_back(task.id.clone());
        }
        self.entries.insert(task.id.clone(), task);
    }

    fn insert_at(&mut self, task: Task, epoch: u64) {
        if epoch == self.epoch {
            self.insert(task);
        }
    }

    fn remove(&mut self, id: &str) {
        self.epoch += 1;
        if self.entries.remove(id).is_some() {
            self.order.retain(|entry| entry != id);
        }
    }

    fn clear(&mut self) {
        self.epoch += 1;
        self.entries.clear();
        self.order.clear();
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.entries.len(),
        }
    }
}

#[derive(Default)]
struct Runtime {
    session: Option<Session>,
    /// Pending writes keyed by task id; a later save replaces an earlier one
    buffer: BTreeMap<String, Task>,
    operations_since_checkpoint: u64,
}

struct Timers {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
enum TimerJob {
    Heartbeat,
    Checkpoint,
}

impl TimerJob {
    fn as_str(self) -> &'static str {
        match self {
            TimerJob::Heartbeat => "heartbeat",
            TimerJob::Checkpoint => "checkpoint",
        }
    }
}

struct Inner {
    engine: TaskPersistenceEngine,
    recovery: TaskRecoveryManager,
    checkpoints: CheckpointStore,
    events: EventBus,
    runtime: Mutex<Runtime>,
    prefetch: Arc<Mutex<PrefetchCache>>,
    timers: Mutex<Option<Timers>>,
    /// Held while a timer job runs; stopping waits on it
    timer_job: Mutex<()>,
}

/// Session-aware persistence shared by every caller in one process.
#[derive(Clone)]
pub struct CrossSessionEngine {
    inner: Arc<Inner>,
}

impl fmt::Debug for CrossSessionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossSessionEngine")
            .field("session_id", &self.session_id())
            .field("engine", &self.inner.engine)
            .finish_non_exhaustive()
    }
}

impl CrossSessionEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self::with_events(ctx, EventBus::new())
    }

    pub fn with_events(ctx: EngineContext, events: EventBus) -> Self {
        let engine = TaskPersistenceEngine::new(ctx);
        let ctx = engine.context();
        let checkpoints = CheckpointStore::new(
            ctx.storage.clone(),
            ctx.locks.clone(),
            ctx.lock_timeout_ms(),
        );
        let prefetch = Arc::new(Mutex::new(PrefetchCache::new(
            ctx.config.persistence.performance_optimization.prefetch_capacity,
        )));
        // Writes made through `engine()` directly must not leave stale copies.
        let stale = Arc::clone(&prefetch);
        engine.on_invalidate(Arc::new(move |id: &str| lock_unpoisoned(&stale).remove(id)));
        let recovery = TaskRecoveryManager::new(engine.clone()).with_events(events.clone());
        Self {
            inner: Arc::new(Inner {
                engine,
                recovery,
                checkpoints,
                events,
                runtime: Mutex::new(Runtime::default()),
                prefetch,
                timers: Mutex::new(None),
                timer_job: Mutex::new(()),
            }),
        }
    }

    pub fn engine(&self) -> &TaskPersistenceEngine {
        &self.inner.engine
    }

    pub fn recovery(&self) -> &TaskRecoveryManager {
        &self.inner.recovery
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.inner.checkpoints
    }

    /// Subscribe here for lifecycle notifications.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn session_id(&self) -> Option<String> {
        self.runtime().session.as_ref().map(|session| session.id.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime().session.is_some()
    }

    fn ctx(&self) -> &EngineContext {
        self.inner.engine.context()
    }

    fn now(&self) -> DateTime<Utc> {
        self.ctx().clock.now()
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Start this process's session and recover any crashed ones.
    pub fn initialize(&self) -> Result<InitReport> {
        if self.is_initialized() {
            return Err(Error::OperationFailed(
                "session already initialized".to_string(),
            ));
        }
        let ctx = self.ctx();
        self.inner.engine.init()?;

        let now = self.now();
        let session_id = ctx
            .settings
            .session_id()
            .unwrap_or_else(|| ctx.ids.generate(IdKind::Session));
        validate_entity_id("session", &session_id)?;
        let mut session = Session::new(&session_id, now, ProcessInfo::current());
        session.model = ctx.settings.model();
        self.inner.engine.save_session(&session)?;
        self.inner.engine.set_session_id(Some(session_id.clone()));
        tracing::info!(session_id = %session_id, "session started");

        let timeout = ctx.config.session_timeout();
        let candidates: Vec<String> = self
            .inner
            .engine
            .list_sessions()?
            .into_iter()
            .filter(|other| other.id != session_id && other.is_crashed(now, timeout))
            .map(|other| other.id)
            .collect();

        let mut recoveries = Vec::with_capacity(candidates.len());
        for id in &candidates {
            // The scan above is unlocked; only the claim decides who recovers.
            let Some(crashed) = self
                .inner
                .engine
                .claim_crashed_session(id, &session_id, now, timeout)?
            else {
                tracing::debug!(crashed_session = %id, "crashed session already claimed");
                continue;
            };
            recoveries.push(self.recover_crashed(&crashed, &session_id)?);
        }

        self.runtime().session = Some(session);
        self.publish(
            EventKind::SessionStarted,
            serde_json::json!({ "crashedSessions": recoveries.len() }),
        );
        Ok(InitReport {
            session_id,
            crashed_sessions: recoveries,
        })
    }

    fn recover_crashed(&self, crashed: &Session, recovered_by: &str) -> Result<CrashRecovery> {
        tracing::warn!(
            crashed_session = %crashed.id,
            last_activity = %crashed.last_activity,
            "detected crashed session"
        );
        self.publish(
            EventKind::CrashRecoveryStarted,
            serde_json::json!({
                "crashedSessionId": crashed.id,
                "lastActivity": crashed.last_activity,
            }),
        );

        let report = match self.replay_crashed(crashed) {
            Ok(report) => report,
            Err(err) => {
                // Let a later session retry.
                if let Err(release_err) = self
                    .inner
                    .engine
                    .update_session(&crashed.id, Session::release_recovery_claim)
                {
                    tracing::warn!(crashed_session = %crashed.id, error = %release_err, "failed to release recovery claim");
                }
                return Err(err);
            }
        };

        let now = self.now();
        self.inner
            .engine
            .update_session(&crashed.id, |session| session.mark_recovered(recovered_by, now))?;

        let recovery = CrashRecovery {
            crashed_session_id: crashed.id.clone(),
            last_activity: crashed.last_activity,
            checkpoint_id: report.checkpoint_id.clone(),
            strategy: report.strategy,
            status: report.status,
            restored: report.restored.len(),
        };
        tracing::info!(
            crashed_session = %crashed.id,
            strategy = report.strategy.as_str(),
            restored = recovery.restored,
            "crash recovery completed"
        );
        self.publish(EventKind::CrashRecoveryCompleted, &recovery);
        Ok(recovery)
    }

    fn replay_crashed(&self, crashed: &Session) -> Result<RecoveryReport> {
        match self.inner.checkpoints.latest_valid(Some(&crashed.id))? {
            Some(checkpoint) => self.inner.recovery.replay_checkpoint(&checkpoint),
            None => {
                tracing::info!(crashed_session = %crashed.id, "no checkpoint for crashed session; running full recovery");
                self.inner.recovery.recover_system()
            }
        }
    }

    /// Refresh this session's `lastActivity` and counters on disk.
    pub fn heartbeat(&self) -> Result<()> {
        let now = self.now();
        let (id, counters) = {
            let mut runtime = self.runtime();
            let session = runtime.session.as_mut().ok_or_else(not_initialized)?;
            session.touch(now);
            (session.id.clone(), session.counters.clone())
        };
        self.inner.engine.update_session(&id, |session| {
            session.touch(now);
            session.counters = counters;
        })?;
        tracing::trace!(session_id = %id, "heartbeat");
        Ok(())
    }

    /// Spawn the heartbeat and checkpoint timers on the current tokio runtime.
    pub fn start_timers(&self) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::OperationFailed("timers require a running tokio runtime".to_string())
        })?;
        if !self.is_initialized() {
            return Err(not_initialized());
        }
        let mut timers = lock_unpoisoned(&self.inner.timers);
        if timers.is_some() {
            return Ok(());
        }

        let config = &self.ctx().config;
        let (stop, stopped) = watch::channel(false);
        let handles = vec![
            handle.spawn(run_timer(
                Arc::downgrade(&self.inner),
                to_std(config.heartbeat_interval()),
                stopped.clone(),
                TimerJob::Heartbeat,
            )),
            handle.spawn(run_timer(
                Arc::downgrade(&self.inner),
                to_std(config.checkpoint_interval()),
                stopped,
                TimerJob::Checkpoint,
            )),
        ];
        *timers = Some(Timers { stop, handles });
        tracing::debug!(
            heartbeat = %config.session.heartbeat_interval,
            checkpoint = %config.checkpoint.interval,
            "timers started"
        );
        Ok(())
    }

    /// Cancel both timers. Returns false when none were running.
    ///
    /// Blocks until a job already in progress has finished, so nothing a
    /// timer writes can land after this returns.
    pub fn stop_timers(&self) -> bool {
        let Some(timers) = lock_unpoisoned(&self.inner.timers).take() else {
            return false;
        };
        // Receivers may already be gone if the tasks ended on their own.
        let _ = timers.stop.send(true);
        for handle in timers.handles {
            handle.abort();
        }
        drop(lock_unpoisoned(&self.inner.timer_job));
        tracing::debug!("timers stopped");
        true
    }

    /// Stop timers, flush, checkpoint, then end the session.
    ///
    /// With `force`, a failed flush skips the final checkpoint in favour of an
    /// emergency one and the session is still ended.
    pub fn shutdown(&self, force: bool) -> Result<ShutdownReport> {
        let session_id = self.session_id().ok_or_else(not_initialized)?;
        self.stop_timers();

        let mut report = ShutdownReport {
            session_id: session_id.clone(),
            force,
            flushed: 0,
            checkpoint_id: None,
            checkpoint_kind: None,
            removed_sessions: Vec::new(),
        };

        match self.flush() {
            Ok(flush) => {
                report.flushed = flush.written.len();
                let checkpoint = self.create_checkpoint(CheckpointKind::Manual)?;
                report.checkpoint_id = Some(checkpoint.id);
                report.checkpoint_kind = Some(CheckpointKind::Manual);
            }
            Err(err) if force => {
                tracing::warn!(error = %err, "flush failed during forced shutdown; skipping final checkpoint");
                match self.emergency_checkpoint(&format!("shutdown flush failed: {err}")) {
                    Ok(checkpoint) => {
                        report.checkpoint_id = Some(checkpoint.id);
                        report.checkpoint_kind = Some(CheckpointKind::Emergency);
                    }
                    Err(cp_err) => {
                        tracing::error!(error = %cp_err, "emergency checkpoint failed during shutdown");
                    }
                }
            }
            Err(err) => return Err(err),
        }

        let now = self.now();
        let mut ended = {
            let runtime = self.runtime();
            runtime.session.clone().ok_or_else(not_initialized)?
        };
        ended.end(now);
        let counters = ended.counters.clone();
        match self.inner.engine.update_session(&session_id, |session| {
            session.counters = counters;
            session.end(now);
        }) {
            Ok(_) => {}
            Err(Error::NotFound { .. }) => self.inner.engine.save_session(&ended)?,
            Err(err) => return Err(err),
        }

        report.removed_sessions = self.cleanup_sessions(&session_id, now)?;
        self.inner.engine.storage().touch_metadata(now)?;
        self.runtime().session = None;
        lock_unpoisoned(&self.inner.prefetch).clear();

        tracing::info!(
            session_id = %session_id,
            flushed = report.flushed,
            removed_sessions = report.removed_sessions.len(),
            "session ended"
        );
        self.publish(EventKind::CrossSessionShutdown, &report);
        Ok(report)
    }

    /// Remove sessions that ended longer ago than `cleanup_after`.
    fn cleanup_sessions(&self, current: &str, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cleanup_after = self.ctx().config.cleanup_after();
        let mut removed = Vec::new();
        for session in self.inner.engine.list_sessions()? {
            if session.id == current || !session.is_expired(now, cleanup_after) {
                continue;
            }
            if self.inner.engine.delete_session(&session.id)? {
                tracing::debug!(session_id = %session.id, "removed expired session");
                removed.push(session.id);
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Saves and loads
    // =========================================================================

    /// Store a task, detecting conflicting writes from other sessions.
    pub fn save_task(&self, mut task: Task) -> Result<SaveOutcome> {
        validate_entity_id("task", &task.id)?;
        task.title = normalize_title(&task.title)?;
        if task.metadata.session_id.is_none() {
            task.metadata.session_id = self.inner.engine.session_id();
        }
        let operation_id = self.ctx().ids.generate(IdKind::Operation);
        let buffered = self.ctx().config.persistence.performance_optimization.async_writes;

        let result = if buffered {
            self.buffer_write(task)
        } else {
            self.write_through(task, &operation_id)
        };
        let task = match result {
            Ok(task) => task,
            Err(err) => {
                self.count(|counters| counters.errors += 1);
                return Err(err);
            }
        };
        lock_unpoisoned(&self.inner.prefetch).insert(task.clone());

        let threshold = self.ctx().config.checkpoint.operation_threshold;
        let checkpoint_due = {
            let mut runtime = self.runtime();
            runtime.operations_since_checkpoint += 1;
            let due = threshold > 0 && runtime.operations_since_checkpoint >= threshold;
            match runtime.session.as_mut() {
                Some(session) => {
                    session.counters.total_operations += 1;
                    session.counters.tasks_processed += 1;
                    if !buffered {
                        session.counters.transactions_committed += 1;
                    }
                    due
                }
                None => false,
            }
        };

        self.publish(
            EventKind::TaskSaved,
            serde_json::json!({
                "taskId": task.id,
                "operationId": operation_id,
                "version": task.version,
                "buffered": buffered,
            }),
        );

        if checkpoint_due {
            if let Err(err) = self.create_checkpoint(CheckpointKind::Automatic) {
                tracing::warn!(error = %err, "automatic checkpoint failed");
            }
        }

        Ok(SaveOutcome {
            operation_id,
            task,
            buffered,
        })
    }

    fn buffer_write(&self, mut task: Task) -> Result<Task> {
        task.seal()?;
        let batch_size = self.ctx().config.persistence.performance_optimization.batch_size;
        let flush_due = {
            let mut runtime = self.runtime();
            runtime.buffer.insert(task.id.clone(), task.clone());
            runtime.buffer.len() >= batch_size
        };
        if flush_due {
            if let Err(err) = self.flush() {
                tracing::warn!(error = %err, "batch flush failed; writes stay buffered");
            }
        }
        Ok(task)
    }

    /// Write under the task lock after the conflict check.
    fn write_through(&self, mut task: Task, operation_id: &str) -> Result<Task> {
        let engine = &self.inner.engine;
        let _guard = engine.lock_task(&task.id)?;
        let stored = match engine.read_task_raw(&task.id) {
            Ok(stored) => stored,
            Err(Error::Integrity { detail, .. }) => {
                tracing::warn!(task_id = %task.id, %detail, "overwriting unreadable stored task");
                None
            }
            Err(err) => return Err(err),
        };

        if let Some(stored) = &stored {
            self.check_conflict(&task, stored, operation_id)?;
        }
        let op = if stored.is_some() {
            TxOp::Update
        } else {
            TxOp::Create
        };
        task.version = match &stored {
            Some(stored) => stored.version + 1,
            None => task.version.max(1),
        };
        task.metadata.updated_at = self.now().max(task.metadata.created_at);
        engine.put_task_locked(task, op)
    }

    fn check_conflict(&self, incoming: &Task, stored: &Task, operation_id: &str) -> Result<()> {
        let policy = self.ctx().config.persistence.conflict_resolution;
        let conflict = match policy {
            ConflictResolution::Timestamp => {
                incoming.metadata.updated_at < stored.metadata.updated_at
            }
            ConflictResolution::Version => incoming.version < stored.version,
            ConflictResolution::LastWriteWins => false,
        };
        if !conflict {
            return Ok(());
        }

        let record = ConflictRecord {
            operation_id: operation_id.to_string(),
            task_id: incoming.id.clone(),
            session_id: self.inner.engine.session_id(),
            policy,
            incoming_version: incoming.version,
            stored_version: stored.version,
            incoming_updated_at: incoming.metadata.updated_at,
            stored_updated_at: stored.metadata.updated_at,
            detected_at: self.now(),
        };
        tracing::warn!(
            task_id = %incoming.id,
            policy = ?policy,
            incoming_version = incoming.version,
            stored_version = stored.version,
            "write conflict detected"
        );
        if let Err(err) = self.record_conflict(&record) {
            tracing::warn!(error = %err, "failed to record conflict");
        }
        self.publish(EventKind::ConflictDetected, &record);

        Err(Error::WriteConflict {
            task_id: incoming.id.clone(),
            incoming: incoming.metadata.updated_at,
            stored: stored.metadata.updated_at,
        })
    }

    fn record_conflict(&self, record: &ConflictRecord) -> Result<()> {
        let storage = self.inner.engine.storage();
        let path = storage.conflicts_file();
        let _lock = self.ctx().locks.lock(&path, self.ctx().lock_timeout_ms())?;
        storage.append_jsonl(&path, record)
    }

    /// Conflicts recorded so far, oldest first.
    pub fn conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let storage = self.inner.engine.storage();
        let (records, _) = storage.read_jsonl_lenient(&storage.conflicts_file())?;
        Ok(records)
    }

    /// Load a task, preferring buffered and prefetched copies.
    ///
    /// A corrupted stored copy is rebuilt through recovery; the original
    /// integrity error is returned only if that fails too.
    pub fn load_task(&self, id: &str) -> Result<LoadOutcome> {
        validate_entity_id("task", id)?;
        let operation_id = self.ctx().ids.generate(IdKind::Operation);

        let buffered = self.runtime().buffer.get(id).cloned();
        let (cached, epoch) = {
            let mut prefetch = lock_unpoisoned(&self.inner.prefetch);
            let cached = buffered.or_else(|| prefetch.get(id));
            (cached, prefetch.epoch)
        };
        let (task, cache_hit, recovered) = match cached {
            Some(task) if task.is_deleted() => {
                lock_unpoisoned(&self.inner.prefetch).remove(id);
                return Err(Error::task_not_found(id));
            }
            Some(task) => (task, true, false),
            None => match self.inner.engine.get_task(id) {
                Ok(task) => (task, false, false),
                Err(err @ Error::Integrity { .. }) => {
                    tracing::warn!(task_id = %id, error = %err, "corrupted task on load; attempting repair");
                    match self.inner.recovery.recover_task(id) {
                        Ok(recovery) => (recovery.task, false, true),
                        Err(repair_err) => {
                            tracing::error!(task_id = %id, error = %repair_err, "task repair failed");
                            self.count(|counters| counters.errors += 1);
                            return Err(err);
                        }
                    }
                }
                Err(err) => return Err(err),
            },
        };

        if !cache_hit {
            lock_unpoisoned(&self.inner.prefetch).insert_at(task.clone(), epoch);
        }
        self.count(|counters| counters.total_operations += 1);
        self.publish(
            EventKind::TaskLoaded,
            serde_json::json!({
                "taskId": task.id,
                "operationId": operation_id,
                "cacheHit": cache_hit,
                "recovered": recovered,
            }),
        );
        Ok(LoadOutcome {
            operation_id,
            task,
            cache_hit,
            recovered,
        })
    }

    /// Write every buffered save. Conflicting writes are dropped and reported.
    ///
    /// On any other failure the unwritten saves go back into the buffer.
    pub fn flush(&self) -> Result<FlushReport> {
        let pending: Vec<Task> = {
            let mut runtime = self.runtime();
            std::mem::take(&mut runtime.buffer).into_values().collect()
        };
        let mut report = FlushReport::default();
        let mut remaining = pending.into_iter();

        while let Some(task) = remaining.next() {
            let id = task.id.clone();
            let operation_id = self.ctx().ids.generate(IdKind::Operation);
            match self.write_through(task.clone(), &operation_id) {
                Ok(written) => {
                    lock_unpoisoned(&self.inner.prefetch).insert(written);
                    report.written.push(id);
                }
                Err(Error::WriteConflict { .. }) => {
                    lock_unpoisoned(&self.inner.prefetch).remove(&id);
                    report.conflicts.push(id);
                }
                Err(err) => {
                    let mut runtime = self.runtime();
                    // Saves made while flushing are newer; keep them.
                    for task in std::iter::once(task).chain(remaining) {
                        runtime.buffer.entry(task.id.clone()).or_insert(task);
                    }
                    return Err(err);
                }
            }
        }

        let written = report.written.len() as u64;
        let conflicts = report.conflicts.len() as u64;
        self.count(|counters| {
            counters.transactions_committed += written;
            counters.errors += conflicts;
        });
        if written > 0 || conflicts > 0 {
            tracing::debug!(written, conflicts, "flushed buffered writes");
        }
        Ok(report)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Snapshot every readable task and prune old checkpoints.
    pub fn create_checkpoint(&self, kind: CheckpointKind) -> Result<Checkpoint> {
        let (session_id, active) = {
            let runtime = self.runtime();
            let session = runtime.session.as_ref().ok_or_else(not_initialized)?;
            let active: Vec<String> = runtime.buffer.keys().cloned().collect();
            (session.id.clone(), active)
        };
        let scan = self.inner.engine.scan_tasks()?;
        for id in &scan.corrupted {
            tracing::warn!(task_id = %id, "excluding corrupted task from checkpoint");
        }
        self.write_checkpoint(kind, session_id, scan.tasks, active, None)
    }

    /// Snapshot stored tasks overlaid with unflushed writes.
    pub fn emergency_checkpoint(&self, reason: &str) -> Result<Checkpoint> {
        let (session_id, buffered) = {
            let runtime = self.runtime();
            let session = runtime.session.as_ref().ok_or_else(not_initialized)?;
            let buffered: Vec<Task> = runtime.buffer.values().cloned().collect();
            (session.id.clone(), buffered)
        };
        let active: Vec<String> = buffered.iter().map(|task| task.id.clone()).collect();
        let mut tasks: BTreeMap<String, Task> = self
            .inner
            .engine
            .scan_tasks()?
            .tasks
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();
        for task in buffered {
            tasks.insert(task.id.clone(), task);
        }
        tracing::warn!(reason, buffered = active.len(), "taking emergency checkpoint");
        self.write_checkpoint(
            CheckpointKind::Emergency,
            session_id,
            tasks.into_values().collect(),
            active,
            Some(reason.to_string()),
        )
    }

    fn write_checkpoint(
        &self,
        kind: CheckpointKind,
        session_id: String,
        tasks: Vec<Task>,
        active: Vec<String>,
        reason: Option<String>,
    ) -> Result<Checkpoint> {
        let id = self.ctx().ids.generate(IdKind::Checkpoint);
        let mut checkpoint = Checkpoint::new(id, self.now(), session_id, tasks, active, kind)?;
        if let Some(reason) = reason {
            checkpoint = checkpoint.with_reason(reason)?;
        }
        self.inner.checkpoints.write(&checkpoint)?;
        let pruned = self
            .inner
            .checkpoints
            .prune(self.ctx().config.checkpoint.max_checkpoints)?;
        self.runtime().operations_since_checkpoint = 0;

        tracing::info!(
            checkpoint_id = %checkpoint.id,
            kind = %kind,
            tasks = checkpoint.task_snapshot.len(),
            pruned = pruned.len(),
            "checkpoint created"
        );
        let event = match kind {
            CheckpointKind::Emergency => EventKind::EmergencyCheckpoint,
            CheckpointKind::Manual | CheckpointKind::Automatic => EventKind::CheckpointCreated,
        };
        self.publish(
            event,
            serde_json::json!({
                "checkpointId": checkpoint.id,
                "type": kind,
                "taskCount": checkpoint.task_snapshot.len(),
                "size": checkpoint.size,
                "pruned": pruned,
                "reason": checkpoint.reason,
            }),
        );
        Ok(checkpoint)
    }

    /// Replace current task state with a verified checkpoint.
    ///
    /// Buffered writes are discarded; live tasks missing from the checkpoint
    /// are deleted.
    pub fn restore_from_checkpoint(&self, checkpoint_id: &str) -> Result<RestoreReport> {
        let checkpoint = self.inner.checkpoints.load_verified(checkpoint_id)?;

        let discarded_writes = {
            let mut runtime = self.runtime();
            let discarded = runtime.buffer.len();
            runtime.buffer.clear();
            discarded
        };
        if discarded_writes > 0 {
            tracing::warn!(discarded_writes, "discarding buffered writes for restore");
        }
        lock_unpoisoned(&self.inner.prefetch).clear();

        let engine = &self.inner.engine;
        let mut restored = 0;
        for task in &checkpoint.task_snapshot {
            let _guard = engine.lock_task(&task.id)?;
            let stored_version = match engine.read_task_raw(&task.id) {
                Ok(stored) => stored.map(|stored| stored.version),
                Err(Error::Integrity { .. }) => None,
                Err(err) => return Err(err),
            };
            let mut task = task.clone();
            task.version = next_version(task.version, stored_version);
            engine.put_task_locked(task, TxOp::Restore)?;
            restored += 1;
        }

        let keep: HashSet<&str> = checkpoint
            .task_snapshot
            .iter()
            .map(|task| task.id.as_str())
            .collect();
        let mut tombstoned = 0;
        for task in engine.scan_tasks()?.tasks {
            if task.is_deleted() || keep.contains(task.id.as_str()) {
                continue;
            }
            engine.delete_task(&task.id)?;
            tombstoned += 1;
        }

        let report = RestoreReport {
            checkpoint_id: checkpoint.id.clone(),
            restored,
            tombstoned,
            discarded_writes,
        };
        tracing::info!(
            checkpoint_id = %checkpoint.id,
            restored,
            tombstoned,
            "restored from checkpoint"
        );
        self.publish(EventKind::CheckpointRestored, &report);
        Ok(report)
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let checkpoints = self.inner.checkpoints.count()?;
        let (session_id, counters, buffered_writes, operations_since_checkpoint) = {
            let runtime = self.runtime();
            (
                runtime.session.as_ref().map(|session| session.id.clone()),
                runtime
                    .session
                    .as_ref()
                    .map(|session| session.counters.clone())
                    .unwrap_or_default(),
                runtime.buffer.len(),
                runtime.operations_since_checkpoint,
            )
        };
        Ok(EngineStats {
            session_id,
            counters,
            buffered_writes,
            operations_since_checkpoint,
            prefetch: lock_unpoisoned(&self.inner.prefetch).stats(),
            store_cache: self.inner.engine.cache_stats(),
            checkpoints,
            timers_running: lock_unpoisoned(&self.inner.timers).is_some(),
        })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        lock_unpoisoned(&self.inner.runtime)
    }

    fn count(&self, update: impl FnOnce(&mut SessionCounters)) {
        if let Some(session) = self.runtime().session.as_mut() {
            update(&mut session.counters);
        }
    }

    fn publish<T: Serialize>(&self, kind: EventKind, data: T) {
        let event = Event::new(kind, self.now(), self.inner.engine.session_id()).with_data(data);
        match event {
            Ok(event) => self.inner.events.publish(&event),
            Err(err) => tracing::warn!(event = kind.as_str(), error = %err, "failed to build event"),
        }
    }
}

async fn run_timer(
    weak: Weak<Inner>,
    period: StdDuration,
    mut stopped: watch::Receiver<bool>,
    job: TimerJob,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !run_timer_job(CrossSessionEngine { inner }, job, &stopped) {
                    break;
                }
            }
            changed = stopped.changed() => {
                if changed.is_err() || *stopped.borrow() {
                    break;
                }
            }
        }
    }
}

/// Run one tick's job. Returns false once the timers have been stopped.
fn run_timer_job(
    engine: CrossSessionEngine,
    job: TimerJob,
    stopped: &watch::Receiver<bool>,
) -> bool {
    let _running = lock_unpoisoned(&engine.inner.timer_job);
    // Stop may have been signalled while this tick waited for the lock.
    if *stopped.borrow() {
        return false;
    }
    let result = match job {
        TimerJob::Heartbeat => engine.heartbeat(),
        TimerJob::Checkpoint => engine
            .create_checkpoint(CheckpointKind::Automatic)
            .map(|_| ()),
    };
    if let Err(err) = result {
        tracing::warn!(timer = job.as_str(), error = %err, "timer job failed");
    }
    true
}

fn to_std(duration: chrono::Duration) -> StdDuration {
    duration
        .to_std()
        .unwrap_or(StdDuration::from_secs(1))
        .max(StdDuration::from_millis(1))
}

fn not_initialized() -> Error {
    Error::OperationFailed("session not initialized; call initialize first".to_string())
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
