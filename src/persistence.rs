//! Single-session durable store for tasks and sessions.
//!
//! Every entity write takes that entity's lock through the injected
//! [`LockProvider`], re-reads the file under the lock, writes atomically,
//! appends to the transaction log and drops the cached copy before
//! returning. Reads go through a bounded read-through cache.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::clock::IdKind;
use crate::config::parse_duration;
use crate::context::EngineContext;
use crate::error::{Error, Result};
use crate::lock::LockGuard;
use crate::session::Session;
use crate::storage::{validate_entity_id, PersistenceMetadata, Storage};
use crate::task::{
    normalize_tags, normalize_title, sanitize_custom, sort_tasks, validate_dependencies,
    ExecutionContext, NewTask, Task, TaskCategory, TaskFilter, TaskPriority, TaskStatus,
    TaskUpdate,
};
use crate::txlog::{TxLog, TxOp, TxRecord};

/// Every task document on disk, split into readable and corrupted ones.
#[derive(Debug, Clone, Default)]
pub struct TaskScan {
    /// Readable tasks with a valid (or absent) checksum, tombstones included
    pub tasks: Vec<Task>,
    /// Ids whose file failed to parse or failed its checksum
    pub corrupted: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

struct TaskCache {
    capacity: usize,
    entries: HashMap<String, Task>,
    order: VecDeque<String>,
    /// Bumped on every invalidation; a read that raced a write won't be cached
    epoch: u64,
    hits: u64,
    misses: u64,
}

impl TaskCache {
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
        match self.entries.get(id) {
            Some(task) => {
                self.hits += 1;
                Some(task.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn insert(&mut self, task: Task, epoch: u64) {
        if self.capacity == 0 || epoch != self.epoch {
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

    fn invalidate(&mut self, id: &str) {
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
}

/// Called with a task id after every write to that task.
pub type InvalidationHook = Arc<dyn Fn(&str) + Send + Sync>;

struct EngineInner {
    ctx: EngineContext,
    txlog: TxLog,
    cache: Mutex<TaskCache>,
    session_id: Mutex<Option<String>>,
    hooks: Mutex<Vec<InvalidationHook>>,
}

/// CRUD over tasks and sessions on the `.gemini-tasks/` tree.
#[derive(Clone)]
pub struct TaskPersistenceEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for TaskPersistenceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPersistenceEngine")
            .field("root", &self.inner.ctx.storage.root())
            .finish_non_exhaustive()
    }
}

impl TaskPersistenceEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let txlog = TxLog::new(
            ctx.storage.clone(),
            ctx.locks.clone(),
            ctx.lock_timeout_ms(),
        );
        let capacity = ctx.config.persistence.cache_capacity;
        Self {
            inner: Arc::new(EngineInner {
                txlog,
                cache: Mutex::new(TaskCache::new(capacity)),
                session_id: Mutex::new(ctx.settings.session_id()),
                hooks: Mutex::new(Vec::new()),
                ctx,
            }),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.inner.ctx
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.ctx.storage
    }

    pub fn txlog(&self) -> &TxLog {
        &self.inner.txlog
    }

    /// Create the directory tree; safe to call repeatedly.
    pub fn init(&self) -> Result<PersistenceMetadata> {
        self.storage().init(self.inner.ctx.clock.now())
    }

    /// Session recorded on transactions and stamped on new tasks.
    pub fn set_session_id(&self, session_id: Option<String>) {
        *lock_unpoisoned(&self.inner.session_id) = session_id;
    }

    pub fn session_id(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.session_id).clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = lock_unpoisoned(&self.inner.cache);
        CacheStats {
            hits: cache.hits,
            misses: cache.misses,
            entries: cache.entries.len(),
        }
    }

    pub fn clear_cache(&self) {
        lock_unpoisoned(&self.inner.cache).clear();
    }

    /// Register a hook run synchronously whenever a task is written.
    ///
    /// Layered caches use this to drop their copy before the write returns.
    pub fn on_invalidate(&self, hook: InvalidationHook) {
        lock_unpoisoned(&self.inner.hooks).push(hook);
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Validate, normalize and store a new task.
    ///
    /// All validation happens before anything touches the disk.
    pub fn create_task(&self, input: NewTask) -> Result<Task> {
        let title = normalize_title(&input.title)?;
        let category: TaskCategory = input.category.parse()?;
        let priority = match input.priority.as_deref() {
            Some(raw) => raw.parse()?,
            None => TaskPriority::default(),
        };
        validate_dependencies("new task", &input.dependencies)?;
        if let Some(session_id) = &input.session_id {
            validate_entity_id("session", session_id)?;
        }
        if input.timeout_secs == Some(0) {
            return Err(Error::Validation("timeout must be positive".to_string()));
        }

        let now = self.inner.ctx.clock.now();
        let id = self.inner.ctx.ids.generate(IdKind::Task);
        validate_entity_id("task", &id)?;

        let mut task = Task::new(id, title, now);
        task.description = input.description.trim().to_string();
        task.status = input.status.unwrap_or(TaskStatus::Pending);
        task.priority = priority;
        task.category = category;
        task.dependencies = input.dependencies;
        task.metadata.tags = normalize_tags(&input.tags);
        task.metadata.estimated_duration_secs = input.estimated_duration_secs;
        task.metadata.created_by = input
            .created_by
            .map(|who| who.trim().to_string())
            .filter(|who| !who.is_empty());
        task.metadata.session_id = input.session_id.or_else(|| self.session_id());
        task.metadata.custom = sanitize_custom(&input.custom);

        let mut context = self.default_execution_context();
        if let Some(timeout) = input.timeout_secs {
            context.timeout_secs = timeout;
        }
        if let Some(retries) = input.max_retries {
            context.max_retries = retries;
        }
        context.resources = input.resources;
        context.working_directory = input.working_directory;
        context.environment = input.environment;
        task.execution_context = context;
        task.seal()?;

        let path = self.storage().task_file(&task.id);
        let _guard = self.lock_entity(&path)?;
        if path.exists() {
            return Err(Error::OperationFailed(format!(
                "task id collision: {}",
                task.id
            )));
        }
        self.storage().write_json(&path, &task)?;
        self.record(TxOp::Create, &task)?;
        self.invalidate(&task.id);

        tracing::info!(task_id = %task.id, category = task.category.as_str(), "task created");
        Ok(task)
    }

    /// Load a live task. Tombstones are `NotFound`; corruption is `Integrity`.
    pub fn get_task(&self, id: &str) -> Result<Task> {
        validate_entity_id("task", id)?;

        let epoch = {
            let mut cache = lock_unpoisoned(&self.inner.cache);
            if let Some(task) = cache.get(id) {
                tracing::trace!(task_id = %id, "task cache hit");
                return Ok(task);
            }
            cache.epoch
        };

        let task = self
            .read_task_raw(id)?
            .ok_or_else(|| Error::task_not_found(id))?;
        verify_checksum(&task)?;
        if task.is_deleted() {
            return Err(Error::task_not_found(id));
        }

        lock_unpoisoned(&self.inner.cache).insert(task.clone(), epoch);
        Ok(task)
    }

    /// Whether the id names a task file on disk, tombstones included.
    pub fn task_exists(&self, id: &str) -> bool {
        validate_entity_id("task", id).is_ok() && self.storage().task_file(id).exists()
    }

    /// Read the stored document without checksum or tombstone checks.
    ///
    /// A file that does not parse is reported as an integrity failure.
    pub fn read_task_raw(&self, id: &str) -> Result<Option<Task>> {
        let path = self.storage().task_file(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let task: Task = serde_json::from_str(&content).map_err(|err| {
            Error::integrity(format!("task {id}"), format!("unreadable task file: {err}"))
        })?;
        if task.id != id {
            return Err(Error::integrity(
                format!("task {id}"),
                format!("file holds task {}", task.id),
            ));
        }
        Ok(Some(task))
    }

    /// Merge `update` into a live task, bumping its version.
    pub fn update_task(&self, id: &str, update: &TaskUpdate) -> Result<Task> {
        self.modify_task(id, TxOp::Update, |task| update.apply(task))
    }

    /// Tombstone a live task.
    pub fn delete_task(&self, id: &str) -> Result<Task> {
        let now = self.inner.ctx.clock.now();
        let task = self.modify_task(id, TxOp::Delete, |task| {
            task.deleted_at = Some(now);
            Ok(())
        })?;
        tracing::info!(task_id = %id, "task deleted");
        Ok(task)
    }

    /// Read-modify-write of a live task under its lock.
    pub fn modify_task<F>(&self, id: &str, op: TxOp, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        validate_entity_id("task", id)?;
        let path = self.storage().task_file(id);
        let _guard = self.lock_entity(&path)?;

        let mut task = self
            .read_task_raw(id)?
            .filter(|task| !task.is_deleted())
            .ok_or_else(|| Error::task_not_found(id))?;
        verify_checksum(&task)?;

        mutate(&mut task)?;
        task.touch(self.inner.ctx.clock.now());
        task.seal()?;

        self.storage().write_json(&path, &task)?;
        self.record(op, &task)?;
        self.invalidate(id);
        Ok(task)
    }

    /// Store `task` as given (after sealing) without version handling.
    ///
    /// Used by checkpoint restore, buffered saves and recovery, which decide
    /// the version themselves.
    pub fn put_task(&self, mut task: Task, op: TxOp) -> Result<Task> {
        validate_entity_id("task", &task.id)?;
        task.seal()?;
        let path = self.storage().task_file(&task.id);
        let _guard = self.lock_entity(&path)?;
        self.storage().write_json(&path, &task)?;
        self.record(op, &task)?;
        self.invalidate(&task.id);
        Ok(task)
    }

    /// Like [`Self::put_task`], for a caller already holding the task's lock.
    pub(crate) fn put_task_locked(&self, mut task: Task, op: TxOp) -> Result<Task> {
        task.seal()?;
        let path = self.storage().task_file(&task.id);
        self.storage().write_json(&path, &task)?;
        self.record(op, &task)?;
        self.invalidate(&task.id);
        Ok(task)
    }

    /// Lock a task file for a multi-step read-check-write.
    pub(crate) fn lock_task(&self, id: &str) -> Result<LockGuard> {
        validate_entity_id("task", id)?;
        self.lock_entity(&self.storage().task_file(id))
    }

    /// Filtered, deterministically ordered task listing.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let scan = self.scan_tasks()?;
        for id in &scan.corrupted {
            tracing::warn!(task_id = %id, "skipping corrupted task in listing");
        }
        let mut tasks: Vec<Task> = scan
            .tasks
            .into_iter()
            .filter(|task| filter.matches(task))
            .collect();
        sort_tasks(&mut tasks, filter.sort, filter.descending);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    /// Read every task document, separating corrupted ones.
    pub fn scan_tasks(&self) -> Result<TaskScan> {
        let mut scan = TaskScan::default();
        for id in self.storage().list_task_ids()? {
            match self.read_task_raw(&id) {
                Ok(Some(task)) => match task.checksum_matches()? {
                    Some(false) => scan.corrupted.push(id),
                    _ => scan.tasks.push(task),
                },
                Ok(None) => {}
                Err(Error::Integrity { .. }) => scan.corrupted.push(id),
                Err(err) => return Err(err),
            }
        }
        Ok(scan)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    pub fn save_session(&self, session: &Session) -> Result<()> {
        validate_entity_id("session", &session.id)?;
        let path = self.storage().session_file(&session.id);
        let _guard = self.lock_entity(&path)?;
        self.storage().write_json(&path, session)
    }

    pub fn get_session(&self, id: &str) -> Result<Session> {
        validate_entity_id("session", id)?;
        self.storage()
            .read_json_opt(&self.storage().session_file(id))?
            .ok_or_else(|| Error::NotFound {
                entity: "session",
                id: id.to_string(),
            })
    }

    /// Read-modify-write of a session under its lock.
    pub fn update_session<F>(&self, id: &str, mutate: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        validate_entity_id("session", id)?;
        let path = self.storage().session_file(id);
        let _guard = self.lock_entity(&path)?;
        let mut session: Session =
            self.storage()
                .read_json_opt(&path)?
                .ok_or_else(|| Error::NotFound {
                    entity: "session",
                    id: id.to_string(),
                })?;
        mutate(&mut session);
        self.storage().write_json(&path, &session)?;
        Ok(session)
    }

    /// Claim a crashed session for recovery under its lock.
    ///
    /// Returns `None` when the session is gone, ended, alive again, or
    /// already claimed by another recoverer.
    pub fn claim_crashed_session(
        &self,
        id: &str,
        by: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Option<Session>> {
        validate_entity_id("session", id)?;
        let path = self.storage().session_file(id);
        let _guard = self.lock_entity(&path)?;
        let Some(mut session) = self.storage().read_json_opt::<Session>(&path)? else {
            return Ok(None);
        };
        if !session.is_crashed(now, timeout) {
            return Ok(None);
        }
        session.claim_recovery(by, now);
        self.storage().write_json(&path, &session)?;
        Ok(Some(session))
    }

    /// All readable sessions, ordered by start time then id.
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for id in self.storage().list_session_ids()? {
            let path = self.storage().session_file(&id);
            match self.storage().read_json_opt::<Session>(&path) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(Error::Json(err)) => {
                    tracing::warn!(session_id = %id, error = %err, "skipping unreadable session file");
                }
                Err(err) => return Err(err),
            }
        }
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    pub fn delete_session(&self, id: &str) -> Result<bool> {
        validate_entity_id("session", id)?;
        let path = self.storage().session_file(id);
        let _guard = self.lock_entity(&path)?;
        self.storage().remove_file(&path)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lock_entity(&self, path: &std::path::Path) -> Result<LockGuard> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.inner
            .ctx
            .locks
            .lock(path, self.inner.ctx.lock_timeout_ms())
    }

    fn invalidate(&self, id: &str) {
        lock_unpoisoned(&self.inner.cache).invalidate(id);
        let hooks = lock_unpoisoned(&self.inner.hooks).clone();
        for hook in hooks {
            hook(id);
        }
    }

    fn record(&self, op: TxOp, task: &Task) -> Result<()> {
        let record = TxRecord {
            tx_id: self.inner.ctx.ids.generate(IdKind::Transaction),
            task_id: task.id.clone(),
            op,
            timestamp: self.inner.ctx.clock.now(),
            session_id: self.session_id(),
            version: task.version,
            task: task.clone(),
        };
        self.inner.txlog.append(&record)
    }

    /// Execution defaults from `taskManagement.*` settings.
    fn default_execution_context(&self) -> ExecutionContext {
        let settings = &self.inner.ctx.settings;
        let mut context = ExecutionContext::default();
        if let Some(timeout) = settings
            .setting("taskManagement.defaultTimeout")
            .and_then(|value| value.as_str().map(str::to_string))
        {
            match parse_duration(&timeout) {
                Ok(duration) => context.timeout_secs = duration.num_seconds().max(1) as u64,
                Err(err) => tracing::warn!(error = %err, "ignoring invalid default task timeout"),
            }
        }
        if let Some(retries) = settings
            .setting("taskManagement.maxRetries")
            .and_then(|value| value.as_integer())
        {
            context.max_retries = u32::try_from(retries).unwrap_or(context.max_retries);
        }
        context
    }
}

/// Reject a task whose stored checksum disagrees with its content.
pub fn verify_checksum(task: &Task) -> Result<()> {
    match task.checksum_matches()? {
        Some(false) => Err(Error::integrity(
            format!("task {}", task.id),
            "checksum mismatch",
        )),
        _ => Ok(()),
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SequentialIdGenerator};
    use crate::config::Config;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::TempDir;

    fn engine() -> (TempDir, TaskPersistenceEngine, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let ctx = EngineContext::new(dir.path(), Config::default())
            .with_clock(clock.clone())
            .with_ids(Arc::new(SequentialIdGenerator::new()));
        let engine = TaskPersistenceEngine::new(ctx);
        engine.init().unwrap();
        (dir, engine, clock)
    }

    #[test]
    fn create_normalizes_and_round_trips() {
        let (_dir, engine, _clock) = engine();
        let mut input = NewTask::new("  Write   tests ", " Testing ");
        input.priority = Some("HIGH".to_string());
        input.tags = vec!["Unit".to_string(), "unit".to_string()];
        input.custom.insert("note".to_string(), json!("<b>keep</b> text"));

        let created = engine.create_task(input).unwrap();
        assert_eq!(created.id, "task-0001");
        assert_eq!(created.title, "Write tests");
        assert_eq!(created.category, TaskCategory::Testing);
        assert_eq!(created.priority, TaskPriority::High);
        assert_eq!(created.metadata.tags, vec!["unit".to_string()]);
        assert_eq!(created.metadata.custom["note"], json!("keep text"));
        assert_eq!(created.execution_context.timeout_secs, 30 * 60);
        assert_eq!(created.version, 1);

        let loaded = engine.get_task(&created.id).unwrap();
        assert_eq!(loaded, created);
    }

    #[test]
    fn invalid_input_is_rejected_before_io() {
        let (_dir, engine, _clock) = engine();
        let err = engine.create_task(NewTask::new("   ", "testing")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = engine.create_task(NewTask::new("ok", "poetry")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(engine.storage().list_task_ids().unwrap().is_empty());
        assert!(!engine.txlog().is_available());
    }

    #[test]
    fn update_bumps_version_and_timestamp() {
        let (_dir, engine, clock) = engine();
        let task = engine.create_task(NewTask::new("a", "general")).unwrap();
        clock.advance(chrono::Duration::seconds(30));

        let updated = engine
            .update_task(&task.id, &TaskUpdate::status(TaskStatus::Running))
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, TaskStatus::Running);
        assert!(updated.metadata.updated_at > task.metadata.updated_at);
        assert_eq!(engine.get_task(&task.id).unwrap().version, 2);
    }

    #[test]
    fn missing_and_deleted_tasks_are_not_found() {
        let (_dir, engine, _clock) = engine();
        let err = engine
            .update_task("task-9999", &TaskUpdate::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let task = engine.create_task(NewTask::new("a", "general")).unwrap();
        engine.get_task(&task.id).unwrap();
        engine.delete_task(&task.id).unwrap();
        assert!(matches!(
            engine.get_task(&task.id).unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            engine.delete_task(&task.id).unwrap_err(),
            Error::NotFound { .. }
        ));

        let listed = engine.list_tasks(&TaskFilter::default()).unwrap();
        assert!(listed.is_empty());
        let with_deleted = engine
            .list_tasks(&TaskFilter {
                include_deleted: true,
                ..TaskFilter::default()
            })
            .unwrap();
        assert_eq!(with_deleted.len(), 1);
    }

    #[test]
    fn tampered_task_is_an_integrity_error() {
        let (_dir, engine, _clock) = engine();
        let task = engine.create_task(NewTask::new("a", "general")).unwrap();
        let path = engine.storage().task_file(&task.id);
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"a\"", "\"b\"")).unwrap();
        engine.clear_cache();

        let err = engine.get_task(&task.id).unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        let scan = engine.scan_tasks().unwrap();
        assert_eq!(scan.corrupted, vec![task.id]);
    }

    #[test]
    fn cache_serves_repeat_reads_and_is_invalidated_by_writes() {
        let (_dir, engine, _clock) = engine();
        let task = engine.create_task(NewTask::new("a", "general")).unwrap();
        engine.get_task(&task.id).unwrap();
        engine.get_task(&task.id).unwrap();
        let stats = engine.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);

        engine
            .update_task(&task.id, &TaskUpdate::status(TaskStatus::Paused))
            .unwrap();
        assert_eq!(engine.cache_stats().entries, 0);
        assert_eq!(engine.get_task(&task.id).unwrap().status, TaskStatus::Paused);
    }

    #[test]
    fn listing_is_filtered_and_ordered() {
        let (_dir, engine, clock) = engine();
        for (title, category) in [("b", "testing"), ("a", "general"), ("c", "testing")] {
            engine.create_task(NewTask::new(title, category)).unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }
        let filter = TaskFilter {
            category: Some(TaskCategory::Testing),
            ..TaskFilter::default()
        };
        let titles: Vec<String> = engine
            .list_tasks(&filter)
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["b", "c"]);
    }

    #[test]
    fn sessions_round_trip() {
        let (_dir, engine, clock) = engine();
        let session = Session::new("s-1", clock.now(), crate::session::ProcessInfo::current());
        engine.save_session(&session).unwrap();
        assert_eq!(engine.get_session("s-1").unwrap(), session);
        engine
            .update_session("s-1", |s| s.counters.errors += 1)
            .unwrap();
        assert_eq!(engine.list_sessions().unwrap()[0].counters.errors, 1);
        assert!(engine.delete_session("s-1").unwrap());
        assert!(matches!(
            engine.get_session("s-1").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn crashed_session_can_be_claimed_once() {
        let (_dir, engine, clock) = engine();
        let session = Session::new("s-1", clock.now(), crate::session::ProcessInfo::current());
        engine.save_session(&session).unwrap();
        let timeout = chrono::Duration::minutes(5);

        assert!(engine
            .claim_crashed_session("s-1", "s-2", clock.now(), timeout)
            .unwrap()
            .is_none());

        clock.advance(chrono::Duration::minutes(10));
        let claimed = engine
            .claim_crashed_session("s-1", "s-2", clock.now(), timeout)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.recovered_by.as_deref(), Some("s-2"));
        assert!(engine
            .claim_crashed_session("s-1", "s-3", clock.now(), timeout)
            .unwrap()
            .is_none());
        assert!(engine
            .claim_crashed_session("missing", "s-3", clock.now(), timeout)
            .unwrap()
            .is_none());
    }

    #[test]
    fn invalidation_hooks_see_every_write() {
        let (_dir, engine, _clock) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.on_invalidate(Arc::new(move |id: &str| sink.lock().unwrap().push(id.to_string())));

        let task = engine.create_task(NewTask::new("a", "general")).unwrap();
        engine
            .update_task(&task.id, &TaskUpdate::status(TaskStatus::Running))
            .unwrap();
        engine.delete_task(&task.id).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![task.id.clone(); 3]);
    }
}
