//! Task recovery.
//!
//! [`TaskRecoveryManager`] rebuilds task state after a crash or corruption.
//! A full recovery analyses what survives on disk and runs the first
//! [`RecoveryStrategy`] whose precondition holds; a strategy that errors
//! hands over to the next one. Targeted repair of a single task goes through
//! [`TaskRecoveryManager::recover_task`].
//!
//! Recovery never lowers a stored version: a task written back over an
//! existing file gets a version above the one it replaces.

pub mod repair;
pub mod strategy;
pub mod validate;

use std::collections::BTreeMap;
use std::fs;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::clock::IdKind;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus, EventKind};
use crate::persistence::TaskPersistenceEngine;
use crate::task::{Task, TaskCategory, TaskFilter, TaskStatus};
use crate::txlog::TxOp;

pub use repair::{repair_task, RepairOutcome, TaskFragment};
pub use strategy::{
    FailedTask, RecoveryReport, RecoveryStatus, RecoveryStrategy, StrategyAttempt,
    SystemAnalysis,
};
pub use validate::{
    Severity, TaskValidator, TaskValidatorSet, ValidationContext, ValidationIssue,
    ValidationLevel, ValidationReport,
};

/// Where a recovery candidate was found.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Disk,
    Fragment,
    TransactionLog,
    Checkpoint,
}

#[derive(Debug, Clone)]
struct Candidate {
    task: Task,
    source: CandidateSource,
}

impl Candidate {
    /// Higher version wins, then an intact copy over a salvaged one, then recency.
    fn rank(&self) -> (u64, bool, DateTime<Utc>) {
        (
            self.task.version,
            self.source != CandidateSource::Fragment,
            self.task.metadata.updated_at,
        )
    }
}

/// Tasks a prior session left unfinished.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeReport {
    pub session_id: String,
    pub resumable: Vec<Task>,
    /// Ids of the session's tasks that are finished or otherwise not resumable
    pub skipped: Vec<String>,
}

/// Result of a targeted single-task recovery.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecovery {
    pub task: Task,
    pub source: CandidateSource,
    pub candidates: usize,
    pub actions: Vec<String>,
}

enum WriteBack {
    Written,
    Kept,
}

/// Rebuilds task state from checkpoints, the transaction log and fragments.
#[derive(Debug)]
pub struct TaskRecoveryManager {
    engine: TaskPersistenceEngine,
    checkpoints: CheckpointStore,
    validators: TaskValidatorSet,
    events: Option<EventBus>,
}

impl TaskRecoveryManager {
    pub fn new(engine: TaskPersistenceEngine) -> Self {
        let ctx = engine.context();
        let checkpoints = CheckpointStore::new(
            ctx.storage.clone(),
            ctx.locks.clone(),
            ctx.lock_timeout_ms(),
        );
        Self {
            engine,
            checkpoints,
            validators: TaskValidatorSet::default(),
            events: None,
        }
    }

    pub fn with_validators(mut self, validators: TaskValidatorSet) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn engine(&self) -> &TaskPersistenceEngine {
        &self.engine
    }

    fn now(&self) -> DateTime<Utc> {
        self.engine.context().clock.now()
    }

    /// Survey checkpoints, task files and the transaction log.
    pub fn analyze_system(&self) -> Result<SystemAnalysis> {
        let scan = self.engine.scan_tasks()?;
        let task_files = self.engine.storage().list_task_ids()?.len();
        let replay = self.engine.txlog().read_all()?;
        let clean_checkpoint = self.checkpoints.latest_valid(None)?;
        Ok(SystemAnalysis {
            analyzed_at: self.now(),
            clean_checkpoint_id: clean_checkpoint.as_ref().map(|cp| cp.id.clone()),
            clean_checkpoint,
            checkpoints: self.checkpoints.count()?,
            task_files,
            readable_tasks: scan.tasks.len(),
            corrupted_tasks: scan.corrupted,
            tx_records: replay.records.len(),
            tx_skipped_lines: replay.skipped_lines,
        })
    }

    /// Run the cheapest applicable strategy, falling through on failure.
    pub fn recover_system(&self) -> Result<RecoveryReport> {
        let analysis = self.analyze_system()?;
        tracing::info!(
            task_files = analysis.task_files,
            corrupted = analysis.corrupted_tasks.len(),
            tx_records = analysis.tx_records,
            checkpoints = analysis.checkpoints,
            "starting system recovery"
        );

        let mut attempts = Vec::new();
        for strategy in RecoveryStrategy::ORDER {
            if !strategy.accepts(&analysis) {
                continue;
            }
            tracing::info!(strategy = strategy.as_str(), "attempting recovery strategy");
            match self.run_strategy(strategy, &analysis) {
                Ok(mut report) => {
                    report.attempts = attempts;
                    self.publish_completed(&report);
                    return Ok(report);
                }
                Err(err) => {
                    tracing::warn!(strategy = strategy.as_str(), error = %err, "recovery strategy failed");
                    attempts.push(StrategyAttempt {
                        strategy,
                        error: err.to_string(),
                    });
                }
            }
        }

        Err(Error::RecoveryExhausted(
            attempts
                .iter()
                .map(|attempt| format!("{}: {}", attempt.strategy, attempt.error))
                .collect(),
        ))
    }

    /// Run one named strategy, provided its precondition holds.
    pub fn recover_with(&self, strategy: RecoveryStrategy) -> Result<RecoveryReport> {
        let analysis = self.analyze_system()?;
        if !strategy.accepts(&analysis) {
            return Err(Error::OperationFailed(format!(
                "{strategy} recovery is not applicable"
            )));
        }
        let report = self.run_strategy(strategy, &analysis)?;
        self.publish_completed(&report);
        Ok(report)
    }

    /// Restore from a specific checkpoint, verifying it first.
    pub fn replay_checkpoint(&self, checkpoint: &Checkpoint) -> Result<RecoveryReport> {
        checkpoint.verify()?;
        let report = self.hot_recovery(checkpoint)?;
        self.publish_completed(&report);
        Ok(report)
    }

    fn run_strategy(
        &self,
        strategy: RecoveryStrategy,
        analysis: &SystemAnalysis,
    ) -> Result<RecoveryReport> {
        match strategy {
            RecoveryStrategy::Hot => match &analysis.clean_checkpoint {
                Some(checkpoint) => self.hot_recovery(checkpoint),
                None => Err(Error::OperationFailed(
                    "no clean checkpoint available".to_string(),
                )),
            },
            RecoveryStrategy::Warm => self.warm_recovery(),
            RecoveryStrategy::Cold => self.cold_recovery(),
            RecoveryStrategy::Emergency => self.emergency_recovery(),
        }
    }

    // =========================================================================
    // Strategies
    // =========================================================================

    fn hot_recovery(&self, checkpoint: &Checkpoint) -> Result<RecoveryReport> {
        let now = self.now();
        let mut report = RecoveryReport::new(RecoveryStrategy::Hot, now);
        report.checkpoint_id = Some(checkpoint.id.clone());

        let on_disk = self.engine.scan_tasks()?.tasks;
        let ctx = ValidationContext::new(on_disk.iter().chain(&checkpoint.task_snapshot), now);
        for task in &checkpoint.task_snapshot {
            if !self.accept(task, ValidationLevel::Standard, &ctx, &mut report) {
                continue;
            }
            self.write_back(task.clone(), TxOp::Restore, &mut report)?;
        }

        tracing::info!(
            checkpoint_id = %checkpoint.id,
            restored = report.restored.len(),
            failed = report.failed.len(),
            "hot recovery finished"
        );
        Ok(self.finish(report))
    }

    fn warm_recovery(&self) -> Result<RecoveryReport> {
        let now = self.now();
        let mut report = RecoveryReport::new(RecoveryStrategy::Warm, now);
        let candidates = self.gather_candidates(None, &mut report)?;
        if candidates.is_empty() {
            return Err(Error::OperationFailed(
                "no task data found in any source".to_string(),
            ));
        }

        let mut chosen = Vec::with_capacity(candidates.len());
        for (id, copies) in candidates {
            match best_candidate(copies) {
                Some(candidate) => chosen.push(self.ensure_sealed(candidate.task, now)?),
                None => report.fail(id, "no usable copy"),
            }
        }

        let ctx = ValidationContext::new(chosen.iter(), now);
        for task in &chosen {
            if !self.accept(task, ValidationLevel::Comprehensive, &ctx, &mut report) {
                continue;
            }
            self.write_back(task.clone(), TxOp::Recover, &mut report)?;
        }

        tracing::info!(
            restored = report.restored.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            "warm recovery finished"
        );
        Ok(self.finish(report))
    }

    fn cold_recovery(&self) -> Result<RecoveryReport> {
        let now = self.now();
        let mut report = RecoveryReport::new(RecoveryStrategy::Cold, now);
        let replay = self.engine.txlog().read_all()?;
        if replay.records.is_empty() {
            return Err(Error::OperationFailed(
                "transaction log is empty".to_string(),
            ));
        }
        if replay.skipped_lines > 0 {
            report.warnings.push(format!(
                "skipped {} unreadable transaction log lines",
                replay.skipped_lines
            ));
        }

        let mut rebuilt = Vec::new();
        for (id, records) in replay.by_task() {
            let mut state: Option<&Task> = None;
            for record in records {
                if record.task.checksum_matches()? == Some(false) {
                    report
                        .warnings
                        .push(format!("{id}: ignored transaction {} with bad checksum", record.tx_id));
                    continue;
                }
                // Later records win unless they would move the version backwards.
                if state.map_or(true, |current| record.task.version >= current.version) {
                    state = Some(&record.task);
                }
            }
            match state {
                Some(task) => rebuilt.push(task.clone()),
                None => report.fail(id, "no intact transaction for task"),
            }
        }

        let ctx = ValidationContext::new(rebuilt.iter(), now);
        for task in &rebuilt {
            if !self.accept(task, ValidationLevel::Standard, &ctx, &mut report) {
                continue;
            }
            self.write_back(task.clone(), TxOp::Recover, &mut report)?;
        }

        tracing::info!(
            rebuilt = rebuilt.len(),
            restored = report.restored.len(),
            "cold recovery finished"
        );
        Ok(self.finish(report))
    }

    fn emergency_recovery(&self) -> Result<RecoveryReport> {
        let now = self.now();
        let mut report = RecoveryReport::new(RecoveryStrategy::Emergency, now);
        let scan = self.engine.scan_tasks()?;
        report
            .unchanged
            .extend(scan.tasks.iter().map(|task| task.id.clone()));

        for id in &scan.corrupted {
            match self.salvage_fragment(id, now) {
                Ok(Some(outcome)) => {
                    self.write_back(outcome.task, TxOp::Recover, &mut report)?;
                }
                Ok(None) => report.fail(id.clone(), "task file vanished during recovery"),
                Err(err) => report.fail(id.clone(), err.to_string()),
            }
        }

        if report.recovered_count() == 0 {
            let task = self.continuity_task(now)?;
            report
                .warnings
                .push(format!("no recoverable tasks; created placeholder {}", task.id));
            self.engine.put_task(task.clone(), TxOp::Recover)?;
            report.restored.push(task.id);
        }

        tracing::warn!(
            salvaged = report.restored.len(),
            failed = report.failed.len(),
            "emergency recovery finished"
        );
        let mut report = self.finish(report);
        report.status = RecoveryStatus::Partial;
        Ok(report)
    }

    fn continuity_task(&self, now: DateTime<Utc>) -> Result<Task> {
        let id = self.engine.context().ids.generate(IdKind::Task);
        let mut task = Task::new(id, "System continuity", now);
        task.description =
            "Placeholder created by emergency recovery; review task state and recreate lost work."
                .to_string();
        task.category = TaskCategory::Maintenance;
        task.status = TaskStatus::Pending;
        task.metadata.session_id = self.engine.session_id();
        task.metadata.recovered = true;
        task.metadata.recovered_at = Some(now);
        task.metadata
            .repair_actions
            .push("synthesized continuity placeholder".to_string());
        task.seal()?;
        Ok(task)
    }

    // =========================================================================
    // Single tasks and sessions
    // =========================================================================

    /// Rebuild one task from the freshest valid copy in any source.
    pub fn recover_task(&self, id: &str) -> Result<TaskRecovery> {
        crate::storage::validate_entity_id("task", id)?;
        let now = self.now();
        let mut scratch = RecoveryReport::new(RecoveryStrategy::Warm, now);
        let copies = self
            .gather_candidates(Some(id), &mut scratch)?
            .remove(id)
            .unwrap_or_default();
        if copies.is_empty() {
            return Err(Error::task_not_found(id));
        }
        let candidate_count = copies.len();
        let highest = copies.iter().map(|c| c.task.version).max().unwrap_or(1);

        let on_disk = self.engine.scan_tasks()?.tasks;
        let ctx = ValidationContext::new(on_disk.iter(), now);
        let valid: Vec<Candidate> = copies
            .into_iter()
            .filter(|candidate| {
                self.validators
                    .validate(&candidate.task, ValidationLevel::Standard, &ctx)
                    .is_valid()
            })
            .collect();
        let best = best_candidate(valid).ok_or_else(|| {
            Error::integrity(format!("task {id}"), "no copy of the task passes validation")
        })?;
        if best.task.is_deleted() {
            return Err(Error::task_not_found(id));
        }

        let source = best.source;
        let outcome = repair_task(
            TaskFragment::from_task(&best.task),
            self.engine.context().ids.as_ref(),
            now,
        )?;

        let _guard = self.engine.lock_task(id)?;
        let disk_version = self.read_disk(id)?.map(|task| task.version);
        let mut task = outcome.task;
        task.version = disk_version.unwrap_or(0).max(highest) + 1;
        let task = self.engine.put_task_locked(task, TxOp::Recover)?;

        tracing::info!(task_id = %id, source = ?source, version = task.version, "task recovered");
        Ok(TaskRecovery {
            task,
            source,
            candidates: candidate_count,
            actions: outcome.actions,
        })
    }

    /// Unfinished tasks recorded under `session_id`.
    pub fn resume_session_tasks(&self, session_id: &str) -> Result<ResumeReport> {
        crate::storage::validate_entity_id("session", session_id)?;
        let filter = TaskFilter {
            session_id: Some(session_id.to_string()),
            ..TaskFilter::default()
        };
        let (resumable, finished): (Vec<Task>, Vec<Task>) = self
            .engine
            .list_tasks(&filter)?
            .into_iter()
            .partition(|task| task.status.is_resumable());
        tracing::info!(
            session_id,
            resumable = resumable.len(),
            skipped = finished.len(),
            "resuming session tasks"
        );
        Ok(ResumeReport {
            session_id: session_id.to_string(),
            resumable,
            skipped: finished.into_iter().map(|task| task.id).collect(),
        })
    }

    /// Repair a fragment with this manager's id generator and clock.
    pub fn repair_task(&self, fragment: TaskFragment) -> Result<RepairOutcome> {
        repair_task(fragment, self.engine.context().ids.as_ref(), self.now())
    }

    /// Validate a task against everything currently on disk.
    pub fn validate_task(&self, task: &Task, level: ValidationLevel) -> Result<ValidationReport> {
        let on_disk = self.engine.scan_tasks()?.tasks;
        let ctx = ValidationContext::new(on_disk.iter(), self.now());
        Ok(self.validators.validate(task, level, &ctx))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Every copy of every task (or of one task) across all sources.
    fn gather_candidates(
        &self,
        only: Option<&str>,
        report: &mut RecoveryReport,
    ) -> Result<BTreeMap<String, Vec<Candidate>>> {
        let now = self.now();
        let wanted = |id: &str| only.map_or(true, |only| only == id);
        let mut candidates: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        let mut add = |task: Task, source: CandidateSource| {
            candidates
                .entry(task.id.clone())
                .or_default()
                .push(Candidate { task, source });
        };

        let scan = self.engine.scan_tasks()?;
        for task in scan.tasks.into_iter().filter(|task| wanted(task.id.as_str())) {
            add(task, CandidateSource::Disk);
        }
        for id in scan.corrupted.iter().filter(|id| wanted(id.as_str())) {
            match self.salvage_fragment(id, now) {
                Ok(Some(outcome)) => add(outcome.task, CandidateSource::Fragment),
                Ok(None) => {}
                Err(err) => report.warnings.push(format!("{id}: fragment unusable: {err}")),
            }
        }

        let replay = self.engine.txlog().read_all()?;
        for (id, records) in replay.by_task() {
            if !wanted(id.as_str()) {
                continue;
            }
            if let Some(record) = records
                .into_iter()
                .filter(|record| record.task.checksum_matches().ok().flatten() != Some(false))
                .max_by_key(|record| record.version)
            {
                add(record.task.clone(), CandidateSource::TransactionLog);
            }
        }

        for checkpoint in self.checkpoints.list()? {
            if let Err(err) = checkpoint.verify() {
                report
                    .warnings
                    .push(format!("ignored checkpoint {}: {err}", checkpoint.id));
                continue;
            }
            for task in checkpoint.task_snapshot.into_iter().filter(|task| wanted(task.id.as_str())) {
                add(task, CandidateSource::Checkpoint);
            }
        }

        Ok(candidates)
    }

    /// Repair whatever can be read from a damaged task file.
    fn salvage_fragment(&self, id: &str, now: DateTime<Utc>) -> Result<Option<RepairOutcome>> {
        let path = self.engine.storage().task_file(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut fragment = TaskFragment::from_file_contents(&path, &content);
        fragment.id = Some(id.to_string());
        let outcome = repair_task(fragment, self.engine.context().ids.as_ref(), now)?;
        tracing::debug!(task_id = %id, actions = outcome.actions.len(), "salvaged task fragment");
        Ok(Some(outcome))
    }

    /// Reseal copies whose checksum no longer matches their content.
    fn ensure_sealed(&self, task: Task, now: DateTime<Utc>) -> Result<Task> {
        match task.checksum_matches()? {
            Some(false) => Ok(repair_task(
                TaskFragment::from_task(&task),
                self.engine.context().ids.as_ref(),
                now,
            )?
            .task),
            _ => Ok(task),
        }
    }

    /// Validate and record the outcome; returns whether the task may be written.
    fn accept(
        &self,
        task: &Task,
        level: ValidationLevel,
        ctx: &ValidationContext<'_>,
        report: &mut RecoveryReport,
    ) -> bool {
        let validation = self.validators.validate(task, level, ctx);
        if !validation.is_valid() {
            report.fail(task.id.clone(), validation.summary());
            return false;
        }
        for issue in validation.warnings() {
            report.warnings.push(format!("{}: {}", task.id, issue.message));
        }
        true
    }

    /// Write `task` unless an intact copy at least as new is already on disk.
    fn write_back(&self, mut task: Task, op: TxOp, report: &mut RecoveryReport) -> Result<()> {
        let id = task.id.clone();
        let outcome = {
            let _guard = self.engine.lock_task(&id)?;
            let disk = self.read_disk(&id)?;
            let keep = disk.as_ref().is_some_and(|disk| {
                disk.version >= task.version && disk.checksum_matches().ok().flatten() != Some(false)
            });
            if keep {
                WriteBack::Kept
            } else {
                task.version = next_version(task.version, disk.map(|disk| disk.version));
                self.engine.put_task_locked(task, op)?;
                WriteBack::Written
            }
        };
        match outcome {
            WriteBack::Written => report.restored.push(id),
            WriteBack::Kept => report.unchanged.push(id),
        }
        Ok(())
    }

    /// Stored copy, if it parses.
    fn read_disk(&self, id: &str) -> Result<Option<Task>> {
        match self.engine.read_task_raw(id) {
            Ok(task) => Ok(task),
            Err(Error::Integrity { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn finish(&self, mut report: RecoveryReport) -> RecoveryReport {
        report.completed_at = self.now();
        report.status = if report.failed.is_empty() {
            RecoveryStatus::Succeeded
        } else {
            RecoveryStatus::Partial
        };
        report
    }

    fn publish_completed(&self, report: &RecoveryReport) {
        let Some(events) = &self.events else {
            return;
        };
        let event = Event::new(
            EventKind::RecoveryCompleted,
            report.completed_at,
            self.engine.session_id(),
        )
        .with_data(serde_json::json!({
            "strategy": report.strategy,
            "status": report.status,
            "restored": report.restored.len(),
            "unchanged": report.unchanged.len(),
            "failed": report.failed.len(),
            "checkpointId": report.checkpoint_id,
        }));
        match event {
            Ok(event) => events.publish(&event),
            Err(err) => tracing::warn!(error = %err, "failed to build recovery event"),
        }
    }
}

fn best_candidate(candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates.into_iter().max_by_key(Candidate::rank)
}

/// Version for a write that may replace a stored copy.
pub(crate) fn next_version(candidate: u64, stored: Option<u64>) -> u64 {
    match stored {
        Some(stored) if stored >= candidate => stored + 1,
        _ => candidate,
    }
}
