//! taskvault checkpoint and restore commands

use crate::checkpoint::CheckpointStore;
use crate::cli::CommandContext;
use crate::cross_session::CrossSessionEngine;
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateReport {
    session_id: String,
    checkpoint_id: Option<String>,
    recovered_sessions: Vec<String>,
    flushed: usize,
}

/// Open a session, recovering crashed ones, and close it with a checkpoint.
pub fn run_create(cmd: &CommandContext) -> Result<()> {
    let engine = CrossSessionEngine::with_events(cmd.ctx.clone(), cmd.events.clone());
    let init = engine.initialize()?;
    let shutdown = engine.shutdown(false)?;
    let checkpoint_id = shutdown.checkpoint_id.clone().ok_or_else(|| {
        Error::OperationFailed("shutdown finished without a checkpoint".to_string())
    })?;

    let report = CreateReport {
        session_id: init.session_id,
        checkpoint_id: Some(checkpoint_id.clone()),
        recovered_sessions: init
            .crashed_sessions
            .iter()
            .map(|r| r.crashed_session_id.clone())
            .collect(),
        flushed: shutdown.flushed,
    };

    let mut human = HumanOutput::new(format!("taskvault checkpoint: created {checkpoint_id}"));
    human.push_summary("session", report.session_id.clone());
    for recovery in &init.crashed_sessions {
        human.push_detail(format!(
            "recovered crashed session {} ({} strategy, {} restored)",
            recovery.crashed_session_id, recovery.strategy, recovery.restored
        ));
    }
    if !shutdown.removed_sessions.is_empty() {
        human.push_detail(format!(
            "removed expired sessions: {}",
            shutdown.removed_sessions.join(", ")
        ));
    }

    emit_success(cmd.output, "checkpoint", &report, Some(&human))
}

pub fn run_list(cmd: &CommandContext) -> Result<()> {
    let store = CheckpointStore::new(
        cmd.ctx.storage.clone(),
        cmd.ctx.locks.clone(),
        cmd.ctx.lock_timeout_ms(),
    );
    let summaries = store.summaries()?;

    let mut human = HumanOutput::new(format!("taskvault checkpoints: {}", summaries.len()));
    for summary in &summaries {
        human.push_detail(format!(
            "{} {} {} tasks={} session={}{}",
            summary.id,
            summary.timestamp.to_rfc3339(),
            summary.kind,
            summary.task_count,
            summary.session_id,
            if summary.valid { "" } else { " INVALID" }
        ));
    }
    if summaries.iter().any(|s| !s.valid) {
        human.push_warning("some checkpoints failed verification and cannot be restored");
    }

    emit_success(cmd.output, "checkpoint", &summaries, Some(&human))
}

pub fn run_restore(cmd: &CommandContext, id: &str) -> Result<()> {
    let engine = CrossSessionEngine::with_events(cmd.ctx.clone(), cmd.events.clone());
    let report = engine.restore_from_checkpoint(id)?;

    let mut human = HumanOutput::new(format!("taskvault restore: restored {id}"));
    human.push_summary("restored", report.restored.to_string());
    human.push_summary("deleted", report.tombstoned.to_string());

    emit_success(cmd.output, "restore", &report, Some(&human))
}
