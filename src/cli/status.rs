//! taskvault status command implementation
//!
//! Read-only summary of sessions, tasks, checkpoints and store health.

use std::collections::BTreeMap;

use crate::cli::CommandContext;
use crate::config::CONFIG_FILE;
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};
use crate::persistence::TaskPersistenceEngine;
use crate::recovery::TaskRecoveryManager;
use crate::session::SessionLiveness;

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    initialized: bool,
    last_updated: Option<chrono::DateTime<chrono::Utc>>,
    sessions: Vec<SessionSummary>,
    tasks: TaskSummary,
    checkpoints: CheckpointSummary,
    healthy: bool,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionSummary {
    id: String,
    liveness: SessionLiveness,
    last_activity: chrono::DateTime<chrono::Utc>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskSummary {
    live: usize,
    deleted: usize,
    corrupted: Vec<String>,
    by_status: BTreeMap<&'static str, usize>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointSummary {
    count: usize,
    latest_valid: Option<String>,
}

pub fn run(cmd: &CommandContext) -> Result<()> {
    let engine = TaskPersistenceEngine::new(cmd.ctx.clone());
    let storage = engine.storage().clone();
    let initialized = storage.is_initialized();
    let now = cmd.ctx.clock.now();
    let timeout = cmd.ctx.config.session_timeout();

    let sessions: Vec<SessionSummary> = engine
        .list_sessions()?
        .into_iter()
        .map(|session| SessionSummary {
            liveness: session.liveness(now, timeout),
            id: session.id,
            last_activity: session.last_activity,
        })
        .collect();

    let scan = engine.scan_tasks()?;
    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut deleted = 0;
    for task in &scan.tasks {
        if task.is_deleted() {
            deleted += 1;
        } else {
            *by_status.entry(task.status.as_str()).or_default() += 1;
        }
    }

    let analysis = TaskRecoveryManager::new(engine).analyze_system()?;

    let report = StatusReport {
        initialized,
        last_updated: storage.read_metadata()?.map(|meta| meta.last_updated),
        tasks: TaskSummary {
            live: scan.tasks.len() - deleted,
            deleted,
            corrupted: scan.corrupted,
            by_status,
        },
        checkpoints: CheckpointSummary {
            count: analysis.checkpoints,
            latest_valid: analysis.clean_checkpoint_id.clone(),
        },
        healthy: analysis.is_healthy(),
        sessions,
    };

    let crashed = report
        .sessions
        .iter()
        .filter(|s| s.liveness == SessionLiveness::Crashed)
        .count();

    let mut human = HumanOutput::new(if !initialized {
        "taskvault status: not initialized".to_string()
    } else if report.healthy && crashed == 0 {
        "taskvault status: healthy".to_string()
    } else {
        "taskvault status: attention needed".to_string()
    });
    human.push_summary("project", storage.project_root().display().to_string());
    human.push_summary("tasks", report.tasks.live.to_string());
    human.push_summary("sessions", report.sessions.len().to_string());
    human.push_summary("checkpoints", report.checkpoints.count.to_string());
    for (status, count) in &report.tasks.by_status {
        human.push_detail(format!("{status}: {count}"));
    }
    if let Some(id) = &report.checkpoints.latest_valid {
        human.push_detail(format!("latest valid checkpoint: {id}"));
    }

    if !initialized {
        human.push_next_step("taskvault init");
    }
    if !storage.project_root().join(CONFIG_FILE).exists() {
        human.push_warning(format!("missing {CONFIG_FILE}; using defaults"));
    }
    if !report.tasks.corrupted.is_empty() {
        human.push_warning(format!(
            "corrupted tasks: {}",
            report.tasks.corrupted.join(", ")
        ));
        human.push_next_step("taskvault recover");
    }
    if analysis.tx_skipped_lines > 0 {
        human.push_warning(format!(
            "unreadable transaction log lines: {}",
            analysis.tx_skipped_lines
        ));
    }
    if crashed > 0 {
        human.push_warning(format!("crashed sessions awaiting recovery: {crashed}"));
        human.push_next_step("taskvault checkpoint");
    }

    emit_success(cmd.output, "status", &report, Some(&human))
}
