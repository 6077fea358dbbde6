//! taskvault recover and resume commands

use crate::cli::CommandContext;
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::persistence::TaskPersistenceEngine;
use crate::recovery::{RecoveryStatus, RecoveryStrategy, TaskRecoveryManager};

fn manager(cmd: &CommandContext) -> TaskRecoveryManager {
    TaskRecoveryManager::new(TaskPersistenceEngine::new(cmd.ctx.clone()))
        .with_events(cmd.events.clone())
}

fn parse_strategy(raw: &str) -> Result<RecoveryStrategy> {
    RecoveryStrategy::ORDER
        .into_iter()
        .find(|strategy| strategy.as_str() == raw.trim().to_ascii_lowercase())
        .ok_or_else(|| {
            Error::Validation(format!(
                "unknown strategy '{raw}' (expected hot, warm, cold or emergency)"
            ))
        })
}

pub fn run_system(cmd: &CommandContext, strategy: Option<&str>) -> Result<()> {
    let manager = manager(cmd);
    manager.engine().init()?;
    let report = match strategy {
        Some(raw) => manager.recover_with(parse_strategy(raw)?)?,
        None => manager.recover_system()?,
    };

    let header = match report.status {
        RecoveryStatus::Succeeded => format!("taskvault recover: {} recovery succeeded", report.strategy),
        RecoveryStatus::Partial => format!("taskvault recover: {} recovery partial", report.strategy),
    };
    let mut human = HumanOutput::new(header);
    human.push_summary("restored", report.restored.len().to_string());
    human.push_summary("unchanged", report.unchanged.len().to_string());
    if let Some(id) = &report.checkpoint_id {
        human.push_summary("checkpoint", id.clone());
    }
    for attempt in &report.attempts {
        human.push_detail(format!("{} failed: {}", attempt.strategy, attempt.error));
    }
    for failed in &report.failed {
        human.push_warning(format!("{}: {}", failed.task_id, failed.reason));
    }
    for warning in &report.warnings {
        human.push_warning(warning.clone());
    }

    emit_success(cmd.output, "recover", &report, Some(&human))
}

pub fn run_task(cmd: &CommandContext, task_id: &str) -> Result<()> {
    let manager = manager(cmd);
    let recovery = manager.recover_task(task_id)?;

    let mut human = HumanOutput::new(format!("taskvault recover: repaired {task_id}"));
    human.push_summary("source", format!("{:?}", recovery.source).to_lowercase());
    human.push_summary("version", recovery.task.version.to_string());
    human.push_summary("candidates", recovery.candidates.to_string());
    for action in &recovery.actions {
        human.push_detail(action.clone());
    }

    emit_success(cmd.output, "recover", &recovery, Some(&human))
}

pub fn run_resume(cmd: &CommandContext, session_id: &str) -> Result<()> {
    let report = manager(cmd).resume_session_tasks(session_id)?;

    let mut human = HumanOutput::new(format!(
        "taskvault resume: {} resumable task(s) from {session_id}",
        report.resumable.len()
    ));
    for task in &report.resumable {
        human.push_detail(format!("{} [{}] {}", task.id, task.status.as_str(), task.title));
    }
    if !report.skipped.is_empty() {
        human.push_summary("skipped", report.skipped.len().to_string());
    }

    emit_success(cmd.output, "resume", &report, Some(&human))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_parse() {
        assert_eq!(parse_strategy("Cold").unwrap(), RecoveryStrategy::Cold);
        assert!(matches!(parse_strategy("lukewarm"), Err(Error::Validation(_))));
    }
}
