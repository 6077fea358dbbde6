mod support;

use std::fs;

use chrono::Duration;
use taskvault::checkpoint::CheckpointKind;
use taskvault::clock::Clock;
use taskvault::config::Config;
use taskvault::cross_session::CrossSessionEngine;
use taskvault::error::Error;
use taskvault::recovery::{RecoveryStatus, RecoveryStrategy, TaskRecoveryManager};
use taskvault::task::{NewTask, Task, TaskFilter};

use support::TestProject;

fn cross_session(project: &TestProject, config: Config) -> CrossSessionEngine {
    CrossSessionEngine::new(project.context(config))
}

#[test]
fn tampered_checkpoint_is_refused_and_older_one_restores() {
    let project = TestProject::new();
    let engine = cross_session(&project, Config::default());
    engine.initialize().unwrap();

    engine
        .save_task(Task::new("t-1", "one", project.clock.now()))
        .unwrap();
    let older = engine.create_checkpoint(CheckpointKind::Manual).unwrap();
    project.clock.advance(Duration::seconds(5));
    engine
        .save_task(Task::new("t-2", "two", project.clock.now()))
        .unwrap();
    let newer = engine.create_checkpoint(CheckpointKind::Manual).unwrap();

    let path = engine.engine().storage().checkpoint_file(&newer.id);
    let content = fs::read_to_string(&path).unwrap();
    fs::write(&path, content.replacen("\"two\"", "\"TWO\"", 1)).unwrap();

    assert!(matches!(
        engine.checkpoints().load_verified(&newer.id),
        Err(Error::Integrity { .. })
    ));
    assert!(matches!(
        engine.restore_from_checkpoint(&newer.id),
        Err(Error::Integrity { .. })
    ));
    let latest = engine.checkpoints().latest_valid(None).unwrap().unwrap();
    assert_eq!(latest.id, older.id);

    let report = engine.restore_from_checkpoint(&older.id).unwrap();
    assert_eq!(report.restored, 1);
    assert_eq!(report.tombstoned, 1);
    assert!(matches!(
        engine.engine().get_task("t-2"),
        Err(Error::NotFound { .. })
    ));
    assert_eq!(engine.engine().get_task("t-1").unwrap().title, "one");
}

#[test]
fn crash_without_checkpoint_runs_full_recovery_once() {
    let project = TestProject::new();
    let crashed = cross_session(&project, Config::default());
    let crashed_id = crashed.initialize().unwrap().session_id;
    crashed
        .save_task(Task::new("t-1", "survivor", project.clock.now()))
        .unwrap();
    drop(crashed);

    project.clock.advance(Duration::minutes(10));
    let second = cross_session(&project, Config::default());
    let report = second.initialize().unwrap();
    assert_eq!(report.crashed_sessions.len(), 1);
    let recovery = &report.crashed_sessions[0];
    assert_eq!(recovery.crashed_session_id, crashed_id);
    assert_eq!(recovery.checkpoint_id, None);
    assert_eq!(recovery.strategy, RecoveryStrategy::Warm);
    assert_eq!(second.load_task("t-1").unwrap().task.title, "survivor");
    second.shutdown(false).unwrap();

    project.clock.advance(Duration::minutes(10));
    let third = cross_session(&project, Config::default());
    assert!(third.initialize().unwrap().crashed_sessions.is_empty());
}

#[test]
fn lost_task_file_is_rebuilt_from_transaction_log() {
    let project = TestProject::new();
    let engine = project.engine();
    let task = engine.create_task(NewTask::new("alpha", "general")).unwrap();
    fs::remove_file(engine.storage().task_file(&task.id)).unwrap();

    let manager = TaskRecoveryManager::new(engine.clone());
    let report = manager.recover_system().unwrap();
    assert_eq!(report.strategy, RecoveryStrategy::Warm);
    assert_eq!(report.restored, vec![task.id.clone()]);
    assert_eq!(engine.get_task(&task.id).unwrap().title, "alpha");

    let again = manager.recover_system().unwrap();
    assert!(again.restored.is_empty());
    assert_eq!(again.unchanged, vec![task.id.clone()]);

    let cold = manager.recover_with(RecoveryStrategy::Cold).unwrap();
    assert_eq!(cold.strategy, RecoveryStrategy::Cold);
    assert_eq!(cold.unchanged, vec![task.id]);
}

#[test]
fn unreadable_checkpoint_falls_through_to_emergency() {
    let project = TestProject::new();
    let engine = project.engine();
    fs::write(engine.storage().checkpoint_file("bad"), "{ not json").unwrap();

    let manager = TaskRecoveryManager::new(engine.clone());
    let analysis = manager.analyze_system().unwrap();
    assert_eq!(analysis.checkpoints, 1);
    assert!(analysis.clean_checkpoint_id.is_none());

    let report = manager.recover_system().unwrap();
    assert_eq!(report.strategy, RecoveryStrategy::Emergency);
    assert_eq!(report.status, RecoveryStatus::Partial);
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].strategy, RecoveryStrategy::Warm);

    let tasks = engine.list_tasks(&TaskFilter::default()).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "System continuity");
    assert!(tasks[0].metadata.recovered);
    assert_eq!(report.restored, vec![tasks[0].id.clone()]);
}

#[test]
fn forced_shutdown_takes_emergency_checkpoint_when_flush_fails() {
    let project = TestProject::new();
    let mut config = Config::default();
    config.persistence.performance_optimization.async_writes = true;
    config.persistence.performance_optimization.batch_size = 50;
    let engine = cross_session(&project, config);
    let session_id = engine.initialize().unwrap().session_id;

    let saved = engine
        .save_task(Task::new("t-1", "pending write", project.clock.now()))
        .unwrap();
    assert!(saved.buffered);
    // A directory where the task file belongs makes every write fail.
    fs::create_dir_all(engine.engine().storage().task_file("t-1")).unwrap();

    assert!(matches!(engine.shutdown(false), Err(Error::Io(_))));
    assert!(engine.is_initialized());
    assert_eq!(engine.stats().unwrap().buffered_writes, 1);

    let report = engine.shutdown(true).unwrap();
    assert!(report.force);
    assert_eq!(report.flushed, 0);
    assert_eq!(report.checkpoint_kind, Some(CheckpointKind::Emergency));
    let checkpoint = engine
        .checkpoints()
        .load_verified(report.checkpoint_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::Emergency);
    assert!(checkpoint.reason.is_some());
    assert_eq!(checkpoint.active_transactions, vec!["t-1".to_string()]);
    assert_eq!(checkpoint.task_snapshot[0].title, "pending write");

    assert!(!engine.is_initialized());
    let session = engine.engine().get_session(&session_id).unwrap();
    assert!(session.end_time.is_some());
}
