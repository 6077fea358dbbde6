mod support;

use std::sync::Arc;
use std::thread;

use taskvault::config::Config;
use taskvault::error::Error;
use taskvault::persistence::TaskPersistenceEngine;
use taskvault::task::{NewTask, TaskFilter, TaskStatus, TaskUpdate};
use taskvault::txlog::TxOp;

use support::{BusyLocks, TestProject};

#[test]
fn concurrent_updates_each_bump_the_version() {
    let project = TestProject::new();
    let engine = project.engine();
    let task = engine.create_task(NewTask::new("shared", "general")).unwrap();

    const WRITERS: u64 = 8;
    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let engine = engine.clone();
            let id = task.id.clone();
            thread::spawn(move || {
                let update = TaskUpdate {
                    description: Some(format!("writer {i}")),
                    ..TaskUpdate::default()
                };
                engine.update_task(&id, &update).unwrap()
            })
        })
        .collect();

    let mut versions: Vec<u64> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().version)
        .collect();
    versions.sort_unstable();
    assert_eq!(versions, (2..=WRITERS + 1).collect::<Vec<_>>());

    let stored = engine.get_task(&task.id).unwrap();
    assert_eq!(stored.version, WRITERS + 1);
    assert_eq!(stored.checksum_matches().unwrap(), Some(true));

    let replay = engine.txlog().read_all().unwrap();
    assert_eq!(replay.skipped_lines, 0);
    assert_eq!(replay.records.len() as u64, WRITERS + 1);
    assert_eq!(
        replay.records.iter().filter(|r| r.op == TxOp::Update).count() as u64,
        WRITERS
    );
}

#[test]
fn separate_engines_share_the_file_locks() {
    let project = TestProject::new();
    let first = project.engine();
    let second = project.engine();
    let task = first.create_task(NewTask::new("shared", "general")).unwrap();

    let a = {
        let engine = first.clone();
        let id = task.id.clone();
        thread::spawn(move || {
            for _ in 0..5 {
                engine.update_task(&id, &TaskUpdate::status(TaskStatus::Running)).unwrap();
            }
        })
    };
    let b = {
        let id = task.id.clone();
        thread::spawn(move || {
            for _ in 0..5 {
                second.update_task(&id, &TaskUpdate::status(TaskStatus::Paused)).unwrap();
            }
        })
    };
    a.join().unwrap();
    b.join().unwrap();

    first.clear_cache();
    assert_eq!(first.get_task(&task.id).unwrap().version, 11);
}

#[test]
fn contended_lock_times_out_without_writing() {
    let project = TestProject::new();
    let engine = project.engine();
    let task = engine.create_task(NewTask::new("alpha", "general")).unwrap();

    let busy = TaskPersistenceEngine::new(
        project
            .context(Config::default())
            .with_locks(Arc::new(BusyLocks)),
    );
    let err = busy
        .update_task(&task.id, &TaskUpdate::status(TaskStatus::Failed))
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));
    assert!(err.is_retryable());
    assert_eq!(err.exit_code(), 3);

    let err = busy.create_task(NewTask::new("beta", "general")).unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));

    let stored = engine.get_task(&task.id).unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(engine.list_tasks(&TaskFilter::default()).unwrap().len(), 1);
}

#[test]
fn deleted_task_is_hidden_but_kept_as_tombstone() {
    let project = TestProject::new();
    let engine = project.engine();
    let task = engine.create_task(NewTask::new("alpha", "general")).unwrap();
    engine.delete_task(&task.id).unwrap();

    assert!(matches!(engine.get_task(&task.id), Err(Error::NotFound { .. })));
    assert!(engine.task_exists(&task.id));
    assert!(engine.list_tasks(&TaskFilter::default()).unwrap().is_empty());
    let all = engine
        .list_tasks(&TaskFilter {
            include_deleted: true,
            ..TaskFilter::default()
        })
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].version, 2);
    assert!(matches!(
        engine.delete_task(&task.id),
        Err(Error::NotFound { .. })
    ));
}
