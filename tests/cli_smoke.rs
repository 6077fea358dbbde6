mod support;

use std::fs;

use predicates::str::contains;
use serde_json::Value;
use taskvault::task::{DependencyRef, NewTask};

use support::{taskvault_cmd, TestProject};

fn json_stdout(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is a JSON envelope")
}

fn run_json(project: &TestProject, args: &[&str]) -> Value {
    let output = taskvault_cmd(project.path())
        .args(args)
        .arg("--json")
        .output()
        .expect("run taskvault");
    assert!(
        output.status.success(),
        "taskvault {args:?} failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    let envelope = json_stdout(&output);
    assert_eq!(envelope["schema_version"], "taskvault.v1");
    assert_eq!(envelope["status"], "success");
    envelope
}

#[test]
fn help_works() {
    let project = TestProject::new();
    taskvault_cmd(project.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("durable task state"));

    for cmd in [
        "init",
        "status",
        "checkpoint",
        "restore",
        "recover",
        "resume",
        "plan",
        "ready",
    ] {
        taskvault_cmd(project.path())
            .arg(cmd)
            .arg("--help")
            .assert()
            .success();
    }
}

#[test]
fn init_then_status_reports_a_healthy_store() {
    let project = TestProject::new();
    let init = run_json(&project, &["init"]);
    assert_eq!(init["command"], "init");
    assert_eq!(init["data"]["created"]["config"], true);
    assert!(project.path().join(".taskvault.toml").is_file());

    let again = run_json(&project, &["init"]);
    assert_eq!(again["data"]["created"]["config"], false);
    assert_eq!(again["data"]["created"]["state_dir"], false);

    let status = run_json(&project, &["status"]);
    assert_eq!(status["command"], "status");
    assert_eq!(status["data"]["initialized"], true);
    assert_eq!(status["data"]["healthy"], true);
    assert_eq!(status["data"]["tasks"]["live"], 0);
}

#[test]
fn checkpoint_list_and_restore() {
    let project = TestProject::new();
    run_json(&project, &["init"]);
    let engine = project.engine();
    let kept = engine.create_task(NewTask::new("kept", "general")).unwrap();

    let created = run_json(&project, &["checkpoint"]);
    let checkpoint_id = created["data"]["checkpointId"]
        .as_str()
        .expect("checkpoint id")
        .to_string();

    let listed = run_json(&project, &["checkpoint", "--list"]);
    let summaries = listed["data"].as_array().expect("checkpoint list");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0]["id"], checkpoint_id.as_str());
    assert_eq!(summaries[0]["taskCount"], 1);
    assert_eq!(summaries[0]["valid"], true);

    let extra = engine.create_task(NewTask::new("extra", "general")).unwrap();
    let restored = run_json(&project, &["restore", &checkpoint_id]);
    assert_eq!(restored["data"]["restored"], 1);
    assert_eq!(restored["data"]["tombstoned"], 1);

    engine.clear_cache();
    assert_eq!(engine.get_task(&kept.id).unwrap().title, "kept");
    assert!(engine.get_task(&extra.id).is_err());
}

#[test]
fn restoring_unknown_checkpoint_is_a_user_error() {
    let project = TestProject::new();
    run_json(&project, &["init"]);

    let output = taskvault_cmd(project.path())
        .args(["restore", "cp-missing", "--json"])
        .output()
        .expect("run taskvault");
    assert_eq!(output.status.code(), Some(2));
    let envelope = json_stdout(&output);
    assert_eq!(envelope["status"], "error");
    assert_eq!(envelope["command"], "restore");
    assert_eq!(envelope["error"]["kind"], "not_found");
    assert_eq!(envelope["error"]["code"], 2);
}

#[test]
fn recover_rebuilds_a_corrupted_task() {
    let project = TestProject::new();
    run_json(&project, &["init"]);
    let engine = project.engine();
    let task = engine.create_task(NewTask::new("alpha", "general")).unwrap();
    project.corrupt_task(&engine, &task.id, "{ \"title\": ");

    let status = run_json(&project, &["status"]);
    assert_eq!(status["data"]["healthy"], false);

    let report = run_json(&project, &["recover"]);
    assert_eq!(report["data"]["strategy"], "warm");
    assert_eq!(report["data"]["restored"][0], task.id.as_str());

    engine.clear_cache();
    assert_eq!(engine.get_task(&task.id).unwrap().title, "alpha");

    taskvault_cmd(project.path())
        .args(["recover", "--strategy", "lukewarm"])
        .assert()
        .code(2);
}

#[test]
fn plan_and_ready_follow_dependencies() {
    let project = TestProject::new();
    run_json(&project, &["init"]);
    let engine = project.engine();
    let first = engine.create_task(NewTask::new("first", "general")).unwrap();
    let second = engine
        .create_task(NewTask {
            dependencies: vec![DependencyRef::hard(first.id.clone())],
            ..NewTask::new("second", "general")
        })
        .unwrap();

    let plan = run_json(&project, &["plan"]);
    assert_eq!(
        plan["data"]["order"],
        serde_json::json!([first.id.as_str(), second.id.as_str()])
    );
    assert_eq!(plan["data"]["parallelGroups"].as_array().unwrap().len(), 2);

    let ready = run_json(&project, &["ready"]);
    let ready = ready["data"].as_array().expect("ready list");
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0]["id"], first.id.as_str());
}

#[test]
fn events_flag_writes_json_lines() {
    let project = TestProject::new();
    run_json(&project, &["init"]);

    taskvault_cmd(project.path())
        .args(["--events", "events.jsonl", "checkpoint"])
        .assert()
        .success();

    let events = fs::read_to_string(project.path().join("events.jsonl")).unwrap();
    let kinds: Vec<String> = events
        .lines()
        .map(|line| {
            let event: Value = serde_json::from_str(line).unwrap();
            event["event"].as_str().unwrap().to_string()
        })
        .collect();
    assert!(kinds.contains(&"session-started".to_string()));
    assert!(kinds.contains(&"checkpoint-created".to_string()));
}
