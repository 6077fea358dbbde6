#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_cmd::Command;
use chrono::{DateTime, TimeZone, Utc};
use taskvault::clock::{ManualClock, SequentialIdGenerator};
use taskvault::config::{Config, CONFIG_FILE};
use taskvault::context::EngineContext;
use taskvault::error::{Error, Result};
use taskvault::lock::{LockGuard, LockProvider};
use taskvault::persistence::TaskPersistenceEngine;
use tempfile::TempDir;

/// A throwaway project directory with a deterministic clock and id source.
pub struct TestProject {
    dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub ids: Arc<SequentialIdGenerator>,
}

impl TestProject {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create tempdir"),
            clock: Arc::new(ManualClock::new(start_time())),
            ids: Arc::new(SequentialIdGenerator::new()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn context(&self, config: Config) -> EngineContext {
        EngineContext::new(self.path(), config)
            .with_clock(self.clock.clone())
            .with_ids(self.ids.clone())
    }

    pub fn engine(&self) -> TaskPersistenceEngine {
        let engine = TaskPersistenceEngine::new(self.context(Config::default()));
        engine.init().expect("init storage");
        engine
    }

    pub fn write_config(&self, contents: &str) -> std::io::Result<PathBuf> {
        let path = self.path().join(CONFIG_FILE);
        fs::write(&path, contents)?;
        Ok(path)
    }

    /// Overwrite a stored task file with arbitrary bytes.
    pub fn corrupt_task(&self, engine: &TaskPersistenceEngine, id: &str, contents: &str) {
        fs::write(engine.storage().task_file(id), contents).expect("corrupt task file");
    }

    /// Rewrite a stored task file, replacing `from` with `to` without resealing.
    pub fn tamper_task(&self, engine: &TaskPersistenceEngine, id: &str, from: &str, to: &str) {
        let path = engine.storage().task_file(id);
        let content = fs::read_to_string(&path).expect("read task file");
        assert!(content.contains(from), "task file does not contain {from}");
        fs::write(&path, content.replacen(from, to, 1)).expect("tamper task file");
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Lock provider that always reports contention.
#[derive(Debug, Default)]
pub struct BusyLocks;

impl LockProvider for BusyLocks {
    fn lock(&self, path: &Path, _timeout_ms: u64) -> Result<LockGuard> {
        Err(Error::LockTimeout(path.to_path_buf()))
    }
}

pub fn taskvault_cmd(project: &Path) -> Command {
    let mut cmd = Command::cargo_bin("taskvault").expect("taskvault binary");
    cmd.current_dir(project)
        .env_remove("TASKVAULT_PROJECT")
        .env_remove("RUST_LOG");
    cmd
}
