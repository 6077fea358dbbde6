//! Collaborators shared by the engines.
//!
//! Production code uses [`EngineContext::for_project`]; tests swap in a
//! manual clock, sequential ids or a contended lock provider with the
//! `with_*` builders.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::clock::{Clock, IdGenerator, SystemClock, UlidIdGenerator};
use crate::config::{Config, ConfigProvider};
use crate::lock::{FsLockProvider, LockProvider};
use crate::storage::Storage;

#[derive(Clone)]
pub struct EngineContext {
    pub storage: Storage,
    pub config: Arc<Config>,
    /// Read-only settings lookup; defaults to `config` itself
    pub settings: Arc<dyn ConfigProvider>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub locks: Arc<dyn LockProvider>,
}

impl EngineContext {
    pub fn new(project_root: impl AsRef<Path>, config: Config) -> Self {
        let config = Arc::new(config);
        Self {
            storage: Storage::new(project_root.as_ref()),
            settings: config.clone(),
            config,
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidIdGenerator),
            locks: Arc::new(FsLockProvider),
        }
    }

    /// Context for a project, reading `.taskvault.toml` when present.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref();
        Self::new(root, Config::load_from_project(root))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_settings(mut self, settings: Arc<dyn ConfigProvider>) -> Self {
        self.settings = settings;
        self
    }

    pub fn lock_timeout_ms(&self) -> u64 {
        self.config.persistence.lock_timeout_ms
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("root", &self.storage.root())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
