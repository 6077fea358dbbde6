//! taskvault - crash-safe task persistence for agentic task runners
//!
//! This library stores orchestration tasks as JSON documents on disk, keeps
//! them consistent across concurrent writers and process crashes, and orders
//! them for execution by their dependencies.
//!
//! # Core Concepts
//!
//! - **Tasks**: checksummed JSON documents with a monotonically increasing version
//! - **Sessions**: one per process, heartbeating so crashes can be detected
//! - **Checkpoints**: hashed snapshots of every task, restorable later
//! - **Recovery**: hot/warm/cold/emergency strategies for rebuilding state
//! - **Dependencies**: graph analysis, cycle resolution and execution planning
//!
//! # Module Organization
//!
//! - `cli`: Command-line interface using clap
//! - `config`: Configuration loading from `.taskvault.toml`
//! - `error`: Error types and result aliases
//! - `clock`: Injectable time and id sources
//! - `lock`: File locking and atomic writes for concurrency safety
//! - `storage`: Directory layout and JSON/JSONL file helpers
//! - `task`: Task data model, filters and normalization
//! - `integrity`: Canonical JSON hashing
//! - `dependency`: Dependency graph analysis and execution planning
//! - `txlog`: Append-only transaction log
//! - `persistence`: Task and session storage engine
//! - `session`: Session records and crash classification
//! - `checkpoint`: Checkpoint snapshots and their store
//! - `events`: Lifecycle event bus and JSONL sinks
//! - `context`: Collaborators shared by the engines
//! - `cross_session`: Session lifecycle, conflict detection and timers
//! - `recovery`: Recovery strategies, validation and repair

pub mod checkpoint;
pub mod cli;
pub mod clock;
pub mod config;
pub mod context;
pub mod cross_session;
pub mod dependency;
pub mod error;
pub mod events;
pub mod integrity;
pub mod lock;
pub mod output;
pub mod persistence;
pub mod recovery;
pub mod session;
pub mod storage;
pub mod task;
pub mod txlog;

pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointStore};
pub use context::EngineContext;
pub use cross_session::CrossSessionEngine;
pub use dependency::DependencyResolver;
pub use error::{Error, Result};
pub use persistence::TaskPersistenceEngine;
pub use recovery::{RecoveryStrategy, TaskRecoveryManager};
pub use task::{NewTask, Task, TaskStatus};
