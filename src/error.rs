//! Error types for taskvault
//!
//! Exit codes:
//! - 0: Success
//! - 2: Caller error (validation, missing entity, bad config)
//! - 3: Contention (lock timeout, write conflict) - the caller may retry
//! - 4: Data or operation failure (integrity, cycles, recovery, I/O)

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Exit codes for the taskvault CLI
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const CONTENTION: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for taskvault operations
#[derive(Error, Debug)]
pub enum Error {
    // Caller errors (exit code 2)
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Contention (exit code 3)
    #[error("Lock acquisition timed out: {0}")]
    LockTimeout(PathBuf),

    #[error("Write conflict on task {task_id}: incoming {incoming} is older than stored {stored}")]
    WriteConflict {
        task_id: String,
        incoming: DateTime<Utc>,
        stored: DateTime<Utc>,
    },

    // Data and operation failures (exit code 4)
    #[error("Integrity check failed for {subject}: {detail}")]
    Integrity { subject: String, detail: String },

    #[error("Unresolvable dependency cycle: {}", format_cycles(.0))]
    Cycle(Vec<Vec<String>>),

    #[error("All recovery strategies failed: {}", .0.join("; "))]
    RecoveryExhausted(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Operation failed: {0}")]
    OperationFailed(String),
}

impl Error {
    pub fn task_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            entity: "task",
            id: id.into(),
        }
    }

    pub fn integrity(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Integrity {
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Validation(_) | Error::NotFound { .. } | Error::InvalidConfig(_) => {
                exit_codes::USER_ERROR
            }

            Error::LockTimeout(_) | Error::WriteConflict { .. } => exit_codes::CONTENTION,

            Error::Integrity { .. }
            | Error::Cycle(_)
            | Error::RecoveryExhausted(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::TomlSerialize(_)
            | Error::OperationFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Stable machine-readable name for the error class
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound { .. } => "not_found",
            Error::InvalidConfig(_) => "invalid_config",
            Error::LockTimeout(_) => "lock_timeout",
            Error::WriteConflict { .. } => "write_conflict",
            Error::Integrity { .. } => "integrity",
            Error::Cycle(_) => "cycle",
            Error::RecoveryExhausted(_) => "recovery_exhausted",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::TomlParse(_) | Error::TomlSerialize(_) => "toml",
            Error::OperationFailed(_) => "operation_failed",
        }
    }

    /// Whether retrying the same call may succeed without other changes
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockTimeout(_))
    }

    /// Structured details for JSON error output
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Error::NotFound { entity, id } => Some(serde_json::json!({
                "entity": entity,
                "id": id,
            })),
            Error::WriteConflict {
                task_id,
                incoming,
                stored,
            } => Some(serde_json::json!({
                "task_id": task_id,
                "incoming": incoming,
                "stored": stored,
            })),
            Error::Cycle(cycles) => Some(serde_json::json!({ "cycles": cycles })),
            Error::RecoveryExhausted(attempts) => {
                Some(serde_json::json!({ "attempts": attempts }))
            }
            _ => None,
        }
    }
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| cycle.join(" -> "))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for taskvault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for displaying errors in JSON format
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
            kind: err.kind(),
            details: err.details(),
        }
    }
}
