//! Configuration loading and management
//!
//! Handles parsing of `.taskvault.toml` configuration files.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name of the project-level configuration
pub const CONFIG_FILE: &str = ".taskvault.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model identifier reported by the orchestrator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Fixed session identifier (normally generated per process)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Session lifecycle configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Checkpoint configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Storage behaviour
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Task execution defaults
    #[serde(default)]
    pub task_management: TaskManagementConfig,

    /// Monitoring switches
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Session-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A session silent for longer than this without an end time is crashed
    #[serde(default = "default_session_timeout")]
    pub timeout: String,

    /// Period of the heartbeat that refreshes `last_activity`
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    /// Ended sessions older than this are removed at shutdown
    #[serde(default = "default_cleanup_after")]
    pub cleanup_after: String,
}

fn default_session_timeout() -> String {
    "5m".to_string()
}

fn default_heartbeat_interval() -> String {
    "30s".to_string()
}

fn default_cleanup_after() -> String {
    "7d".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: default_session_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            cleanup_after: default_cleanup_after(),
        }
    }
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Period of automatic checkpoints
    #[serde(default = "default_checkpoint_interval")]
    pub interval: String,

    /// Number of checkpoints retained (oldest pruned first)
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,

    /// Operations between automatic checkpoints (0 disables)
    #[serde(default = "default_operation_threshold")]
    pub operation_threshold: u64,
}

fn default_checkpoint_interval() -> String {
    "5m".to_string()
}

fn default_max_checkpoints() -> usize {
    10
}

fn default_operation_threshold() -> u64 {
    100
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: default_checkpoint_interval(),
            max_checkpoints: default_max_checkpoints(),
            operation_threshold: default_operation_threshold(),
        }
    }
}

/// How concurrent writes to the same task are reconciled on save
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Reject writes whose `updated_at` is older than the stored copy
    Timestamp,
    /// Reject writes whose `version` is older than the stored copy
    Version,
    /// Always accept the incoming write
    LastWriteWins,
}

/// Storage behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Maximum wait for a per-entity lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Entries kept in the read-through task cache
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_conflict_resolution")]
    pub conflict_resolution: ConflictResolution,

    #[serde(default)]
    pub performance_optimization: PerformanceConfig,
}

fn default_lock_timeout_ms() -> u64 {
    crate::lock::DEFAULT_LOCK_TIMEOUT_MS
}

fn default_cache_capacity() -> usize {
    256
}

fn default_conflict_resolution() -> ConflictResolution {
    ConflictResolution::Timestamp
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            cache_capacity: default_cache_capacity(),
            conflict_resolution: default_conflict_resolution(),
            performance_optimization: PerformanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Buffer saves and flush them in batches
    #[serde(default)]
    pub async_writes: bool,

    /// Buffered writes that trigger a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Entries kept in the cross-session prefetch cache
    #[serde(default = "default_prefetch_capacity")]
    pub prefetch_capacity: usize,
}

fn default_batch_size() -> usize {
    16
}

fn default_prefetch_capacity() -> usize {
    64
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            async_writes: false,
            batch_size: default_batch_size(),
            prefetch_capacity: default_prefetch_capacity(),
        }
    }
}

/// Task execution defaults (informational for the external scheduler)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagementConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_task_timeout")]
    pub default_timeout: String,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_task_timeout() -> String {
    "30m".to_string()
}

fn default_max_retries() -> u32 {
    3
}

impl Default for TaskManagementConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_timeout: default_task_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl Config {
    /// Load configuration from a `.taskvault.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the project root, or return defaults
    pub fn load_from_project(project_root: &Path) -> Self {
        let config_path = project_root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Self::default();
        }
        match Self::load(&config_path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(path = %config_path.display(), error = %err, "ignoring invalid config");
                Self::default()
            }
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        parse_duration(&self.session.timeout).unwrap_or_else(|_| Duration::minutes(5))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration(&self.session.heartbeat_interval).unwrap_or_else(|_| Duration::seconds(30))
    }

    pub fn cleanup_after(&self) -> Duration {
        parse_duration(&self.session.cleanup_after).unwrap_or_else(|_| Duration::days(7))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        parse_duration(&self.checkpoint.interval).unwrap_or_else(|_| Duration::minutes(5))
    }

    pub fn default_task_timeout(&self) -> Duration {
        parse_duration(&self.task_management.default_timeout)
            .unwrap_or_else(|_| Duration::minutes(30))
    }

    pub fn validate(&self) -> Result<()> {
        let timeout = positive_duration(&self.session.timeout, "session.timeout")?;
        let heartbeat =
            positive_duration(&self.session.heartbeat_interval, "session.heartbeat_interval")?;
        positive_duration(&self.session.cleanup_after, "session.cleanup_after")?;
        positive_duration(&self.checkpoint.interval, "checkpoint.interval")?;
        positive_duration(
            &self.task_management.default_timeout,
            "task_management.default_timeout",
        )?;

        if heartbeat >= timeout {
            return Err(Error::InvalidConfig(format!(
                "session.heartbeat_interval '{}' must be shorter than session.timeout '{}'",
                self.session.heartbeat_interval, self.session.timeout
            )));
        }
        if self.checkpoint.max_checkpoints == 0 {
            return Err(Error::InvalidConfig(
                "checkpoint.max_checkpoints must be > 0".to_string(),
            ));
        }
        if self.persistence.performance_optimization.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "persistence.performance_optimization.batch_size must be > 0".to_string(),
            ));
        }
        if self.persistence.lock_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "persistence.lock_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.task_management.max_concurrent_tasks == 0 {
            return Err(Error::InvalidConfig(
                "task_management.max_concurrent_tasks must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn positive_duration(raw: &str, field: &str) -> Result<Duration> {
    let duration = parse_duration(raw)
        .map_err(|err| Error::InvalidConfig(format!("{field}: {err}")))?;
    if duration <= Duration::zero() {
        return Err(Error::InvalidConfig(format!("{field} must be > 0")));
    }
    Ok(duration)
}

/// Parse a duration string like "30s", "5m", "2h", "7d" or "1w".
///
/// A bare number is read as minutes.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return Err(Error::Validation("duration cannot be empty".to_string()));
    }

    let (num_str, unit) = if let Some(pos) = s.find(|c: char| !c.is_ascii_digit()) {
        (&s[..pos], &s[pos..])
    } else {
        (s, "m")
    };

    let num: i64 = num_str
        .parse()
        .map_err(|_| Error::Validation(format!("invalid duration number: '{num_str}'")))?;

    let duration = match unit.trim().to_lowercase().as_str() {
        "ms" => Duration::milliseconds(num),
        "s" | "sec" | "second" | "seconds" => Duration::seconds(num),
        "m" | "min" | "minute" | "minutes" => Duration::minutes(num),
        "h" | "hr" | "hour" | "hours" => Duration::hours(num),
        "d" | "day" | "days" => Duration::days(num),
        "w" | "week" | "weeks" => Duration::weeks(num),
        _ => {
            return Err(Error::Validation(format!(
                "invalid duration unit '{unit}'. Expected: ms, s, m, h, d, w"
            )));
        }
    };

    Ok(duration)
}

/// Read-only settings lookup consumed by the engines.
pub trait ConfigProvider: Send + Sync {
    fn model(&self) -> Option<String>;

    fn session_id(&self) -> Option<String>;

    /// Look up a setting by dotted key, e.g. `taskManagement.maxRetries`.
    fn setting(&self, key: &str) -> Option<toml::Value>;
}

impl ConfigProvider for Config {
    fn model(&self) -> Option<String> {
        self.model.clone()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn setting(&self, key: &str) -> Option<toml::Value> {
        let root = toml::Value::try_from(self).ok()?;
        let mut current = &root;
        for segment in key.split('.') {
            let table = current.as_table()?;
            current = table.get(segment).or_else(|| table.get(&to_snake_case(segment)))?;
        }
        Some(current.clone())
    }
}

fn to_snake_case(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() + 4);
    for ch in segment.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
