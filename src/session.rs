//! Session records.
//!
//! One session per running process. A session whose `lastActivity` is older
//! than the session timeout and that never recorded an end time is treated as
//! crashed on the next startup.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Ended,
}

/// How a recorded session looks from another process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionLiveness {
    Alive,
    Crashed,
    /// Crashed, and another session is recovering it now
    Recovering,
    Ended,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub version: String,
}

impl ProcessInfo {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()),
            command: std::env::args().next(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounters {
    pub tasks_processed: u64,
    pub transactions_committed: u64,
    pub errors: u64,
    pub total_operations: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
    pub process: ProcessInfo,
    #[serde(default)]
    pub counters: SessionCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Session that ran crash recovery for this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>, process: ProcessInfo) -> Self {
        Self {
            id: id.into(),
            start_time: now,
            end_time: None,
            last_activity: now,
            state: SessionState::Active,
            process,
            counters: SessionCounters::default(),
            model: None,
            recovered_by: None,
            recovered_at: None,
        }
    }

    /// Stale, unended and not already claimed by a live recoverer.
    pub fn is_crashed(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.end_time.is_none()
            && self.last_activity < now - timeout
            && !self.recovery_claimed(now, timeout)
    }

    /// A claim older than `timeout` is treated as abandoned.
    pub fn recovery_claimed(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.end_time.is_none() && matches!(self.recovered_at, Some(at) if at >= now - timeout)
    }

    pub fn liveness(&self, now: DateTime<Utc>, timeout: Duration) -> SessionLiveness {
        if self.end_time.is_some() {
            SessionLiveness::Ended
        } else if self.recovery_claimed(now, timeout) {
            SessionLiveness::Recovering
        } else if self.is_crashed(now, timeout) {
            SessionLiveness::Crashed
        } else {
            SessionLiveness::Alive
        }
    }

    /// Ended (or recovered) long enough ago that its file can go.
    pub fn is_expired(&self, now: DateTime<Utc>, cleanup_after: Duration) -> bool {
        match self.end_time {
            Some(end) => end < now - cleanup_after,
            None => false,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn end(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Ended;
        self.end_time = Some(now);
        self.last_activity = now;
    }

    /// Reserve recovery of this crashed session for `by`.
    pub fn claim_recovery(&mut self, by: &str, now: DateTime<Utc>) {
        self.recovered_by = Some(by.to_string());
        self.recovered_at = Some(now);
    }

    pub fn release_recovery_claim(&mut self) {
        self.recovered_by = None;
        self.recovered_at = None;
    }

    /// Close out a crashed session after another session recovered it.
    pub fn mark_recovered(&mut self, by: &str, now: DateTime<Utc>) {
        self.state = SessionState::Ended;
        self.end_time = Some(now);
        self.recovered_by = Some(by.to_string());
        self.recovered_at = Some(now);
    }
}
