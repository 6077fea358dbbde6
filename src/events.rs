//! Lifecycle events.
//!
//! Engines publish typed events on an [`EventBus`]; listeners run
//! synchronously, in registration order, on the publishing thread. An
//! [`EventSink`] can be subscribed to mirror events as JSON lines to stdout
//! or a file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

pub const EVENT_SCHEMA_VERSION: &str = "taskvault.event.v1";

#[derive(Debug, Clone)]
pub enum EventDestination {
    Stdout,
    File(PathBuf),
}

impl EventDestination {
    pub fn parse(raw: Option<&str>) -> Option<Self> {
        raw.and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed == "-" {
                return Some(EventDestination::Stdout);
            }
            Some(EventDestination::File(PathBuf::from(trimmed)))
        })
    }

    pub fn open(&self) -> Result<EventSink> {
        match self {
            EventDestination::Stdout => Ok(EventSink::stdout()),
            EventDestination::File(path) => EventSink::file(path),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    SessionStarted,
    TaskSaved,
    TaskLoaded,
    ConflictDetected,
    CheckpointCreated,
    CheckpointRestored,
    CrashRecoveryStarted,
    CrashRecoveryCompleted,
    EmergencyCheckpoint,
    RecoveryCompleted,
    CrossSessionShutdown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SessionStarted => "session-started",
            EventKind::TaskSaved => "task-saved",
            EventKind::TaskLoaded => "task-loaded",
            EventKind::ConflictDetected => "conflict-detected",
            EventKind::CheckpointCreated => "checkpoint-created",
            EventKind::CheckpointRestored => "checkpoint-restored",
            EventKind::CrashRecoveryStarted => "crash-recovery-started",
            EventKind::CrashRecoveryCompleted => "crash-recovery-completed",
            EventKind::EmergencyCheckpoint => "emergency-checkpoint",
            EventKind::RecoveryCompleted => "recovery-completed",
            EventKind::CrossSessionShutdown => "cross-session-shutdown",
        }
    }
}

/// A structured event with optional payload.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub schema_version: &'static str,
    pub event: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    pub fn new(event: EventKind, timestamp: DateTime<Utc>, session_id: Option<String>) -> Self {
        Self {
            schema_version: EVENT_SCHEMA_VERSION,
            event,
            timestamp,
            session_id,
            data: None,
        }
    }

    /// Attach a serializable payload to the event.
    pub fn with_data<T: Serialize>(mut self, data: T) -> Result<Self> {
        self.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: u64,
    kind: Option<EventKind>,
    listener: Listener,
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Synchronous publish-subscribe hub.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<RwLock<BusState>>,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .inner
            .read()
            .map(|state| state.subscriptions.len())
            .unwrap_or(0);
        f.debug_struct("EventBus").field("subscriptions", &count).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for one kind of event, or every event when `kind` is `None`.
    pub fn subscribe<F>(&self, kind: Option<EventKind>, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        state.next_id += 1;
        let id = state.next_id;
        state.subscriptions.push(Subscription {
            id,
            kind,
            listener: Arc::new(listener),
        });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let before = state.subscriptions.len();
        state.subscriptions.retain(|sub| sub.id != id.0);
        state.subscriptions.len() != before
    }

    /// Mirror every event into `sink`; write failures are logged.
    pub fn attach_sink(&self, sink: EventSink) -> SubscriptionId {
        let sink = Mutex::new(sink);
        self.subscribe(None, move |event| {
            let mut sink = sink.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(err) = sink.emit(event) {
                tracing::warn!(error = %err, "failed to write event");
            }
        })
    }

    /// Invoke matching listeners in registration order.
    pub fn publish(&self, event: &Event) {
        // Clone the listener list so listeners may subscribe without deadlocking.
        let listeners: Vec<Listener> = {
            let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
            state
                .subscriptions
                .iter()
                .filter(|sub| sub.kind.is_none() || sub.kind == Some(event.event))
                .map(|sub| sub.listener.clone())
                .collect()
        };
        tracing::debug!(event = event.event.as_str(), listeners = listeners.len(), "publishing event");
        for listener in listeners {
            listener(event);
        }
    }
}

/// Event sink that writes JSONL output to a destination.
pub struct EventSink {
    writer: Box<dyn Write + Send>,
}

impl EventSink {
    /// Emit events to stdout.
    pub fn stdout() -> Self {
        Self {
            writer: Box::new(std::io::stdout()),
        }
    }

    /// Emit events to a file, creating it if necessary.
    pub fn file(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Box::new(file),
        })
    }

    /// Write a single event as JSONL.
    pub fn emit(&mut self, event: &Event) -> Result<()> {
        let serialized = serde_json::to_vec(event)?;
        self.writer.write_all(&serialized)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(kind: EventKind) -> Event {
        Event::new(kind, Utc.timestamp_opt(0, 0).unwrap(), Some("s1".to_string()))
    }

    #[test]
    fn listeners_filter_by_kind_and_run_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let all = seen.clone();
        bus.subscribe(None, move |e| all.lock().unwrap().push(format!("all:{}", e.event.as_str())));
        let saved = seen.clone();
        bus.subscribe(Some(EventKind::TaskSaved), move |_| {
            saved.lock().unwrap().push("saved".to_string())
        });

        bus.publish(&event(EventKind::TaskSaved));
        bus.publish(&event(EventKind::CheckpointCreated));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["all:task-saved", "saved", "all:checkpoint-created"]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        let id = bus.subscribe(None, move |_| *counter.lock().unwrap() += 1);
        bus.publish(&event(EventKind::TaskLoaded));
        assert!(bus.unsubscribe(id));
        bus.publish(&event(EventKind::TaskLoaded));
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn sink_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let bus = EventBus::new();
        bus.attach_sink(EventSink::file(&path).unwrap());
        bus.publish(&event(EventKind::EmergencyCheckpoint).with_data(serde_json::json!({"reason": "x"})).unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(line["event"], "emergency-checkpoint");
        assert_eq!(line["schema_version"], EVENT_SCHEMA_VERSION);
        assert_eq!(line["data"]["reason"], "x");
    }
}
