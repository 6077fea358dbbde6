//! Field-level salvage and repair of damaged task records.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::clock::{IdGenerator, IdKind};
use crate::error::Result;
use crate::task::{
    DependencyRef, ExecutionContext, Task, TaskCategory, TaskMetadata, TaskPriority, TaskStatus,
};

/// Whatever could be read of a task; every field may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFragment {
    pub id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub category: Option<TaskCategory>,
    pub dependencies: Option<Vec<DependencyRef>>,
    pub metadata: Option<TaskMetadata>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub tags: Option<Vec<String>>,
    pub execution_context: Option<ExecutionContext>,
    pub version: Option<u64>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TaskFragment {
    /// Salvage each field of a JSON object independently.
    pub fn from_value(value: &Value) -> Self {
        let meta = value.get("metadata");
        Self {
            id: field(value, "id").filter(|id: &String| !id.trim().is_empty()),
            title: field(value, "title"),
            description: field(value, "description"),
            status: field(value, "status"),
            priority: field(value, "priority"),
            category: field(value, "category"),
            dependencies: field(value, "dependencies"),
            metadata: field(value, "metadata"),
            created_at: meta.and_then(|m| field(m, "createdAt")),
            updated_at: meta.and_then(|m| field(m, "updatedAt")),
            tags: meta.and_then(|m| field(m, "tags")),
            execution_context: field(value, "executionContext"),
            version: field(value, "version"),
            deleted_at: field(value, "deletedAt"),
        }
    }

    /// Salvage a task file's contents; the file name supplies a fallback id.
    pub fn from_file_contents(path: &Path, content: &str) -> Self {
        let mut fragment = match serde_json::from_str::<Value>(content) {
            Ok(value) => Self::from_value(&value),
            Err(_) => Self::default(),
        };
        if fragment.id.is_none() {
            fragment.id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
                .filter(|stem| !stem.is_empty());
        }
        fragment
    }

    pub fn from_task(task: &Task) -> Self {
        Self {
            id: Some(task.id.clone()),
            title: Some(task.title.clone()),
            description: Some(task.description.clone()),
            status: Some(task.status),
            priority: Some(task.priority),
            category: Some(task.category),
            dependencies: Some(task.dependencies.clone()),
            metadata: Some(task.metadata.clone()),
            created_at: Some(task.metadata.created_at),
            updated_at: Some(task.metadata.updated_at),
            tags: Some(task.metadata.tags.clone()),
            execution_context: Some(task.execution_context.clone()),
            version: Some(task.version),
            deleted_at: task.deleted_at,
        }
    }

    /// True when nothing beyond a possible id was salvaged.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.metadata.is_none()
            && self.created_at.is_none()
            && self.dependencies.is_none()
            && self.execution_context.is_none()
    }
}

fn field<T: DeserializeOwned>(value: &Value, key: &str) -> Option<T> {
    value
        .get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// A repaired task and what was done to it.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub task: Task,
    pub actions: Vec<String>,
}

/// Fill missing fields, stamp the task as recovered and reseal it.
pub fn repair_task(
    fragment: TaskFragment,
    ids: &dyn IdGenerator,
    now: DateTime<Utc>,
) -> Result<RepairOutcome> {
    let mut actions = Vec::new();

    let id = match fragment.id {
        Some(id) => id,
        None => {
            let id = ids.generate(IdKind::Task);
            actions.push(format!("assigned new id {id}"));
            id
        }
    };

    let title = match fragment.title.filter(|t| !t.trim().is_empty()) {
        Some(title) => title,
        None => {
            actions.push("restored missing title".to_string());
            format!("Recovered task {id}")
        }
    };

    let metadata = match fragment.metadata {
        Some(metadata) => metadata,
        None => {
            actions.push("initialized metadata".to_string());
            let created = fragment.created_at.unwrap_or(now);
            let mut metadata = TaskMetadata::new(created);
            metadata.updated_at = fragment.updated_at.unwrap_or(now).max(created);
            if fragment.created_at.is_none() {
                actions.push("set missing timestamps".to_string());
            }
            metadata.tags = fragment.tags.unwrap_or_default();
            metadata
        }
    };

    let mut task = Task::new(id, title, metadata.created_at);
    task.metadata = metadata;
    task.description = fragment.description.unwrap_or_default();
    task.status = match fragment.status {
        Some(status) => status,
        None => {
            actions.push("set missing status to recovered".to_string());
            TaskStatus::Recovered
        }
    };
    task.priority = fragment.priority.unwrap_or_else(|| {
        actions.push("defaulted priority".to_string());
        TaskPriority::default()
    });
    task.category = fragment.category.unwrap_or_else(|| {
        actions.push("defaulted category".to_string());
        TaskCategory::default()
    });
    task.dependencies = fragment.dependencies.unwrap_or_default();
    task.execution_context = fragment.execution_context.unwrap_or_else(|| {
        actions.push("defaulted execution context".to_string());
        ExecutionContext::default()
    });
    task.version = match fragment.version {
        Some(version) if version > 0 => version,
        _ => {
            actions.push("reset version".to_string());
            1
        }
    };
    task.deleted_at = fragment.deleted_at;

    if task.metadata.updated_at < task.metadata.created_at {
        task.metadata.updated_at = task.metadata.created_at;
        actions.push("reordered timestamps".to_string());
    }

    actions.push("recomputed checksum".to_string());
    task.metadata.recovered = true;
    task.metadata.recovered_at = Some(now);
    task.metadata.repair_actions.extend(actions.iter().cloned());
    task.seal()?;

    Ok(RepairOutcome { task, actions })
}
