//! Task data model.
//!
//! Tasks are stored one JSON document per task under `.gemini-tasks/tasks/`.
//! Field names on disk are camelCase. Every accepted mutation bumps
//! `version` and refreshes `metadata.updatedAt`; deletion leaves a tombstone.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::integrity;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    #[serde(alias = "ready")]
    Queued,
    #[serde(alias = "in_progress")]
    Running,
    Paused,
    Completed,
    Failed,
    Blocked,
    Archived,
    Recovered,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Blocked,
        TaskStatus::Archived,
        TaskStatus::Recovered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Archived => "archived",
            TaskStatus::Recovered => "recovered",
        }
    }

    /// Statuses a prior session's task can be handed back to the scheduler in.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Running | TaskStatus::Paused
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Archived
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "ready" => return Ok(TaskStatus::Queued),
            "in_progress" | "in-progress" => return Ok(TaskStatus::Running),
            _ => {}
        }
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| Error::Validation(format!("unknown task status '{}'", raw.trim())))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

impl FromStr for TaskPriority {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" | "normal" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            "" => Err(Error::Validation("priority cannot be empty".to_string())),
            other => Err(Error::Validation(format!(
                "unknown task priority '{other}' (expected low|medium|high|critical)"
            ))),
        }
    }
}

/// Closed set of task categories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Implementation,
    Testing,
    Documentation,
    Analysis,
    Refactoring,
    Deployment,
    Maintenance,
    Research,
    General,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 9] = [
        TaskCategory::Implementation,
        TaskCategory::Testing,
        TaskCategory::Documentation,
        TaskCategory::Analysis,
        TaskCategory::Refactoring,
        TaskCategory::Deployment,
        TaskCategory::Maintenance,
        TaskCategory::Research,
        TaskCategory::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskCategory::Implementation => "implementation",
            TaskCategory::Testing => "testing",
            TaskCategory::Documentation => "documentation",
            TaskCategory::Analysis => "analysis",
            TaskCategory::Refactoring => "refactoring",
            TaskCategory::Deployment => "deployment",
            TaskCategory::Maintenance => "maintenance",
            TaskCategory::Research => "research",
            TaskCategory::General => "general",
        }
    }
}

impl Default for TaskCategory {
    fn default() -> Self {
        TaskCategory::General
    }
}

impl FromStr for TaskCategory {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(Error::Validation("category cannot be empty".to_string()));
        }
        TaskCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
            .ok_or_else(|| {
                let allowed: Vec<&str> = TaskCategory::ALL.iter().map(|c| c.as_str()).collect();
                Error::Validation(format!(
                    "unknown task category '{}' (expected one of: {})",
                    raw.trim(),
                    allowed.join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// Blocking: the prerequisite must complete first
    #[default]
    Hard,
    /// Advisory: may be dropped to break a cycle
    Soft,
}

/// A dependency as recorded on the dependent task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRef {
    pub task_id: String,
    #[serde(rename = "type", default)]
    pub kind: DependencyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub parallelizable: bool,
}

impl DependencyRef {
    pub fn hard(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            kind: DependencyType::Hard,
            reason: None,
            parallelizable: false,
        }
    }

    pub fn soft(task_id: impl Into<String>) -> Self {
        Self {
            kind: DependencyType::Soft,
            ..Self::hard(task_id)
        }
    }
}

/// Directed edge: `dependent_task_id` depends on `depends_on_task_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDependency {
    pub dependent_task_id: String,
    pub depends_on_task_id: String,
    #[serde(rename = "type", default)]
    pub kind: DependencyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub parallelizable: bool,
}

impl TaskDependency {
    pub fn new(
        dependent: impl Into<String>,
        depends_on: impl Into<String>,
        kind: DependencyType,
    ) -> Self {
        Self {
            dependent_task_id: dependent.into(),
            depends_on_task_id: depends_on.into(),
            kind,
            reason: None,
            parallelizable: false,
        }
    }

    pub fn hard(dependent: impl Into<String>, depends_on: impl Into<String>) -> Self {
        Self::new(dependent, depends_on, DependencyType::Hard)
    }

    pub fn soft(dependent: impl Into<String>, depends_on: impl Into<String>) -> Self {
        Self::new(dependent, depends_on, DependencyType::Soft)
    }

    /// Edge identity used for deduplication.
    pub fn key(&self) -> (&str, &str) {
        (&self.dependent_task_id, &self.depends_on_task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recovered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repair_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl TaskMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            created_by: None,
            estimated_duration_secs: None,
            tags: Vec::new(),
            retry_count: 0,
            session_id: None,
            custom: BTreeMap::new(),
            recovered: false,
            recovered_at: None,
            repair_actions: Vec::new(),
            checksum: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Units of each named resource the task needs while running
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            max_retries: 3,
            resources: BTreeMap::new(),
            working_directory: None,
            environment: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub category: TaskCategory,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRef>,
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub execution_context: ExecutionContext,
    #[serde(default = "initial_version")]
    pub version: u64,
    /// Tombstone marker; set when the task is deleted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

fn initial_version() -> u64 {
    1
}

impl Task {
    /// A bare pending task, mostly useful for planning and tests.
    pub fn new(id: impl Into<String>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: TaskPriority::default(),
            category: TaskCategory::default(),
            dependencies: Vec::new(),
            metadata: TaskMetadata::new(now),
            execution_context: ExecutionContext::default(),
            version: initial_version(),
            deleted_at: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_dependency(mut self, dependency: DependencyRef) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_estimate_secs(mut self, secs: u64) -> Self {
        self.metadata.estimated_duration_secs = Some(secs);
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn estimated_duration_secs(&self) -> u64 {
        self.metadata.estimated_duration_secs.unwrap_or(0)
    }

    /// Outgoing edges of this task in graph form.
    pub fn dependency_edges(&self) -> Vec<TaskDependency> {
        self.dependencies
            .iter()
            .map(|dep| TaskDependency {
                dependent_task_id: self.id.clone(),
                depends_on_task_id: dep.task_id.clone(),
                kind: dep.kind,
                reason: dep.reason.clone(),
                parallelizable: dep.parallelizable,
            })
            .collect()
    }

    /// Checksum over the record with the checksum field itself cleared.
    pub fn compute_checksum(&self) -> Result<String> {
        let mut unsealed = self.clone();
        unsealed.metadata.checksum = None;
        integrity::hash_canonical(&unsealed)
    }

    /// Recompute and store the checksum.
    pub fn seal(&mut self) -> Result<()> {
        self.metadata.checksum = Some(self.compute_checksum()?);
        Ok(())
    }

    /// `None` when the record carries no checksum.
    pub fn checksum_matches(&self) -> Result<Option<bool>> {
        match self.metadata.checksum.as_deref() {
            Some(stored) => Ok(Some(stored == self.compute_checksum()?)),
            None => Ok(None),
        }
    }

    /// Bump the version and refresh `updatedAt`.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.metadata.updated_at = now;
    }
}

/// Every edge declared across `tasks`.
pub fn collect_dependencies(tasks: &[Task]) -> Vec<TaskDependency> {
    tasks.iter().flat_map(Task::dependency_edges).collect()
}

/// Input for creating a task. Strings are normalized and validated on create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    #[serde(default)]
    pub custom: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub resources: BTreeMap<String, u32>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            category: category.into(),
            ..Self::default()
        }
    }

    pub fn depends_on(mut self, dependency: DependencyRef) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// Partial update merged into an existing task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub dependencies: Option<Vec<DependencyRef>>,
    #[serde(default)]
    pub custom: Option<BTreeMap<String, serde_json::Value>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Merge the provided fields into `task`. Does not touch version/timestamps.
    pub fn apply(&self, task: &mut Task) -> Result<()> {
        if let Some(title) = &self.title {
            task.title = normalize_title(title)?;
        }
        if let Some(description) = &self.description {
            task.description = description.trim().to_string();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(priority) = &self.priority {
            task.priority = priority.parse()?;
        }
        if let Some(category) = &self.category {
            task.category = category.parse()?;
        }
        if let Some(tags) = &self.tags {
            task.metadata.tags = normalize_tags(tags);
        }
        if let Some(estimate) = self.estimated_duration_secs {
            task.metadata.estimated_duration_secs = Some(estimate);
        }
        if let Some(retry_count) = self.retry_count {
            task.metadata.retry_count = retry_count;
        }
        if let Some(dependencies) = &self.dependencies {
            validate_dependencies(&task.id, dependencies)?;
            task.dependencies = dependencies.clone();
        }
        if let Some(custom) = &self.custom {
            for (key, value) in sanitize_custom(custom) {
                task.metadata.custom.insert(key, value);
            }
        }
        Ok(())
    }
}

/// Field a task listing is ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSortKey {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
    Title,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub category: Option<TaskCategory>,
    pub session_id: Option<String>,
    pub tag: Option<String>,
    pub include_deleted: bool,
    pub sort: TaskSortKey,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if task.is_deleted() && !self.include_deleted {
            return false;
        }
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(category) = self.category {
            if task.category != category {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if task.metadata.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            let tag = tag.trim().to_lowercase();
            if !task.metadata.tags.iter().any(|t| *t == tag) {
                return false;
            }
        }
        true
    }
}

/// Sort deterministically; the task id breaks every tie.
pub fn sort_tasks(tasks: &mut [Task], key: TaskSortKey, descending: bool) {
    tasks.sort_by(|left, right| {
        let primary = match key {
            TaskSortKey::CreatedAt => left.metadata.created_at.cmp(&right.metadata.created_at),
            TaskSortKey::UpdatedAt => left.metadata.updated_at.cmp(&right.metadata.updated_at),
            // Critical sorts first in ascending order.
            TaskSortKey::Priority => right.priority.cmp(&left.priority),
            TaskSortKey::Title => left
                .title
                .to_lowercase()
                .cmp(&right.title.to_lowercase()),
        };
        let primary = if descending { primary.reverse() } else { primary };
        primary.then_with(|| left.id.cmp(&right.id))
    });
}

pub fn normalize_title(title: &str) -> Result<String> {
    let collapsed = strip_markup(title)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.is_empty() {
        return Err(Error::Validation("title cannot be empty".to_string()));
    }
    Ok(collapsed)
}

/// Trimmed, lowercased, deduplicated, empties dropped; first occurrence wins.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(|tag| strip_markup(tag).trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .filter(|tag| seen.insert(tag.clone()))
        .collect()
}

/// Remove `<...>` markup from free-form text.
pub fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut depth = 0usize;
    for ch in input.chars() {
        match ch {
            '<' => depth += 1,
            '>' if depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Strip markup from every string nested in custom fields.
pub fn sanitize_custom(
    custom: &BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, serde_json::Value> {
    custom
        .iter()
        .map(|(key, value)| (key.trim().to_string(), sanitize_value(value)))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

fn sanitize_value(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(strip_markup(s).trim().to_string()),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn validate_dependencies(task_id: &str, dependencies: &[DependencyRef]) -> Result<()> {
    for dep in dependencies {
        if dep.task_id.trim().is_empty() {
            return Err(Error::Validation(format!(
                "task {task_id} has a dependency with an empty task id"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn status_parsing_accepts_aliases() {
        assert_eq!("READY".parse::<TaskStatus>().unwrap(), TaskStatus::Queued);
        assert_eq!(
            " in_progress ".parse::<TaskStatus>().unwrap(),
            TaskStatus::Running
        );
        assert!("sleeping".parse::<TaskStatus>().is_err());
        let parsed: TaskStatus = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(parsed, TaskStatus::Running);
    }

    #[test]
    fn category_is_a_closed_set() {
        assert_eq!(
            "  Testing ".parse::<TaskCategory>().unwrap(),
            TaskCategory::Testing
        );
        let err = "gardening".parse::<TaskCategory>().unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("gardening")));
    }

    #[test]
    fn markup_is_stripped() {
        assert_eq!(strip_markup("<b>bold</b> move"), "bold move");
        assert_eq!(strip_markup("a < b"), "a ");
        let custom = BTreeMap::from([
            ("note".to_string(), json!("<script>x</script>hello")),
            ("nested".to_string(), json!({"inner": ["<i>y</i>"]})),
        ]);
        let cleaned = sanitize_custom(&custom);
        assert_eq!(cleaned["note"], json!("xhello"));
        assert_eq!(cleaned["nested"], json!({"inner": ["y"]}));
    }

    #[test]
    fn title_and_tags_normalize() {
        assert_eq!(normalize_title("  ship   the <em>thing</em> ").unwrap(), "ship the thing");
        assert!(normalize_title("   ").is_err());
        let tags = normalize_tags(&[
            " Backend".to_string(),
            "backend".to_string(),
            "".to_string(),
            "API".to_string(),
        ]);
        assert_eq!(tags, vec!["backend".to_string(), "api".to_string()]);
    }

    #[test]
    fn checksum_ignores_field_order_and_detects_edits() {
        let mut task = Task::new("task-1", "write docs", at(0));
        task.seal().unwrap();
        assert_eq!(task.checksum_matches().unwrap(), Some(true));

        let reparsed: Task =
            serde_json::from_str(&serde_json::to_string_pretty(&task).unwrap()).unwrap();
        assert_eq!(reparsed.checksum_matches().unwrap(), Some(true));

        task.title = "write more docs".to_string();
        assert_eq!(task.checksum_matches().unwrap(), Some(false));
    }

    #[test]
    fn update_merges_fields() {
        let mut task = Task::new("task-1", "draft", at(0));
        let update = TaskUpdate {
            title: Some(" final ".to_string()),
            priority: Some("HIGH".to_string()),
            tags: Some(vec!["X".to_string()]),
            ..TaskUpdate::default()
        };
        update.apply(&mut task).unwrap();
        assert_eq!(task.title, "final");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.metadata.tags, vec!["x".to_string()]);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn sort_is_deterministic() {
        let mut tasks = vec![
            Task::new("b", "beta", at(0)),
            Task::new("a", "alpha", at(0)),
            Task::new("c", "gamma", at(-10)),
        ];
        tasks[0].priority = TaskPriority::Critical;
        sort_tasks(&mut tasks, TaskSortKey::CreatedAt, false);
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        sort_tasks(&mut tasks, TaskSortKey::Priority, false);
        assert_eq!(tasks[0].id, "b");
    }

    #[test]
    fn filter_skips_tombstones() {
        let mut task = Task::new("a", "alpha", at(0));
        let filter = TaskFilter::default();
        assert!(filter.matches(&task));
        task.deleted_at = Some(at(5));
        assert!(!filter.matches(&task));
        let with_deleted = TaskFilter {
            include_deleted: true,
            ..TaskFilter::default()
        };
        assert!(with_deleted.matches(&task));
    }

    #[test]
    fn dependency_edges_point_from_dependent() {
        let task = Task::new("b", "beta", at(0)).with_dependency(DependencyRef::soft("a"));
        let edges = task.dependency_edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].key(), ("b", "a"));
        assert_eq!(edges[0].kind, DependencyType::Soft);
    }
}
