//! Pluggable task validators.
//!
//! Each validator reports issues independently. A task is valid unless some
//! validator reports a `Critical` issue; anything less severe is a warning.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::task::{Task, TaskStatus};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Basic,
    Standard,
    Comprehensive,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationIssue {
    pub validator: &'static str,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
    pub message: String,
}

impl ValidationIssue {
    fn new(
        validator: &'static str,
        severity: Severity,
        field: Option<&'static str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            validator,
            severity,
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationReport {
    pub task_id: String,
    pub level: ValidationLevel,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        !self
            .issues
            .iter()
            .any(|issue| issue.severity == Severity::Critical)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|issue| issue.severity < Severity::Critical)
    }

    pub fn summary(&self) -> String {
        self.issues
            .iter()
            .map(|issue| format!("[{:?}] {}", issue.severity, issue.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// What the validators may consult besides the task itself.
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    tasks: HashMap<&'a str, &'a Task>,
    pub now: DateTime<Utc>,
}

impl<'a> ValidationContext<'a> {
    pub fn new(tasks: impl IntoIterator<Item = &'a Task>, now: DateTime<Utc>) -> Self {
        Self {
            tasks: tasks
                .into_iter()
                .filter(|task| !task.is_deleted())
                .map(|task| (task.id.as_str(), task))
                .collect(),
            now,
        }
    }

    pub fn task(&self, id: &str) -> Option<&'a Task> {
        self.tasks.get(id).copied()
    }
}

pub trait TaskValidator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lowest level at which this validator runs.
    fn min_level(&self) -> ValidationLevel;

    fn validate(
        &self,
        task: &Task,
        level: ValidationLevel,
        ctx: &ValidationContext<'_>,
    ) -> Vec<ValidationIssue>;
}

/// Identity, title and timestamps must be present.
#[derive(Debug, Default)]
pub struct RequiredFieldsValidator;

impl TaskValidator for RequiredFieldsValidator {
    fn name(&self) -> &'static str {
        "required_fields"
    }

    fn min_level(&self) -> ValidationLevel {
        ValidationLevel::Basic
    }

    fn validate(
        &self,
        task: &Task,
        level: ValidationLevel,
        _ctx: &ValidationContext<'_>,
    ) -> Vec<ValidationIssue> {
        let name = self.name();
        let mut issues = Vec::new();
        if task.id.trim().is_empty() {
            issues.push(ValidationIssue::new(name, Severity::Critical, Some("id"), "task id is empty"));
        }
        if task.title.trim().is_empty() {
            issues.push(ValidationIssue::new(
                name,
                Severity::Critical,
                Some("title"),
                "task title is empty",
            ));
        }
        if task.version == 0 {
            issues.push(ValidationIssue::new(
                name,
                Severity::High,
                Some("version"),
                "version must start at 1",
            ));
        }
        if level == ValidationLevel::Comprehensive && task.description.trim().is_empty() {
            issues.push(ValidationIssue::new(
                name,
                Severity::Low,
                Some("description"),
                "task has no description",
            ));
        }
        issues
    }
}

/// Dependencies must point at known tasks that have not failed.
#[derive(Debug, Default)]
pub struct DependencyIntegrityValidator;

impl TaskValidator for DependencyIntegrityValidator {
    fn name(&self) -> &'static str {
        "dependency_integrity"
    }

    fn min_level(&self) -> ValidationLevel {
        ValidationLevel::Standard
    }

    fn validate(
        &self,
        task: &Task,
        _level: ValidationLevel,
        ctx: &ValidationContext<'_>,
    ) -> Vec<ValidationIssue> {
        let name = self.name();
        let mut issues = Vec::new();
        for dep in &task.dependencies {
            if dep.task_id == task.id {
                issues.push(ValidationIssue::new(
                    name,
                    Severity::High,
                    Some("dependencies"),
                    format!("task {} depends on itself", task.id),
                ));
                continue;
            }
            match ctx.task(&dep.task_id) {
                None => issues.push(ValidationIssue::new(
                    name,
                    Severity::High,
                    Some("dependencies"),
                    format!("dependency {} does not exist", dep.task_id),
                )),
                Some(prerequisite) if prerequisite.status == TaskStatus::Failed => {
                    issues.push(ValidationIssue::new(
                        name,
                        Severity::Medium,
                        Some("dependencies"),
                        format!("dependency {} has failed", dep.task_id),
                    ))
                }
                Some(_) => {}
            }
        }
        issues
    }
}

/// Stored checksum must match and timestamps must be ordered.
#[derive(Debug, Default)]
pub struct ChecksumTimestampValidator;

impl TaskValidator for ChecksumTimestampValidator {
    fn name(&self) -> &'static str {
        "checksum_timestamp"
    }

    fn min_level(&self) -> ValidationLevel {
        ValidationLevel::Standard
    }

    fn validate(
        &self,
        task: &Task,
        level: ValidationLevel,
        ctx: &ValidationContext<'_>,
    ) -> Vec<ValidationIssue> {
        let name = self.name();
        let mut issues = Vec::new();
        match task.checksum_matches() {
            Ok(Some(true)) => {}
            Ok(Some(false)) => issues.push(ValidationIssue::new(
                name,
                Severity::Critical,
                Some("metadata.checksum"),
                "checksum does not match task content",
            )),
            Ok(None) => {
                if level == ValidationLevel::Comprehensive {
                    issues.push(ValidationIssue::new(
                        name,
                        Severity::Medium,
                        Some("metadata.checksum"),
                        "task carries no checksum",
                    ));
                }
            }
            Err(err) => issues.push(ValidationIssue::new(
                name,
                Severity::Critical,
                Some("metadata.checksum"),
                format!("checksum could not be computed: {err}"),
            )),
        }

        let meta = &task.metadata;
        if meta.updated_at < meta.created_at {
            issues.push(ValidationIssue::new(
                name,
                Severity::High,
                Some("metadata.updatedAt"),
                "updatedAt precedes createdAt",
            ));
        }
        if meta.updated_at > ctx.now + Duration::days(1) {
            issues.push(ValidationIssue::new(
                name,
                Severity::Medium,
                Some("metadata.updatedAt"),
                "updatedAt lies in the future",
            ));
        }
        if meta.recovered && meta.recovered_at.is_none() {
            issues.push(ValidationIssue::new(
                name,
                Severity::Low,
                Some("metadata.recoveredAt"),
                "recovered task has no recovery timestamp",
            ));
        }
        issues
    }
}

/// Ordered collection of validators.
pub struct TaskValidatorSet {
    validators: Vec<Box<dyn TaskValidator>>,
}

impl Default for TaskValidatorSet {
    fn default() -> Self {
        Self {
            validators: vec![
                Box::new(RequiredFieldsValidator),
                Box::new(DependencyIntegrityValidator),
                Box::new(ChecksumTimestampValidator),
            ],
        }
    }
}

impl std::fmt::Debug for TaskValidatorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.validators.iter().map(|v| v.name()).collect();
        f.debug_struct("TaskValidatorSet").field("validators", &names).finish()
    }
}

impl TaskValidatorSet {
    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    pub fn with(mut self, validator: impl TaskValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn validate(
        &self,
        task: &Task,
        level: ValidationLevel,
        ctx: &ValidationContext<'_>,
    ) -> ValidationReport {
        let issues = self
            .validators
            .iter()
            .filter(|validator| validator.min_level() <= level)
            .flat_map(|validator| validator.validate(task, level, ctx))
            .collect();
        ValidationReport {
            task_id: task.id.clone(),
            level,
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DependencyRef;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn sealed(task: Task) -> Task {
        let mut task = task;
        task.seal().unwrap();
        task
    }

    #[test]
    fn clean_task_passes_every_level() {
        let task = sealed(Task::new("a", "alpha", now()));
        let ctx = ValidationContext::new([&task], now());
        let set = TaskValidatorSet::default();
        assert!(set.validate(&task, ValidationLevel::Standard, &ctx).issues.is_empty());
        let comprehensive = set.validate(&task, ValidationLevel::Comprehensive, &ctx);
        assert!(comprehensive.is_valid());
        assert_eq!(comprehensive.warnings().count(), 1); // empty description
    }

    #[test]
    fn checksum_mismatch_is_critical() {
        let mut task = sealed(Task::new("a", "alpha", now()));
        task.title = "changed".to_string();
        let ctx = ValidationContext::new([&task], now());
        let report = TaskValidatorSet::default().validate(&task, ValidationLevel::Standard, &ctx);
        assert!(!report.is_valid());
        // Basic level does not look at checksums.
        let basic = TaskValidatorSet::default().validate(&task, ValidationLevel::Basic, &ctx);
        assert!(basic.is_valid());
    }

    #[test]
    fn dependency_problems_are_warnings() {
        let failed = sealed(Task::new("f", "failed", now()).with_status(TaskStatus::Failed));
        let task = sealed(
            Task::new("a", "alpha", now())
                .with_dependency(DependencyRef::hard("f"))
                .with_dependency(DependencyRef::hard("ghost")),
        );
        let ctx = ValidationContext::new([&failed, &task], now());
        let report = TaskValidatorSet::default().validate(&task, ValidationLevel::Standard, &ctx);
        assert!(report.is_valid());
        let severities: Vec<Severity> = report.issues.iter().map(|i| i.severity).collect();
        assert_eq!(severities, vec![Severity::Medium, Severity::High]);
    }

    #[test]
    fn empty_title_is_critical() {
        let task = Task::new("a", "  ", now());
        let ctx = ValidationContext::new([&task], now());
        let report = TaskValidatorSet::default().validate(&task, ValidationLevel::Basic, &ctx);
        assert!(!report.is_valid());
    }
}
