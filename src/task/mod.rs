//! Task model shared by every state provider.
//!
//! A task's requirements (`title`, `description`, `acceptance_criteria`,
//! `test_steps`, `category`, `priority`) are locked once it has acceptance
//! criteria. Scope changes go through [`supersede_task`], which creates a new
//! task and closes the old one instead of editing it.

pub mod criteria;
pub mod validate;

pub use criteria::{CriteriaProgress, criteria_progress};
pub use validate::{apply_patch, check_transition, validate_payload};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StateResult;
use crate::provider::StateProvider;

/// Provider-assigned task identifier.
pub type TaskId = String;

/// Label added to a task that replaces an older one: `supersedes:<old id>`.
pub const SUPERSEDES_PREFIX: &str = "supersedes:";
/// Label added to a task that was replaced: `superseded-by:<new id>`.
pub const SUPERSEDED_BY_PREFIX: &str = "superseded-by:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Functional,
    Style,
    Infrastructure,
    Testing,
    Bugfix,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Functional,
        Category::Style,
        Category::Infrastructure,
        Category::Testing,
        Category::Bugfix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Functional => "functional",
            Category::Style => "style",
            Category::Infrastructure => "infrastructure",
            Category::Testing => "testing",
            Category::Bugfix => "bugfix",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == needle)
            .ok_or_else(|| {
                format!(
                    "Invalid category '{}'. Valid values: functional, style, infrastructure, testing, bugfix",
                    s
                )
            })
    }
}

/// Task priority, 1 (urgent) through 4 (low).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const URGENT: Priority = Priority(1);
    pub const LOW: Priority = Priority(4);

    pub fn new(value: u8) -> Result<Self, String> {
        if (1..=4).contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!("priority must be between 1 and 4, got {}", value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase().replace('-', "_");
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == needle)
            .ok_or_else(|| {
                format!(
                    "Invalid status '{}'. Valid values: todo, in_progress, done, blocked",
                    s
                )
            })
    }
}

/// Append-only task comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub test_steps: Vec<String>,
    pub category: Category,
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a task from an already validated payload.
    pub fn from_payload(id: TaskId, payload: &TaskPayload, now: DateTime<Utc>) -> StateResult<Self> {
        validate_payload(payload)?;
        let mut labels = Vec::new();
        for label in &payload.labels {
            push_unique(&mut labels, label.trim());
        }
        Ok(Self {
            id,
            title: payload.title.trim().to_string(),
            description: payload.description.clone(),
            acceptance_criteria: payload
                .acceptance_criteria
                .iter()
                .map(|c| c.trim().to_string())
                .collect(),
            test_steps: payload.test_steps.clone(),
            category: payload.category,
            priority: Priority(payload.priority),
            status: TaskStatus::Todo,
            labels,
            assigned_to: None,
            dependencies: payload.dependencies.clone(),
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Requirements are locked once acceptance criteria exist.
    pub fn requirements_locked(&self) -> bool {
        !self.acceptance_criteria.is_empty()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// The id this task was superseded by, if any.
    pub fn superseded_by(&self) -> Option<&str> {
        self.labels
            .iter()
            .find_map(|l| l.strip_prefix(SUPERSEDED_BY_PREFIX))
    }

    /// The last comment whose body contains `needle`.
    pub fn last_comment_containing(&self, needle: &str) -> Option<&Comment> {
        self.comments.iter().rev().find(|c| c.body.contains(needle))
    }
}

/// Insert `label` unless it is empty or already present, keeping order.
pub(crate) fn push_unique(labels: &mut Vec<String>, label: &str) {
    if !label.is_empty() && !labels.iter().any(|l| l == label) {
        labels.push(label.to_string());
    }
}

/// Create/update request shape for a new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub test_steps: Vec<String>,
    pub priority: u8,
    pub category: Category,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

/// Partial update. Requirement fields are only accepted while a task has no
/// acceptance criteria; any other attempt is an `ImmutableFieldViolation`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub test_steps: Option<Vec<String>>,
    pub category: Option<Category>,
    pub priority: Option<u8>,
    pub status: Option<TaskStatus>,
    /// Replace the whole label set
    pub labels: Option<Vec<String>>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub assigned_to: Option<Option<String>>,
    pub dependencies: Option<Vec<TaskId>>,
    /// Appended to the comment list
    pub comment: Option<String>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn comment(body: impl Into<String>) -> Self {
        Self {
            comment: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn with_comment(mut self, body: impl Into<String>) -> Self {
        self.comment = Some(body.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.add_labels.push(label.into());
        self
    }

    /// True when the patch touches any requirement field.
    pub fn touches_requirements(&self) -> bool {
        self.title.is_some()
            || self.description.is_some()
            || self.acceptance_criteria.is_some()
            || self.test_steps.is_some()
            || self.category.is_some()
            || self.priority.is_some()
    }
}

/// Filters for `get_tasks`. Empty filter returns everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub category: Option<Category>,
    /// Every listed label must be present
    pub labels: Vec<String>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.category.is_none_or(|c| task.category == c)
            && self.labels.iter().all(|l| task.has_label(l))
    }
}

/// Replace `old_id` with a new task built from `payload`.
///
/// The new task carries `supersedes:<old>`; the old one gains
/// `superseded-by:<new>` and is moved to `blocked` unless it is already done.
pub async fn supersede_task(
    provider: &dyn StateProvider,
    old_id: &str,
    mut payload: TaskPayload,
) -> StateResult<TaskId> {
    let old = provider
        .get_task(old_id)
        .await?
        .ok_or_else(|| crate::errors::StateError::NotFound {
            kind: "task",
            id: old_id.to_string(),
        })?;

    payload.labels.push(format!("{}{}", SUPERSEDES_PREFIX, old.id));
    let new_id = provider.create_task(payload).await?;

    let mut patch = TaskPatch::default()
        .with_label(format!("{}{}", SUPERSEDED_BY_PREFIX, new_id))
        .with_comment(format!("Superseded by {}", new_id));
    if old.status != TaskStatus::Done && old.status != TaskStatus::Blocked {
        patch.status = Some(TaskStatus::Blocked);
    }
    provider.update_task(old_id, patch).await?;
    tracing::info!(old = %old_id, new = %new_id, "task superseded");
    Ok(new_id)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn payload(title: &str) -> TaskPayload {
        TaskPayload {
            title: title.to_string(),
            description: "Description of the feature".to_string(),
            acceptance_criteria: vec![
                "User can submit the login form".to_string(),
                "Invalid password shows an error message".to_string(),
            ],
            test_steps: vec!["Open /login".to_string()],
            priority: 2,
            category: Category::Functional,
            labels: vec![],
            dependencies: vec![],
        }
    }

    #[test]
    fn test_category_roundtrip_via_str() {
        for c in Category::ALL {
            assert_eq!(c.as_str().parse::<Category>().unwrap(), c);
        }
        assert!("feature".parse::<Category>().is_err());
    }

    #[test]
    fn test_status_parse_accepts_dash() {
        assert_eq!(
            "in-progress".parse::<TaskStatus>().unwrap(),
            TaskStatus::InProgress
        );
    }

    #[test]
    fn test_priority_bounds() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(5).is_err());
        assert_eq!(Priority::new(1).unwrap(), Priority::URGENT);
        assert!(Priority::URGENT < Priority::LOW);
    }

    #[test]
    fn test_priority_rejects_out_of_range_json() {
        let result: Result<Priority, _> = serde_json::from_str("7");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_payload_dedups_labels() {
        let mut p = payload("Implement login form");
        p.labels = vec!["ui".into(), "ui".into(), " auth ".into()];
        let task = Task::from_payload("T-1".into(), &p, Utc::now()).unwrap();
        assert_eq!(task.labels, vec!["ui".to_string(), "auth".to_string()]);
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.requirements_locked());
    }

    #[test]
    fn test_filter_matches_all_conditions() {
        let mut p = payload("Implement login form");
        p.labels = vec!["ui".into()];
        let task = Task::from_payload("T-1".into(), &p, Utc::now()).unwrap();

        assert!(TaskFilter::all().matches(&task));
        assert!(TaskFilter::with_status(TaskStatus::Todo).matches(&task));
        assert!(!TaskFilter::with_status(TaskStatus::Done).matches(&task));
        let f = TaskFilter {
            category: Some(Category::Functional),
            labels: vec!["ui".into()],
            ..TaskFilter::default()
        };
        assert!(f.matches(&task));
        let f = TaskFilter {
            labels: vec!["ui".into(), "backend".into()],
            ..TaskFilter::default()
        };
        assert!(!f.matches(&task));
    }

    #[test]
    fn test_superseded_by_reads_label() {
        let mut p = payload("Implement login form");
        p.labels = vec!["superseded-by:T-9".into()];
        let task = Task::from_payload("T-1".into(), &p, Utc::now()).unwrap();
        assert_eq!(task.superseded_by(), Some("T-9"));
    }
}
