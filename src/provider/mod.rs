//! Pluggable persistence for tasks, the META record and sessions.
//!
//! | Backend          | Struct                         | Storage                        |
//! |------------------|--------------------------------|--------------------------------|
//! | `file`           | [`FileProvider`]               | `.tether/state/*.json`         |
//! | `github`         | [`TrackerProvider<GitHubIssues>`] | issues in one repository    |
//! | `linear`         | [`TrackerProvider<LinearIssues>`] | issues in one team          |
//!
//! Every backend satisfies the same [`StateProvider`] contract. Mutations are
//! guarded by optimistic concurrency; a conflicting write fails with
//! `ConcurrentModification` and callers re-run it through
//! [`retry::retry_conflicts`].

pub mod cache;
pub mod file;
pub mod retry;
pub mod snapshot;
pub mod tracker;

pub use file::FileProvider;
pub use retry::{RetryPolicy, retry_conflicts, with_backoff};
pub use snapshot::{ReplayReport, SnapshotSync};
pub use tracker::{GitHubIssues, IssueTracker, LinearIssues, TrackerProvider};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{Config, ProviderType};
use crate::errors::StateResult;
use crate::meta::{Meta, MetaPatch, RegressionStatus};
use crate::task::{Task, TaskFilter, TaskId, TaskPatch, TaskPayload, TaskStatus};

pub type SessionId = String;

/// A bounded unit of agent activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks_completed: u32,
    #[serde(default)]
    pub summary: String,
}

impl Session {
    /// Open a session whose id is derived from its start time.
    pub fn begin(now: DateTime<Utc>) -> Self {
        Self {
            session_id: format!("S-{}", now.format("%Y%m%dT%H%M%S%3fZ")),
            started_at: now,
            ended_at: None,
            tasks_completed: 0,
            summary: String::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub done: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub todo: usize,
    pub completion_rate: f64,
}

impl ProgressSummary {
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
        let total = tasks.len();
        let done = count(TaskStatus::Done);
        Self {
            total,
            done,
            in_progress: count(TaskStatus::InProgress),
            blocked: count(TaskStatus::Blocked),
            todo: count(TaskStatus::Todo),
            completion_rate: if total == 0 {
                0.0
            } else {
                done as f64 / total as f64
            },
        }
    }
}

impl std::fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} done ({:.0}%), {} in progress, {} blocked, {} todo",
            self.done,
            self.total,
            self.completion_rate * 100.0,
            self.in_progress,
            self.blocked,
            self.todo
        )
    }
}

/// CRUD over tasks, the singleton META record and session lifecycle.
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Short backend name used in logs and errors.
    fn kind(&self) -> &'static str;

    /// Validate and persist a new task. Identical payloads create distinct tasks.
    async fn create_task(&self, payload: TaskPayload) -> StateResult<TaskId>;

    async fn get_task(&self, id: &str) -> StateResult<Option<Task>>;

    /// Merge mutable fields; locked requirement fields fail with
    /// `ImmutableFieldViolation` and leave the task unchanged.
    async fn update_task(&self, id: &str, patch: TaskPatch) -> StateResult<()>;

    async fn delete_task(&self, id: &str) -> StateResult<()>;

    /// Tasks matching `filter`, in creation order.
    async fn get_tasks(&self, filter: &TaskFilter) -> StateResult<Vec<Task>>;

    /// `None` means the project has not been initialized on this backend.
    async fn get_meta(&self) -> StateResult<Option<Meta>>;

    /// Apply `patch`, creating the META record if it does not exist yet.
    async fn update_meta(&self, patch: MetaPatch) -> StateResult<()>;

    /// Create the META record of a new project: no decisions, regression unknown.
    async fn init_meta(&self, current_focus: &str) -> StateResult<()> {
        self.update_meta(MetaPatch {
            regression_status: Some(RegressionStatus::Unknown),
            current_focus: Some(current_focus.to_string()),
            ..MetaPatch::default()
        })
        .await
    }

    async fn start_session(&self) -> StateResult<SessionId>;

    async fn end_session(&self, summary: &str) -> StateResult<()>;

    /// Append to META's session history. Prior entries are never edited.
    async fn add_session_comment(&self, text: &str) -> StateResult<()>;

    /// The session opened by this provider instance, if still active.
    async fn active_session(&self) -> StateResult<Option<Session>>;

    /// Every recorded session, oldest first.
    async fn list_sessions(&self) -> StateResult<Vec<Session>>;

    /// Close a session left open by a process that died.
    async fn abandon_session(&self, session_id: &str, summary: &str) -> StateResult<()> {
        self.add_session_comment(&format!(
            "Session {} abandoned: {}",
            session_id, summary
        ))
        .await
    }

    async fn get_progress_summary(&self) -> StateResult<ProgressSummary> {
        let tasks = self.get_tasks(&TaskFilter::all()).await?;
        Ok(ProgressSummary::from_tasks(&tasks))
    }
}

/// Build the provider named in the configuration.
pub fn from_config(config: &Config) -> anyhow::Result<Arc<dyn StateProvider>> {
    let section = &config.toml.state_provider;
    let policy = RetryPolicy::from_config(section);
    let provider: Arc<dyn StateProvider> = match section.provider_type {
        ProviderType::File => Arc::new(FileProvider::new(&config.state_dir)?),
        ProviderType::Github => {
            let backend = GitHubIssues::from_config(section)?;
            Arc::new(TrackerProvider::new(backend, section.cache_ttl(), policy))
        }
        ProviderType::Linear => {
            let backend = LinearIssues::from_config(section)?;
            Arc::new(TrackerProvider::new(backend, section.cache_ttl(), policy))
        }
    };
    Ok(provider)
}
