//! Issue-tracker-backed state provider.
//!
//! Tasks are issues, the META record is the single issue labelled `meta`, and
//! session history lives in that issue's comments. Backends only implement
//! the thin [`IssueTracker`] wire seam; everything else is shared here.

mod github;
mod http;
mod linear;
pub mod mapping;

#[cfg(test)]
pub(crate) mod fake;

pub use github::GitHubIssues;
pub use linear::LinearIssues;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::cache::TtlCache;
use super::retry::{RetryPolicy, with_backoff};
use super::{Session, SessionId, StateProvider};
use crate::errors::{StateError, StateResult};
use crate::meta::{Meta, MetaPatch};
use crate::task::{Task, TaskFilter, TaskId, TaskPatch, TaskPayload, TaskStatus, apply_patch};

/// An issue as returned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteIssue {
    pub id: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub open: bool,
    /// Opaque concurrency token (`updated_at` / `updatedAt`)
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteComment {
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Desired issue state for create/update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueDraft {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub open: bool,
}

/// Minimal issue operations a tracker backend must provide.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every issue managed by tether, open and closed.
    async fn list_issues(&self) -> StateResult<Vec<RemoteIssue>>;

    async fn get_issue(&self, id: &str) -> StateResult<Option<RemoteIssue>>;

    async fn create_issue(&self, draft: &IssueDraft) -> StateResult<RemoteIssue>;

    /// Replace title, body, labels and open state. Fails with
    /// `ConcurrentModification` when the issue's version is no longer `expected_version`.
    async fn update_issue(
        &self,
        id: &str,
        expected_version: &str,
        draft: &IssueDraft,
    ) -> StateResult<RemoteIssue>;

    async fn list_comments(&self, id: &str) -> StateResult<Vec<RemoteComment>>;

    async fn add_comment(&self, id: &str, body: &str) -> StateResult<()>;
}

#[async_trait]
impl<T: IssueTracker + ?Sized> IssueTracker for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn list_issues(&self) -> StateResult<Vec<RemoteIssue>> {
        (**self).list_issues().await
    }

    async fn get_issue(&self, id: &str) -> StateResult<Option<RemoteIssue>> {
        (**self).get_issue(id).await
    }

    async fn create_issue(&self, draft: &IssueDraft) -> StateResult<RemoteIssue> {
        (**self).create_issue(draft).await
    }

    async fn update_issue(
        &self,
        id: &str,
        expected_version: &str,
        draft: &IssueDraft,
    ) -> StateResult<RemoteIssue> {
        (**self).update_issue(id, expected_version, draft).await
    }

    async fn list_comments(&self, id: &str) -> StateResult<Vec<RemoteComment>> {
        (**self).list_comments(id).await
    }

    async fn add_comment(&self, id: &str, body: &str) -> StateResult<()> {
        (**self).add_comment(id, body).await
    }
}

const ISSUES_KEY: &str = "issues";

pub struct TrackerProvider<B: IssueTracker> {
    backend: B,
    policy: RetryPolicy,
    issues: TtlCache<&'static str, Vec<RemoteIssue>>,
    comments: TtlCache<String, Vec<RemoteComment>>,
    session: Mutex<Option<Session>>,
}

impl<B: IssueTracker> TrackerProvider<B> {
    pub fn new(backend: B, cache_ttl: Duration, policy: RetryPolicy) -> Self {
        Self {
            backend,
            policy,
            issues: TtlCache::new(cache_ttl),
            comments: TtlCache::new(cache_ttl),
            session: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn not_found(kind: &'static str, id: &str) -> StateError {
        StateError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    fn invalidate(&self) {
        self.issues.expire_all();
        self.comments.expire_all();
    }

    /// Issue list from cache, the backend, or a stale copy when rate limited.
    async fn issues(&self) -> StateResult<Vec<RemoteIssue>> {
        if let Some(hit) = self.issues.fresh(&ISSUES_KEY) {
            return Ok(hit);
        }
        match with_backoff(&self.policy, "list_issues", || self.backend.list_issues()).await {
            Ok(list) => {
                self.issues.put(ISSUES_KEY, list.clone());
                Ok(list)
            }
            Err(e @ StateError::RateLimited { .. }) => match self.issues.stale(&ISSUES_KEY) {
                Some(stale) => {
                    tracing::warn!(provider = self.backend.name(), "rate limited; serving cached issues");
                    Ok(stale)
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    async fn comments(&self, id: &str) -> StateResult<Vec<RemoteComment>> {
        let key = id.to_string();
        if let Some(hit) = self.comments.fresh(&key) {
            return Ok(hit);
        }
        match with_backoff(&self.policy, "list_comments", || self.backend.list_comments(id)).await {
            Ok(list) => {
                self.comments.put(key, list.clone());
                Ok(list)
            }
            Err(e @ StateError::RateLimited { .. }) => self.comments.stale(&key).ok_or(e),
            Err(e) => Err(e),
        }
    }

    /// Current issue straight from the backend, bypassing the cache.
    async fn live_issue(&self, id: &str) -> StateResult<Option<RemoteIssue>> {
        with_backoff(&self.policy, "get_issue", || self.backend.get_issue(id)).await
    }

    async fn load_tasks(&self) -> StateResult<Vec<Task>> {
        let issues = self.issues().await?;
        let mut tasks = Vec::new();
        for issue in issues.iter().filter(|i| mapping::is_task_issue(i)) {
            let comments = self.comments(&issue.id).await?;
            tasks.push(mapping::task_from_issue(issue, &comments)?);
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn meta_issue(&self) -> StateResult<Option<RemoteIssue>> {
        let mut metas: Vec<RemoteIssue> = self
            .issues()
            .await?
            .into_iter()
            .filter(mapping::is_meta_issue)
            .collect();
        metas.sort_by_key(|i| i.created_at);
        Ok(metas.into_iter().next())
    }

    async fn post_meta_comment(&self, body: &str) -> StateResult<()> {
        let meta = self
            .meta_issue()
            .await?
            .ok_or_else(|| Self::not_found("meta", mapping::META_LABEL))?;
        with_backoff(&self.policy, "add_comment", || {
            self.backend.add_comment(&meta.id, body)
        })
        .await?;
        self.comments.expire_all();
        Ok(())
    }

    fn current_session(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    fn set_session(&self, session: Option<Session>) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = session;
        }
    }
}

#[async_trait]
impl<B: IssueTracker> StateProvider for TrackerProvider<B> {
    fn kind(&self) -> &'static str {
        self.backend.name()
    }

    async fn create_task(&self, payload: TaskPayload) -> StateResult<TaskId> {
        crate::task::validate_payload(&payload)?;
        if !payload.dependencies.is_empty() {
            let known: Vec<TaskId> = self.load_tasks().await?.into_iter().map(|t| t.id).collect();
            let unknown: Vec<String> = payload
                .dependencies
                .iter()
                .filter(|d| !known.contains(d))
                .map(|d| format!("unknown dependency '{}'", d))
                .collect();
            if !unknown.is_empty() {
                return Err(StateError::Validation(unknown));
            }
        }

        let task = Task::from_payload(String::new(), &payload, Utc::now())?;
        let draft = mapping::task_draft(&task)?;
        let created = with_backoff(&self.policy, "create_issue", || {
            self.backend.create_issue(&draft)
        })
        .await?;
        self.invalidate();
        tracing::debug!(provider = self.backend.name(), task = %created.id, "task created");
        Ok(created.id)
    }

    async fn get_task(&self, id: &str) -> StateResult<Option<Task>> {
        let issues = self.issues().await?;
        let Some(issue) = issues
            .iter()
            .find(|i| i.id == id && mapping::is_task_issue(i))
        else {
            return Ok(None);
        };
        let comments = self.comments(id).await?;
        mapping::task_from_issue(issue, &comments).map(Some)
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> StateResult<()> {
        let issue = self
            .live_issue(id)
            .await?
            .filter(mapping::is_task_issue)
            .ok_or_else(|| Self::not_found("task", id))?;
        let comments = with_backoff(&self.policy, "list_comments", || {
            self.backend.list_comments(id)
        })
        .await?;
        let mut task = mapping::task_from_issue(&issue, &comments)?;

        let statuses: HashMap<TaskId, TaskStatus> = if patch.status == Some(TaskStatus::InProgress)
            && !task.dependencies.is_empty()
        {
            self.load_tasks()
                .await?
                .into_iter()
                .map(|t| (t.id, t.status))
                .collect()
        } else {
            HashMap::new()
        };
        let became_done = apply_patch(&mut task, &patch, |dep| statuses.get(dep).copied(), Utc::now())?;

        let draft = mapping::task_draft(&task)?;
        with_backoff(&self.policy, "update_issue", || {
            self.backend.update_issue(id, &issue.version, &draft)
        })
        .await?;
        self.invalidate();
        // The update has landed; a lost comment must not fail it.
        if let Some(body) = &patch.comment
            && let Err(e) = with_backoff(&self.policy, "add_comment", || {
                self.backend.add_comment(id, body)
            })
            .await
        {
            tracing::warn!(task = %id, error = %e, "task updated but its comment was not posted");
        }

        if became_done && let Some(mut session) = self.current_session() {
            session.tasks_completed += 1;
            self.set_session(Some(session));
        }
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> StateResult<()> {
        let issue = self
            .live_issue(id)
            .await?
            .filter(mapping::is_task_issue)
            .ok_or_else(|| Self::not_found("task", id))?;
        let mut labels = issue.labels.clone();
        labels.push(mapping::DELETED_LABEL.to_string());
        let draft = IssueDraft {
            title: issue.title.clone(),
            body: issue.body.clone(),
            labels,
            open: false,
        };
        with_backoff(&self.policy, "update_issue", || {
            self.backend.update_issue(id, &issue.version, &draft)
        })
        .await?;
        self.invalidate();
        Ok(())
    }

    async fn get_tasks(&self, filter: &TaskFilter) -> StateResult<Vec<Task>> {
        Ok(self
            .load_tasks()
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect())
    }

    async fn get_meta(&self) -> StateResult<Option<Meta>> {
        let Some(issue) = self.meta_issue().await? else {
            return Ok(None);
        };
        let comments = self.comments(&issue.id).await?;
        mapping::meta_from_issue(&issue, &comments).map(Some)
    }

    async fn update_meta(&self, patch: MetaPatch) -> StateResult<()> {
        let now = Utc::now();
        match self.meta_issue().await? {
            None => {
                let mut meta = Meta::default();
                meta.apply(&patch, now);
                let draft = mapping::meta_draft(&meta)?;
                let created = with_backoff(&self.policy, "create_issue", || {
                    self.backend.create_issue(&draft)
                })
                .await?;
                tracing::info!(provider = self.backend.name(), issue = %created.id, "META issue created");
            }
            Some(found) => {
                let issue = self
                    .live_issue(&found.id)
                    .await?
                    .ok_or_else(|| Self::not_found("meta", &found.id))?;
                let mut meta = mapping::meta_from_issue(&issue, &[])?;
                meta.apply(&patch, now);
                let draft = mapping::meta_draft(&meta)?;
                with_backoff(&self.policy, "update_issue", || {
                    self.backend.update_issue(&issue.id, &issue.version, &draft)
                })
                .await?;
            }
        }
        self.invalidate();
        Ok(())
    }

    async fn start_session(&self) -> StateResult<SessionId> {
        let session = Session::begin(Utc::now());
        let body = mapping::session_comment(
            &format!("Session {} started", session.session_id),
            &session,
        )?;
        self.post_meta_comment(&body).await?;
        let id = session.session_id.clone();
        self.set_session(Some(session));
        Ok(id)
    }

    async fn end_session(&self, summary: &str) -> StateResult<()> {
        let mut session = self.current_session().ok_or(StateError::NoActiveSession)?;
        session.ended_at = Some(Utc::now());
        session.summary = summary.to_string();
        let body = mapping::session_comment(
            &format!(
                "Session {} ended ({} task(s) completed)",
                session.session_id, session.tasks_completed
            ),
            &session,
        )?;
        self.post_meta_comment(&body).await?;
        self.set_session(None);
        Ok(())
    }

    async fn add_session_comment(&self, text: &str) -> StateResult<()> {
        self.post_meta_comment(text).await
    }

    async fn active_session(&self) -> StateResult<Option<Session>> {
        Ok(self.current_session())
    }

    async fn list_sessions(&self) -> StateResult<Vec<Session>> {
        let Some(meta) = self.meta_issue().await? else {
            return Ok(Vec::new());
        };
        let comments = self.comments(&meta.id).await?;
        Ok(mapping::sessions_from_comments(&comments))
    }

    async fn abandon_session(&self, session_id: &str, summary: &str) -> StateResult<()> {
        let headline = format!("Session {} abandoned: {}", session_id, summary);
        let recorded = self
            .list_sessions()
            .await?
            .into_iter()
            .find(|s| s.session_id == session_id && s.is_active());
        let body = match recorded {
            Some(mut session) => {
                session.ended_at = Some(Utc::now());
                session.summary = summary.to_string();
                mapping::session_comment(&headline, &session)?
            }
            None => headline,
        };
        self.post_meta_comment(&body).await
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeTracker;
    use super::*;
    use crate::task::tests::payload;
    use std::sync::atomic::Ordering;

    fn provider() -> (Arc<FakeTracker>, TrackerProvider<Arc<FakeTracker>>) {
        let fake = Arc::new(FakeTracker::default());
        let provider = TrackerProvider::new(
            fake.clone(),
            Duration::from_secs(60),
            RetryPolicy::immediate(3),
        );
        (fake, provider)
    }

    // ── tasks ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_create_and_read_task() {
        let (_fake, p) = provider();
        let a = p.create_task(payload("Implement login form")).await.unwrap();
        let b = p.create_task(payload("Implement login form")).await.unwrap();
        assert_ne!(a, b);

        let task = p.get_task(&a).await.unwrap().unwrap();
        assert_eq!(task.title, "Implement login form");
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(p.get_tasks(&TaskFilter::all()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_done_closes_issue_and_comment_is_posted() {
        let (fake, p) = provider();
        let id = p.create_task(payload("Implement login form")).await.unwrap();
        p.update_task(&id, TaskPatch::status(TaskStatus::InProgress))
            .await
            .unwrap();
        p.update_task(
            &id,
            TaskPatch::status(TaskStatus::Done).with_comment("- [x] #1\n- [x] #2"),
        )
        .await
        .unwrap();

        let issue = fake.issue(&id).unwrap();
        assert!(!issue.open);
        assert!(issue.labels.contains(&"status:done".to_string()));
        let task = p.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.comments.len(), 1);
    }

    #[tokio::test]
    async fn test_immutable_fields_rejected_remotely() {
        let (fake, p) = provider();
        let id = p.create_task(payload("Implement login form")).await.unwrap();
        let before = fake.issue(&id).unwrap();
        let patch = TaskPatch {
            priority: Some(1),
            ..TaskPatch::default()
        };
        assert!(matches!(
            p.update_task(&id, patch).await,
            Err(StateError::ImmutableFieldViolation { .. })
        ));
        assert_eq!(fake.issue(&id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_stale_version_is_conflict() {
        let (fake, p) = provider();
        let id = p.create_task(payload("Implement login form")).await.unwrap();
        let issue = fake.issue(&id).unwrap();
        fake.add_comment(&id, "someone else").await.unwrap();

        let draft = IssueDraft {
            title: issue.title.clone(),
            body: issue.body.clone(),
            labels: issue.labels.clone(),
            open: true,
        };
        let err = fake.update_issue(&id, &issue.version, &draft).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_competing_write_fails_update_and_keeps_task() {
        let (fake, p) = provider();
        let id = p.create_task(payload("Implement login form")).await.unwrap();
        *fake.race_next_update.lock().unwrap() = Some(id.clone());

        let err = p
            .update_task(
                &id,
                TaskPatch::status(TaskStatus::InProgress).with_comment("starting"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::ConcurrentModification { .. }));

        let task = p.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.comments.is_empty());
        assert!(fake.issue(&id).unwrap().labels.contains(&"status:todo".to_string()));
    }

    #[tokio::test]
    async fn test_competing_write_fails_meta_update() {
        let (fake, p) = provider();
        p.update_meta(MetaPatch::focus("Login")).await.unwrap();
        let meta_id = fake.issue_by_title(mapping::META_TITLE).unwrap().id;
        *fake.race_next_update.lock().unwrap() = Some(meta_id);

        let err = p.update_meta(MetaPatch::focus("Checkout")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(p.get_meta().await.unwrap().unwrap().current_focus, "Login");
    }

    #[tokio::test]
    async fn test_lost_comment_does_not_fail_applied_update() {
        let (fake, p) = provider();
        let id = p.create_task(payload("Implement login form")).await.unwrap();
        fake.reject_comments.store(true, Ordering::SeqCst);

        p.update_task(
            &id,
            TaskPatch::status(TaskStatus::InProgress).with_comment("starting"),
        )
        .await
        .unwrap();

        fake.reject_comments.store(false, Ordering::SeqCst);
        let task = p.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.comments.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_tasks_are_hidden() {
        let (fake, p) = provider();
        let id = p.create_task(payload("Implement login form")).await.unwrap();
        p.delete_task(&id).await.unwrap();
        assert!(p.get_task(&id).await.unwrap().is_none());
        assert!(p.get_tasks(&TaskFilter::all()).await.unwrap().is_empty());
        assert!(fake.issue(&id).is_some());
    }

    // ── META and sessions ────────────────────────────────────────────

    #[tokio::test]
    async fn test_meta_issue_created_on_first_update() {
        let (fake, p) = provider();
        assert!(p.get_meta().await.unwrap().is_none());
        p.update_meta(MetaPatch::focus("Login")).await.unwrap();
        p.update_meta(MetaPatch::decision("Use JWT", "Stateless API"))
            .await
            .unwrap();

        let meta = p.get_meta().await.unwrap().unwrap();
        assert_eq!(meta.current_focus, "Login");
        assert_eq!(meta.architecture_decisions.len(), 1);
        assert_eq!(fake.issue_count(), 1);
        assert!(p.get_tasks(&TaskFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_lifecycle_on_meta_comments() {
        let (_fake, p) = provider();
        p.update_meta(MetaPatch::focus("Login")).await.unwrap();
        let id = p.create_task(payload("Implement login form")).await.unwrap();

        let session_id = p.start_session().await.unwrap();
        p.update_task(&id, TaskPatch::status(TaskStatus::InProgress))
            .await
            .unwrap();
        p.update_task(&id, TaskPatch::status(TaskStatus::Done))
            .await
            .unwrap();
        p.add_session_comment("handoff notes").await.unwrap();
        p.end_session("done").await.unwrap();

        let sessions = p.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, session_id);
        assert_eq!(sessions[0].tasks_completed, 1);
        assert!(!sessions[0].is_active());

        let meta = p.get_meta().await.unwrap().unwrap();
        assert_eq!(meta.session_history.len(), 3);
        assert_eq!(meta.session_history[1].body, "handoff notes");
    }

    #[tokio::test]
    async fn test_session_requires_meta() {
        let (_fake, p) = provider();
        assert!(matches!(
            p.start_session().await,
            Err(StateError::NotFound { kind: "meta", .. })
        ));
    }

    // ── availability ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_rate_limited_serves_stale_cache() {
        let (fake, p) = provider();
        p.create_task(payload("Implement login form")).await.unwrap();
        assert_eq!(p.get_tasks(&TaskFilter::all()).await.unwrap().len(), 1);

        p.invalidate();
        fake.rate_limited.store(true, Ordering::SeqCst);
        assert_eq!(p.get_tasks(&TaskFilter::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_without_cache_surfaces() {
        let (fake, p) = provider();
        fake.rate_limited.store(true, Ordering::SeqCst);
        assert!(matches!(
            p.get_tasks(&TaskFilter::all()).await,
            Err(StateError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_outage_retried_then_surfaced() {
        let (fake, p) = provider();
        fake.outage.store(true, Ordering::SeqCst);
        assert!(matches!(
            p.get_meta().await,
            Err(StateError::ProviderUnavailable { .. })
        ));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 4);
    }
}
