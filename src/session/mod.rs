//! Session lifecycle and recovery after a context reset.
//!
//! Every session start goes through [`SessionManager::recover`], which picks
//! one of three paths:
//!
//! | Marker | Provider    | Outcome                                           |
//! |--------|-------------|---------------------------------------------------|
//! | absent | no META     | new project: run the initializer, write marker    |
//! | any    | has META    | resume; warn about unexplained in-progress tasks  |
//! | present| unreachable | degraded mode on the local snapshot, or fail fast |
//!
//! [`SessionManager::with_session`] guarantees the handoff comment is written
//! on every exit path.

pub mod marker;

pub use marker::{LastSession, MarkerFile};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::errors::{OrchestratorError, StateError};
use crate::meta::{Meta, MetaPatch};
use crate::orchestrator::initializer::Initializer;
use crate::provider::snapshot::SyncHandle;
use crate::provider::{
    FileProvider, ProgressSummary, ReplayReport, SessionId, SnapshotSync, StateProvider,
    retry_conflicts,
};
use crate::task::{CriteriaProgress, Task, TaskFilter, TaskId, TaskStatus, criteria_progress};

/// Fields that cannot be trusted while running on the local snapshot.
pub const STALE_FIELDS: [&str; 3] = [
    "remote comment history",
    "remote labels",
    "tasks created by other sessions",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryCase {
    /// No prior state; the initializer created tasks and META
    Initialized,
    Resumed,
    /// Provider unreachable; running on the local snapshot
    Degraded,
}

/// An in-progress task that no session comment accounts for.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialProgress {
    pub task_id: TaskId,
    pub title: String,
    pub criteria: CriteriaProgress,
}

impl std::fmt::Display for PartialProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} '{}' is in progress with {} checked but no session recorded working on it",
            self.task_id, self.title, self.criteria
        )
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub case: RecoveryCase,
    pub meta: Meta,
    pub tasks: Vec<Task>,
    pub progress: ProgressSummary,
    pub warnings: Vec<PartialProgress>,
    pub stale_fields: Vec<&'static str>,
    /// Degraded-mode changes pushed back to the provider during this recovery
    pub replayed: Option<ReplayReport>,
}

/// What a session leaves behind for the next one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Handoff {
    pub summary: String,
    pub open_tasks: Vec<TaskId>,
    pub pending_checkpoint: Option<Checkpoint>,
    pub errors: Vec<String>,
}

/// Handed to the work run inside [`SessionManager::with_session`].
#[derive(Clone)]
pub struct SessionScope {
    pub session_id: SessionId,
    pub provider: Arc<dyn StateProvider>,
    pub degraded: bool,
}

pub struct SessionManager {
    config: Config,
    provider: Arc<dyn StateProvider>,
    snapshot: Option<Arc<SnapshotSync>>,
    sync: Option<SyncHandle>,
    degraded: bool,
    started_at: Option<DateTime<Utc>>,
}

impl SessionManager {
    /// Remote providers with `fallback_to_file` get a snapshot mirror under
    /// `.tether/snapshot/`.
    pub fn new(config: &Config, provider: Arc<dyn StateProvider>) -> Result<Self, OrchestratorError> {
        let section = &config.toml.state_provider;
        let snapshot = if section.provider_type.is_remote() && section.fallback_to_file {
            let mirror = Arc::new(FileProvider::new(&config.snapshot_dir)?);
            Some(Arc::new(SnapshotSync::new(provider.clone(), mirror)))
        } else {
            None
        };
        Ok(Self {
            config: config.clone(),
            provider,
            snapshot,
            sync: None,
            degraded: false,
            started_at: None,
        })
    }

    /// The provider to use: the remote one, or the snapshot in degraded mode.
    pub fn provider(&self) -> Arc<dyn StateProvider> {
        self.provider.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    fn load_marker(&self) -> Result<Option<MarkerFile>, OrchestratorError> {
        Ok(MarkerFile::load(&self.config.marker_file)?)
    }

    fn save_marker(&self, marker: &MarkerFile) -> Result<(), OrchestratorError> {
        marker.save(&self.config.marker_file)?;
        Ok(())
    }

    /// Decide between a new project, a resumed one and degraded mode.
    ///
    /// `requirements` is only read when the project turns out to be new.
    pub async fn recover(
        &mut self,
        requirements: Option<&str>,
    ) -> Result<RecoveryReport, OrchestratorError> {
        let marker = self.load_marker()?;
        if let Some(m) = &marker
            && !m.matches(&self.config.toml.state_provider)
        {
            tracing::warn!(
                recorded = %m.state_provider.provider_type,
                configured = %self.config.toml.state_provider.provider_type,
                "marker was written for a different state provider"
            );
        }

        let fetched = self.provider.get_meta().await;
        let meta = match fetched {
            Ok(meta) => meta,
            Err(e @ (StateError::ProviderUnavailable { .. } | StateError::RateLimited { .. })) => {
                return self.enter_degraded(marker, e).await;
            }
            Err(e) => return Err(e.into()),
        };

        let Some(meta) = meta else {
            if let Some(m) = &marker {
                tracing::warn!("marker present but provider has no META; treating as a new project");
                if let Some(since) = m.degraded_since {
                    tracing::warn!(%since, "discarding degraded-mode snapshot; the provider lost its META");
                }
            }
            let document = requirements.ok_or(OrchestratorError::NotInitialized)?;
            Initializer::new(self.provider.clone()).run(document).await?;
            self.save_marker(&MarkerFile::new(&self.config.toml.state_provider))?;
            self.sync_snapshot().await;
            return self.report(RecoveryCase::Initialized, None).await;
        };

        let mut marker = match marker {
            Some(marker) => marker,
            None => {
                tracing::info!("provider already holds META; rewriting missing marker");
                let marker = MarkerFile::new(&self.config.toml.state_provider);
                self.save_marker(&marker)?;
                marker
            }
        };
        let replayed = self.replay_degraded(&mut marker).await?;
        // A replay changed the provider; the report must read it fresh.
        let meta = replayed.is_none().then_some(meta);
        self.sync_snapshot().await;
        let mut report = self.report(RecoveryCase::Resumed, meta).await?;
        report.replayed = replayed;
        report.warnings = partial_progress(&report.tasks, &report.meta, marker.last_session.as_ref());
        for warning in &report.warnings {
            tracing::warn!(task = %warning.task_id, "possible partial progress: {}", warning);
        }
        Ok(report)
    }

    async fn enter_degraded(
        &mut self,
        marker: Option<MarkerFile>,
        cause: StateError,
    ) -> Result<RecoveryReport, OrchestratorError> {
        let (Some(mut marker), Some(snapshot)) = (marker, self.snapshot.clone()) else {
            return Err(cause.into());
        };
        let mirror = snapshot.mirror();
        let Some(meta) = mirror.get_meta().await? else {
            tracing::error!("provider unreachable and no local snapshot exists");
            return Err(cause.into());
        };
        if marker.degraded_since.is_none() {
            marker.degraded_since = Some(Utc::now());
            self.save_marker(&marker)?;
        }
        tracing::warn!(
            error = %cause,
            last_synced = ?snapshot.last_synced(),
            "state provider unreachable; continuing on local snapshot"
        );
        let local: Arc<dyn StateProvider> = mirror;
        self.provider = local;
        self.degraded = true;
        let mut report = self.report(RecoveryCase::Degraded, Some(meta)).await?;
        report.stale_fields = STALE_FIELDS.to_vec();
        report.warnings = partial_progress(&report.tasks, &report.meta, marker.last_session.as_ref());
        Ok(report)
    }

    /// Push writes made on the snapshot in degraded mode back to the provider.
    ///
    /// On failure the marker keeps its flag and the snapshot is left alone, so
    /// nothing is overwritten until the replay succeeds.
    async fn replay_degraded(
        &self,
        marker: &mut MarkerFile,
    ) -> Result<Option<ReplayReport>, OrchestratorError> {
        let (Some(since), Some(snapshot)) = (marker.degraded_since, &self.snapshot) else {
            return Ok(None);
        };
        let replayed = snapshot.replay(since).await.inspect_err(|e| {
            tracing::error!(error = %e, "could not replay degraded-mode changes; keeping local snapshot");
        })?;
        tracing::info!(
            created = replayed.tasks_created,
            updated = replayed.tasks_updated,
            comments = replayed.comments,
            conflicts = replayed.conflicts.len(),
            "replayed degraded-mode changes to the state provider"
        );
        for conflict in &replayed.conflicts {
            tracing::warn!("degraded-mode change not applied: {}", conflict);
        }
        marker.degraded_since = None;
        self.save_marker(marker)?;
        Ok(Some(replayed))
    }

    async fn report(
        &self,
        case: RecoveryCase,
        meta: Option<Meta>,
    ) -> Result<RecoveryReport, OrchestratorError> {
        let meta = match meta {
            Some(meta) => meta,
            None => self
                .provider
                .get_meta()
                .await?
                .ok_or(OrchestratorError::NotInitialized)?,
        };
        let tasks = self.provider.get_tasks(&TaskFilter::all()).await?;
        Ok(RecoveryReport {
            case,
            progress: ProgressSummary::from_tasks(&tasks),
            meta,
            tasks,
            warnings: Vec::new(),
            stale_fields: Vec::new(),
            replayed: None,
        })
    }

    async fn sync_snapshot(&self) {
        if self.degraded {
            return;
        }
        if let Some(snapshot) = &self.snapshot
            && let Err(e) = snapshot.sync_once().await
        {
            tracing::warn!(error = %e, "failed to refresh local snapshot");
        }
    }

    /// Open a session. A dangling previous session is an error unless `resume`.
    pub async fn start_session(&mut self, resume: bool) -> Result<SessionId, OrchestratorError> {
        let mut marker = self
            .load_marker()?
            .ok_or(OrchestratorError::NotInitialized)?;

        if let Some(dangling) = marker.dangling_session().map(str::to_string) {
            if !resume {
                return Err(OrchestratorError::DanglingSession {
                    session_id: dangling,
                });
            }
            match self
                .provider
                .abandon_session(&dangling, "process exited before the handoff was written")
                .await
            {
                Ok(()) => tracing::info!(session = %dangling, "closed abandoned session"),
                Err(StateError::NotFound { .. }) => {
                    tracing::warn!(session = %dangling, "abandoned session not found on provider")
                }
                Err(e) => return Err(e.into()),
            }
            if let Some(last) = marker.last_session.as_mut() {
                last.ended_at = Some(Utc::now());
            }
        }

        let session_id = self.provider.start_session().await?;
        let now = Utc::now();
        marker.last_session = Some(LastSession {
            id: session_id.clone(),
            started_at: now,
            ended_at: None,
            tasks_completed: 0,
        });
        self.save_marker(&marker)?;
        self.started_at = Some(now);

        let every = self.config.toml.state_provider.sync_interval_seconds;
        if !self.degraded
            && every > 0
            && let Some(snapshot) = &self.snapshot
        {
            self.sync = Some(snapshot.clone().spawn(Duration::from_secs(every)));
        }
        tracing::info!(session = %session_id, degraded = self.degraded, "session started");
        Ok(session_id)
    }

    /// Write the handoff comment, persist any pending checkpoint and close the session.
    ///
    /// Every step is attempted even when an earlier one fails; the first
    /// failure is returned.
    pub async fn end_session(&mut self, handoff: Handoff) -> Result<(), OrchestratorError> {
        if let Some(sync) = self.sync.take() {
            sync.stop();
        }
        let session = self
            .provider
            .active_session()
            .await?
            .ok_or(StateError::NoActiveSession)?;
        let ended_at = Utc::now();
        let comment = self.handoff_comment(&session.session_id, session.tasks_completed, ended_at, &handoff);
        let provider = self.provider.clone();
        let mut first_error: Option<OrchestratorError> = None;

        if let Err(e) = retry_conflicts("handoff comment", || provider.add_session_comment(&comment)).await {
            tracing::error!(error = %e, "failed to write handoff comment");
            first_error.get_or_insert(e.into());
        }

        let pending = handoff.pending_checkpoint.clone();
        if let Err(e) = retry_conflicts("pending checkpoint", || {
            provider.update_meta(MetaPatch {
                pending_checkpoint: Some(pending.clone()),
                ..MetaPatch::default()
            })
        })
        .await
        {
            tracing::error!(error = %e, "failed to persist pending checkpoint");
            first_error.get_or_insert(e.into());
        }

        if let Err(e) = provider.end_session(&handoff.summary).await {
            tracing::error!(error = %e, "failed to close session");
            first_error.get_or_insert(e.into());
        }

        match self.load_marker() {
            Ok(Some(mut marker)) => {
                marker.last_session = Some(LastSession {
                    id: session.session_id.clone(),
                    started_at: session.started_at,
                    ended_at: Some(ended_at),
                    tasks_completed: session.tasks_completed,
                });
                if let Err(e) = self.save_marker(&marker) {
                    first_error.get_or_insert(e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        self.sync_snapshot().await;
        self.started_at = None;
        tracing::info!(
            session = %session.session_id,
            tasks_completed = session.tasks_completed,
            "session ended"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn handoff_comment(
        &self,
        session_id: &str,
        tasks_completed: u32,
        ended_at: DateTime<Utc>,
        handoff: &Handoff,
    ) -> String {
        let started = self
            .started_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());
        let open = if handoff.open_tasks.is_empty() {
            "none".to_string()
        } else {
            handoff.open_tasks.join(", ")
        };
        let pending = handoff
            .pending_checkpoint
            .as_ref()
            .map(|c| c.summary())
            .unwrap_or_else(|| "none".to_string());

        let mut lines = vec![
            format!("## Session {} handoff", session_id),
            String::new(),
            format!("- Started: {}", started),
            format!("- Ended: {}", ended_at.to_rfc3339()),
            format!("- Tasks completed: {}", tasks_completed),
            format!("- Open tasks: {}", open),
            format!("- Pending checkpoint: {}", pending),
        ];
        if self.degraded {
            lines.push(format!(
                "- Degraded: ran on local snapshot (stale: {})",
                STALE_FIELDS.join(", ")
            ));
        }
        if !handoff.errors.is_empty() {
            lines.push("- Unresolved errors:".to_string());
            lines.extend(handoff.errors.iter().map(|e| format!("  - {}", e)));
        }
        if !handoff.summary.is_empty() {
            lines.push(String::new());
            lines.push(handoff.summary.clone());
        }
        lines.join("\n")
    }

    /// Run `work` inside a session and write the handoff however it exits.
    ///
    /// `work` returns its result together with the handoff it wants recorded.
    /// Errors and panics are appended to the handoff before it is written.
    pub async fn with_session<T, F, Fut>(
        &mut self,
        resume: bool,
        work: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce(SessionScope) -> Fut,
        Fut: Future<Output = (Result<T, OrchestratorError>, Handoff)>,
    {
        let session_id = self.start_session(resume).await?;
        let scope = SessionScope {
            session_id,
            provider: self.provider.clone(),
            degraded: self.degraded,
        };

        let (result, mut handoff) = match AssertUnwindSafe(work(scope)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => (
                Err(OrchestratorError::Agent("session work panicked".to_string())),
                Handoff {
                    summary: "Session terminated abnormally.".to_string(),
                    ..Handoff::default()
                },
            ),
        };
        if let Err(e) = &result {
            handoff.errors.push(e.to_string());
        }

        let ended = self.end_session(handoff).await;
        let value = result?;
        ended?;
        Ok(value)
    }

    /// Append an architecture decision to META.
    pub async fn record_decision(&self, decision: &str, rationale: &str) -> Result<(), OrchestratorError> {
        retry_conflicts("record decision", || {
            self.provider
                .update_meta(MetaPatch::decision(decision, rationale))
        })
        .await?;
        Ok(())
    }
}

/// In-progress tasks the last session's history never mentions.
fn partial_progress(tasks: &[Task], meta: &Meta, last: Option<&LastSession>) -> Vec<PartialProgress> {
    let recent: Vec<&str> = match last {
        Some(last) => meta
            .comments_for_session(&last.id)
            .map(|c| c.body.as_str())
            .collect(),
        None => Vec::new(),
    };
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .filter(|t| !recent.iter().any(|body| mentions(body, &t.id)))
        .map(|t| PartialProgress {
            task_id: t.id.clone(),
            title: t.title.clone(),
            criteria: criteria_progress(t),
        })
        .collect()
}

/// `T-1` must not match inside `T-12`, and a numeric id like `7` must not
/// match the digits of a timestamp.
fn mentions(body: &str, id: &str) -> bool {
    let numeric = id.starts_with(|c: char| c.is_ascii_digit());
    body.match_indices(id).any(|(at, _)| {
        let before_ok = body[..at].chars().next_back().is_none_or(|c| {
            !c.is_ascii_alphanumeric() && !(numeric && matches!(c, '-' | ':' | '.' | '+'))
        });
        let after_ok = body[at + id.len()..].chars().next().is_none_or(|c| {
            !c.is_ascii_alphanumeric() && !(numeric && matches!(c, '-' | ':' | '.' | '+'))
        });
        before_ok && after_ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderType, TetherToml};
    use crate::provider::retry::RetryPolicy;
    use crate::provider::tracker::TrackerProvider;
    use crate::provider::tracker::fake::FakeTracker;
    use crate::task::TaskPatch;
    use crate::task::tests::payload;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn file_setup() -> (TempDir, Config, Arc<dyn StateProvider>) {
        let dir = TempDir::new().unwrap();
        let config = Config::with_toml(dir.path().to_path_buf(), TetherToml::default(), false);
        let provider: Arc<dyn StateProvider> =
            Arc::new(FileProvider::new(&config.state_dir).unwrap());
        (dir, config, provider)
    }

    async fn seed(provider: &dyn StateProvider, titles: &[&str]) -> Vec<TaskId> {
        provider.update_meta(MetaPatch::focus("Login")).await.unwrap();
        let mut ids = Vec::new();
        for title in titles {
            ids.push(provider.create_task(payload(title)).await.unwrap());
        }
        ids
    }

    async fn advance(provider: &dyn StateProvider, id: &str, to: &[TaskStatus]) {
        for status in to {
            provider.update_task(id, TaskPatch::status(*status)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_new_project_without_requirements_is_not_initialized() {
        let (_dir, config, provider) = file_setup();
        let mut manager = SessionManager::new(&config, provider).unwrap();
        let err = manager.recover(None).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotInitialized));
        assert!(!config.marker_file.exists());
    }

    #[tokio::test]
    async fn test_meta_without_marker_rewrites_marker() {
        let (_dir, config, provider) = file_setup();
        seed(provider.as_ref(), &["Implement login form"]).await;

        let mut manager = SessionManager::new(&config, provider).unwrap();
        let report = manager.recover(None).await.unwrap();
        assert_eq!(report.case, RecoveryCase::Resumed);
        assert!(MarkerFile::load(&config.marker_file).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recovery_progress_matches_pre_reset_summary() {
        let (_dir, config, provider) = file_setup();
        let ids = seed(
            provider.as_ref(),
            &["Implement login form", "Implement logout button", "Implement signup form"],
        )
        .await;

        let mut manager = SessionManager::new(&config, provider.clone()).unwrap();
        manager.recover(None).await.unwrap();
        manager.start_session(false).await.unwrap();
        advance(provider.as_ref(), &ids[0], &[TaskStatus::InProgress, TaskStatus::Done]).await;
        advance(provider.as_ref(), &ids[1], &[TaskStatus::InProgress, TaskStatus::Done]).await;
        advance(provider.as_ref(), &ids[2], &[TaskStatus::InProgress]).await;
        let before = provider.get_progress_summary().await.unwrap();
        manager
            .end_session(Handoff {
                summary: "Two features done".into(),
                open_tasks: vec![ids[2].clone()],
                ..Handoff::default()
            })
            .await
            .unwrap();

        // fresh process: new provider instance over the same files
        let provider: Arc<dyn StateProvider> =
            Arc::new(FileProvider::new(&config.state_dir).unwrap());
        let mut manager = SessionManager::new(&config, provider).unwrap();
        let report = manager.recover(None).await.unwrap();
        assert_eq!(report.case, RecoveryCase::Resumed);
        assert_eq!(report.progress, before);
        assert_eq!(report.progress.done, 2);
        assert_eq!(report.progress.in_progress, 1);
        assert!(report.warnings.is_empty(), "handoff lists the open task");

        let marker = MarkerFile::load(&config.marker_file).unwrap().unwrap();
        let last = marker.last_session.unwrap();
        assert!(last.ended_at.is_some());
        assert_eq!(last.tasks_completed, 2);
    }

    #[tokio::test]
    async fn test_unexplained_in_progress_task_is_flagged() {
        let (_dir, config, provider) = file_setup();
        let ids = seed(provider.as_ref(), &["Implement login form"]).await;
        advance(provider.as_ref(), &ids[0], &[TaskStatus::InProgress]).await;
        provider
            .update_task(&ids[0], TaskPatch::comment("- [x] #1"))
            .await
            .unwrap();

        let mut manager = SessionManager::new(&config, provider).unwrap();
        let report = manager.recover(None).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        let warning = &report.warnings[0];
        assert_eq!(warning.task_id, ids[0]);
        assert_eq!(warning.criteria.done(), 1);
        assert_eq!(
            report.tasks[0].status,
            TaskStatus::InProgress,
            "recovery never reverts status"
        );
    }

    #[tokio::test]
    async fn test_dangling_session_requires_resume() {
        let (_dir, config, provider) = file_setup();
        seed(provider.as_ref(), &["Implement login form"]).await;
        let mut manager = SessionManager::new(&config, provider).unwrap();
        manager.recover(None).await.unwrap();
        let crashed = manager.start_session(false).await.unwrap();

        let provider: Arc<dyn StateProvider> =
            Arc::new(FileProvider::new(&config.state_dir).unwrap());
        let mut manager = SessionManager::new(&config, provider.clone()).unwrap();
        manager.recover(None).await.unwrap();
        match manager.start_session(false).await {
            Err(OrchestratorError::DanglingSession { session_id }) => assert_eq!(session_id, crashed),
            other => panic!("expected DanglingSession, got {:?}", other.map(|_| ())),
        }

        let fresh = manager.start_session(true).await.unwrap();
        assert_ne!(fresh, crashed);
        let sessions = provider.list_sessions().await.unwrap();
        let old = sessions.iter().find(|s| s.session_id == crashed).unwrap();
        assert!(!old.is_active());
    }

    #[tokio::test]
    async fn test_with_session_writes_handoff_on_error() {
        let (_dir, config, provider) = file_setup();
        seed(provider.as_ref(), &["Implement login form"]).await;
        let mut manager = SessionManager::new(&config, provider.clone()).unwrap();
        manager.recover(None).await.unwrap();

        let result: Result<(), _> = manager
            .with_session(false, |scope| async move {
                assert!(!scope.degraded);
                (
                    Err(OrchestratorError::Agent("agent exited with status 2".into())),
                    Handoff {
                        summary: "Stopped early".into(),
                        ..Handoff::default()
                    },
                )
            })
            .await;
        assert!(result.is_err());

        let meta = provider.get_meta().await.unwrap().unwrap();
        let handoff = meta
            .session_history
            .iter()
            .find(|c| c.body.contains("handoff"))
            .unwrap();
        assert!(handoff.body.contains("agent exited with status 2"));
        assert!(provider.active_session().await.unwrap().is_none());
        let marker = MarkerFile::load(&config.marker_file).unwrap().unwrap();
        assert!(marker.dangling_session().is_none());
    }

    #[tokio::test]
    async fn test_unresolved_checkpoint_persisted_to_meta() {
        let (_dir, config, provider) = file_setup();
        seed(provider.as_ref(), &["Implement login form"]).await;
        let mut manager = SessionManager::new(&config, provider.clone()).unwrap();
        manager.recover(None).await.unwrap();
        manager.start_session(false).await.unwrap();

        let checkpoint = Checkpoint {
            kind: crate::checkpoint::CheckpointType::Event,
            reasons: vec!["regression suite failed".into()],
            raised_at: Utc::now(),
            turn: 7,
            task_id: None,
            resolution: None,
            resolved_at: None,
            note: None,
        };
        manager
            .end_session(Handoff {
                pending_checkpoint: Some(checkpoint.clone()),
                ..Handoff::default()
            })
            .await
            .unwrap();
        let meta = provider.get_meta().await.unwrap().unwrap();
        assert_eq!(meta.pending_checkpoint, Some(checkpoint));
    }

    #[tokio::test]
    async fn test_record_decision_appends() {
        let (_dir, config, provider) = file_setup();
        seed(provider.as_ref(), &["Implement login form"]).await;
        let manager = SessionManager::new(&config, provider.clone()).unwrap();
        manager
            .record_decision("Use JWT for sessions", "Stateless API servers")
            .await
            .unwrap();
        let meta = provider.get_meta().await.unwrap().unwrap();
        assert_eq!(meta.architecture_decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_provider_falls_back_to_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut toml = TetherToml::default();
        toml.state_provider.provider_type = ProviderType::Github;
        toml.state_provider.repository = Some("acme/widgets".into());
        toml.state_provider.sync_interval_seconds = 0;
        let config = Config::with_toml(dir.path().to_path_buf(), toml, false);

        let tracker = Arc::new(FakeTracker::default());
        let remote: Arc<dyn StateProvider> = Arc::new(TrackerProvider::new(
            tracker.clone(),
            Duration::ZERO,
            RetryPolicy::immediate(0),
        ));
        seed(remote.as_ref(), &["Implement login form"]).await;

        let mut manager = SessionManager::new(&config, remote.clone()).unwrap();
        manager.recover(None).await.unwrap();

        tracker.outage.store(true, Ordering::SeqCst);
        let mut manager = SessionManager::new(&config, remote.clone()).unwrap();
        let report = manager.recover(None).await.unwrap();
        assert_eq!(report.case, RecoveryCase::Degraded);
        assert!(manager.is_degraded());
        assert_eq!(report.tasks.len(), 1);
        assert_eq!(report.stale_fields, STALE_FIELDS.to_vec());
        assert_eq!(manager.provider().kind(), "file");
    }

    #[tokio::test]
    async fn test_degraded_writes_replayed_when_provider_returns() {
        let dir = TempDir::new().unwrap();
        let mut toml = TetherToml::default();
        toml.state_provider.provider_type = ProviderType::Github;
        toml.state_provider.repository = Some("acme/widgets".into());
        toml.state_provider.sync_interval_seconds = 0;
        let config = Config::with_toml(dir.path().to_path_buf(), toml, false);

        let tracker = Arc::new(FakeTracker::default());
        let remote: Arc<dyn StateProvider> = Arc::new(TrackerProvider::new(
            tracker.clone(),
            Duration::ZERO,
            RetryPolicy::immediate(0),
        ));
        let ids = seed(remote.as_ref(), &["Implement login form"]).await;
        let mut manager = SessionManager::new(&config, remote.clone()).unwrap();
        manager.recover(None).await.unwrap();

        tracker.outage.store(true, Ordering::SeqCst);
        let mut manager = SessionManager::new(&config, remote.clone()).unwrap();
        assert_eq!(manager.recover(None).await.unwrap().case, RecoveryCase::Degraded);
        let local = manager.provider();
        advance(local.as_ref(), &ids[0], &[TaskStatus::InProgress]).await;
        local
            .update_task(&ids[0], TaskPatch::comment("Form renders; validation pending"))
            .await
            .unwrap();
        local.create_task(payload("Add logout button")).await.unwrap();
        let marker = MarkerFile::load(&config.marker_file).unwrap().unwrap();
        assert!(marker.degraded_since.is_some());

        tracker.outage.store(false, Ordering::SeqCst);
        let mut manager = SessionManager::new(&config, remote.clone()).unwrap();
        let report = manager.recover(None).await.unwrap();
        assert_eq!(report.case, RecoveryCase::Resumed);
        let replayed = report.replayed.unwrap();
        assert_eq!(replayed.tasks_created, 1);
        assert!(replayed.conflicts.is_empty());

        let task = remote.get_task(&ids[0]).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(
            task.comments
                .iter()
                .any(|c| c.body == "Form renders; validation pending")
        );
        assert!(report.tasks.iter().any(|t| t.title == "Add logout button"));

        // The refreshed snapshot now mirrors the provider and the flag is cleared.
        let marker = MarkerFile::load(&config.marker_file).unwrap().unwrap();
        assert!(marker.degraded_since.is_none());
        let mirrored = manager.snapshot.as_ref().unwrap().mirror();
        let mirrored = mirrored.get_task(&ids[0]).await.unwrap().unwrap();
        assert_eq!(mirrored.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_unreachable_provider_without_fallback_fails_fast() {
        let dir = TempDir::new().unwrap();
        let mut toml = TetherToml::default();
        toml.state_provider.provider_type = ProviderType::Github;
        toml.state_provider.fallback_to_file = false;
        let config = Config::with_toml(dir.path().to_path_buf(), toml.clone(), false);
        MarkerFile::new(&toml.state_provider)
            .save(&config.marker_file)
            .unwrap();

        let tracker = Arc::new(FakeTracker::default());
        tracker.outage.store(true, Ordering::SeqCst);
        let remote: Arc<dyn StateProvider> = Arc::new(TrackerProvider::new(
            tracker,
            Duration::ZERO,
            RetryPolicy::immediate(0),
        ));
        let mut manager = SessionManager::new(&config, remote).unwrap();
        let err = manager.recover(None).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::State(StateError::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn test_mentions_respects_id_boundaries() {
        assert!(mentions("Open tasks: T-1, T-3", "T-1"));
        assert!(!mentions("Open tasks: T-12", "T-1"));
        assert!(mentions("worked on T-3", "T-3"));
        assert!(!mentions("see AT-3", "T-3"));
    }

    #[test]
    fn test_mentions_numeric_ids() {
        let handoff = "Session S-20260304T050607089Z ended\n- Started: 2026-03-04T05:06:07.089+00:00\n- Tasks: none";
        assert!(!mentions(handoff, "7"));
        assert!(!mentions(handoff, "89"));
        assert!(!mentions(handoff, "2026"));
        assert!(mentions("- Open tasks: 7, 12", "7"));
        assert!(mentions("- Open tasks: 7, 12", "12"));
        assert!(!mentions("- Open tasks: 17, 72", "7"));
        assert!(mentions("Started in session: #7", "7"));
    }
}
