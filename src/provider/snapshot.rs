//! Local mirror of a remote provider, used when the remote is unreachable.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{FileProvider, StateProvider};
use crate::errors::{StateError, StateResult};
use crate::meta::MetaPatch;
use crate::task::{Task, TaskFilter, TaskId, TaskPatch, TaskPayload, TaskStatus, check_transition};

const SYNCED_AT_FILE: &str = "synced_at";

/// Counts from one snapshot pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotStats {
    pub tasks: usize,
    pub sessions: usize,
    pub has_meta: bool,
}

/// What [`SnapshotSync::replay`] pushed back to the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub tasks_updated: usize,
    pub tasks_created: usize,
    pub comments: usize,
    /// Local changes the remote refused; each is also posted to META's history
    pub conflicts: Vec<String>,
}

pub struct SnapshotSync {
    source: Arc<dyn StateProvider>,
    mirror: Arc<FileProvider>,
}

impl SnapshotSync {
    pub fn new(source: Arc<dyn StateProvider>, mirror: Arc<FileProvider>) -> Self {
        Self { source, mirror }
    }

    pub fn mirror(&self) -> Arc<FileProvider> {
        self.mirror.clone()
    }

    /// Copy tasks, META and sessions from the remote into the mirror.
    pub async fn sync_once(&self) -> StateResult<SnapshotStats> {
        let tasks = self.source.get_tasks(&TaskFilter::all()).await?;
        let meta = self.source.get_meta().await?;
        let sessions = self.source.list_sessions().await?;
        let stats = SnapshotStats {
            tasks: tasks.len(),
            sessions: sessions.len(),
            has_meta: meta.is_some(),
        };
        self.mirror.import_snapshot(tasks, meta, sessions)?;

        let stamp = self.stamp_path();
        std::fs::write(&stamp, Utc::now().to_rfc3339()).map_err(|e| StateError::io(&stamp, e))?;
        tracing::debug!(
            source = self.source.kind(),
            tasks = stats.tasks,
            sessions = stats.sessions,
            "snapshot synced"
        );
        Ok(stats)
    }

    /// Push changes made on the mirror since `since` (degraded mode) to the remote.
    ///
    /// Tasks keep their remote ids; tasks created locally are created remotely
    /// and references to them in dependencies and META are rewritten. Label
    /// changes are additive. A change the remote rejects is reported as a
    /// conflict instead of failing the replay; an unreachable remote fails it,
    /// so the mirror must not be overwritten.
    pub async fn replay(&self, since: DateTime<Utc>) -> StateResult<ReplayReport> {
        let mut report = ReplayReport::default();
        let remote_tasks = self.source.get_tasks(&TaskFilter::all()).await?;
        let local_tasks = self.mirror.get_tasks(&TaskFilter::all()).await?;

        let mut renamed: HashMap<TaskId, TaskId> = HashMap::new();
        for local in local_tasks.iter().filter(|t| t.created_at >= since) {
            if remote_tasks.iter().any(|r| r.id == local.id) {
                continue;
            }
            let id = self.source.create_task(payload_of(local, &renamed)).await?;
            tracing::info!(local = %local.id, remote = %id, "replayed task created in degraded mode");
            renamed.insert(local.id.clone(), id);
            report.tasks_created += 1;
        }

        for local in &local_tasks {
            let remote_id = renamed.get(&local.id).cloned().unwrap_or_else(|| local.id.clone());
            let Some(remote) = self.source.get_task(&remote_id).await? else {
                continue;
            };
            self.replay_task(local, &remote, since, &mut report).await?;
        }

        self.replay_meta(since, &renamed, &mut report).await?;

        if !report.conflicts.is_empty() {
            let body = format!(
                "Changes made in degraded mode that could not be applied:\n{}",
                report
                    .conflicts
                    .iter()
                    .map(|c| format!("- {}", c))
                    .collect::<Vec<_>>()
                    .join("\n")
            );
            self.source.add_session_comment(&body).await?;
        }
        Ok(report)
    }

    async fn replay_task(
        &self,
        local: &Task,
        remote: &Task,
        since: DateTime<Utc>,
        report: &mut ReplayReport,
    ) -> StateResult<()> {
        let mut patches = Vec::new();

        if local.status != remote.status {
            match status_path(remote, local.status) {
                Some(path) => patches.extend(path.into_iter().map(TaskPatch::status)),
                None => report.conflicts.push(format!(
                    "{}: local status {} cannot follow remote status {}",
                    remote.id, local.status, remote.status
                )),
            }
        }
        let added: Vec<String> = local
            .labels
            .iter()
            .filter(|l| !remote.has_label(l))
            .cloned()
            .collect();
        if !added.is_empty() {
            patches.push(TaskPatch {
                add_labels: added,
                ..TaskPatch::default()
            });
        }
        let new_comments: Vec<&str> = local
            .comments
            .iter()
            .filter(|c| c.created_at >= since)
            .filter(|c| !remote.comments.iter().any(|r| r.body == c.body))
            .map(|c| c.body.as_str())
            .collect();
        report.comments += new_comments.len();
        patches.extend(new_comments.into_iter().map(TaskPatch::comment));

        if patches.is_empty() {
            return Ok(());
        }
        report.tasks_updated += 1;
        for patch in patches {
            match self.source.update_task(&remote.id, patch).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::warn!(task = %remote.id, error = %e, "degraded-mode change rejected by remote");
                    report.conflicts.push(format!("{}: {}", remote.id, e));
                }
            }
        }
        Ok(())
    }

    async fn replay_meta(
        &self,
        since: DateTime<Utc>,
        renamed: &HashMap<TaskId, TaskId>,
        report: &mut ReplayReport,
    ) -> StateResult<()> {
        let (Some(local), Some(remote)) = (self.mirror.get_meta().await?, self.source.get_meta().await?) else {
            return Ok(());
        };

        let mut patch = MetaPatch {
            add_decisions: local
                .architecture_decisions
                .iter()
                .filter(|d| d.timestamp >= since)
                .filter(|d| !remote.architecture_decisions.iter().any(|r| r.decision == d.decision))
                .cloned()
                .collect(),
            ..MetaPatch::default()
        };
        if local.updated_at.is_some_and(|t| t >= since) {
            let mut details = local.regression_details.clone();
            if let Some(details) = details.as_mut()
                && let Some(id) = renamed.get(&details.fix_task)
            {
                details.fix_task = id.clone();
            }
            patch.regression_status = Some(local.regression_status);
            patch.regression_details = Some(details);
            patch.current_focus = Some(local.current_focus.clone());
            patch.pending_checkpoint = Some(local.pending_checkpoint.clone());
        }
        if patch != MetaPatch::default() {
            self.source.update_meta(patch).await?;
        }

        for comment in local.session_history.iter().filter(|c| c.created_at >= since) {
            if remote.session_history.iter().any(|r| r.body == comment.body) {
                continue;
            }
            self.source.add_session_comment(&comment.body).await?;
            report.comments += 1;
        }
        Ok(())
    }

    /// When the mirror was last refreshed, if ever.
    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        let raw = std::fs::read_to_string(self.stamp_path()).ok()?;
        DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    fn stamp_path(&self) -> PathBuf {
        self.mirror.root().join(SYNCED_AT_FILE)
    }

    /// Refresh the mirror every `every` until the handle is stopped or dropped.
    pub fn spawn(self: Arc<Self>, every: Duration) -> SyncHandle {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = self.sync_once().await {
                    tracing::warn!(error = %e, "periodic snapshot sync failed");
                }
            }
        });
        SyncHandle { handle }
    }
}

/// Statuses to apply, in order, to bring `remote` to `to`.
fn status_path(remote: &Task, to: TaskStatus) -> Option<Vec<TaskStatus>> {
    if check_transition(remote, to).is_ok() {
        return Some(vec![to]);
    }
    let mut via = remote.clone();
    check_transition(&via, TaskStatus::InProgress).ok()?;
    via.status = TaskStatus::InProgress;
    check_transition(&via, to).ok()?;
    Some(vec![TaskStatus::InProgress, to])
}

fn payload_of(task: &Task, renamed: &HashMap<TaskId, TaskId>) -> TaskPayload {
    TaskPayload {
        title: task.title.clone(),
        description: task.description.clone(),
        acceptance_criteria: task.acceptance_criteria.clone(),
        test_steps: task.test_steps.clone(),
        priority: task.priority.into(),
        category: task.category,
        labels: task.labels.clone(),
        dependencies: task
            .dependencies
            .iter()
            .map(|d| renamed.get(d).cloned().unwrap_or_else(|| d.clone()))
            .collect(),
    }
}

pub struct SyncHandle {
    handle: JoinHandle<()>,
}

impl SyncHandle {
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MetaPatch;
    use crate::provider::retry::RetryPolicy;
    use crate::provider::tracker::TrackerProvider;
    use crate::provider::tracker::fake::FakeTracker;
    use crate::task::tests::payload;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sync_copies_remote_state() {
        let remote: Arc<dyn StateProvider> = Arc::new(TrackerProvider::new(
            Arc::new(FakeTracker::default()),
            Duration::ZERO,
            RetryPolicy::immediate(0),
        ));
        remote.update_meta(MetaPatch::focus("Login")).await.unwrap();
        remote.create_task(payload("Implement login form")).await.unwrap();
        remote.start_session().await.unwrap();

        let dir = TempDir::new().unwrap();
        let mirror = Arc::new(FileProvider::new(&dir.path().join("snapshot")).unwrap());
        let sync = SnapshotSync::new(remote.clone(), mirror.clone());
        assert!(sync.last_synced().is_none());

        let stats = sync.sync_once().await.unwrap();
        assert_eq!(stats.tasks, 1);
        assert_eq!(stats.sessions, 1);
        assert!(stats.has_meta);
        assert!(sync.last_synced().is_some());

        let tasks = mirror.get_tasks(&TaskFilter::all()).await.unwrap();
        assert_eq!(tasks[0].title, "Implement login form");
        assert_eq!(mirror.get_meta().await.unwrap().unwrap().current_focus, "Login");
    }
}
