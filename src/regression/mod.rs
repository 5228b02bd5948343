//! Regression-first gate.
//!
//! While META's `regression_status` is `failing`, the only task that may be
//! worked on is the linked priority-1 fix task. `failing` is never recorded
//! without a fix task, and a fix task is never left behind without `failing`.

pub mod cause;

pub use cause::{CauseFinder, GitCauseFinder};

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::RegressionTesting;
use crate::errors::{OrchestratorError, StateResult};
use crate::meta::{Meta, MetaPatch, RegressionDetails, RegressionStatus};
use crate::provider::{StateProvider, retry_conflicts};
use crate::task::{Category, Priority, Task, TaskFilter, TaskId, TaskPayload, TaskStatus};

/// Label carried by every auto-created fix task.
pub const REGRESSION_FIX_LABEL: &str = "regression-fix";
/// `regression:<test id>` ties a fix task to the check it repairs.
pub const REGRESSION_LABEL_PREFIX: &str = "regression:";

/// Attempts at writing the fix task and the failing status together.
const PAIR_ATTEMPTS: u32 = 3;

const MAX_TEST_IN_TITLE: usize = 80;
/// GitHub rejects longer label names.
const MAX_LABEL_CHARS: usize = 50;
/// Hex digits of the test id's digest kept in a shortened label.
const LABEL_HASH_CHARS: usize = 12;

/// `regression:<test id>`, or a prefix of the id plus a digest when too long.
pub fn regression_label(test: &str) -> String {
    let label = format!("{}{}", REGRESSION_LABEL_PREFIX, test);
    if label.chars().count() <= MAX_LABEL_CHARS {
        return label;
    }
    let mut hasher = Sha256::new();
    hasher.update(test.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let keep = MAX_LABEL_CHARS - REGRESSION_LABEL_PREFIX.len() - LABEL_HASH_CHARS - 1;
    let head: String = test.chars().take(keep).collect();
    format!("{}{}~{}", REGRESSION_LABEL_PREFIX, head, &digest[..LABEL_HASH_CHARS])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    /// New work may be picked
    Clear,
    /// A verification run must happen before any task is picked
    BaselineRequired,
    /// Only the fix task may be worked on
    Blocked { fix_task: TaskId },
}

pub struct RegressionGate {
    provider: Arc<dyn StateProvider>,
    mode: RegressionTesting,
    cause_finder: Option<Box<dyn CauseFinder>>,
}

impl RegressionGate {
    pub fn new(provider: Arc<dyn StateProvider>, mode: RegressionTesting) -> Self {
        Self {
            provider,
            mode,
            cause_finder: None,
        }
    }

    pub fn with_cause_finder(mut self, finder: Box<dyn CauseFinder>) -> Self {
        self.cause_finder = Some(finder);
        self
    }

    pub fn mode(&self) -> RegressionTesting {
        self.mode
    }

    pub async fn status(&self) -> StateResult<RegressionStatus> {
        Ok(self
            .provider
            .get_meta()
            .await?
            .map(|m| m.regression_status)
            .unwrap_or_default())
    }

    /// Gate state for `meta`. `session_start` asks for a fresh baseline when
    /// regression testing is `required`.
    pub fn assess(&self, meta: &Meta, session_start: bool) -> GateState {
        match meta.regression_status {
            RegressionStatus::Failing => match &meta.regression_details {
                Some(details) => GateState::Blocked {
                    fix_task: details.fix_task.clone(),
                },
                // failing without a fix task: re-verify to rebuild the pair
                None => GateState::BaselineRequired,
            },
            _ if self.mode == RegressionTesting::Disabled => GateState::Clear,
            RegressionStatus::Unknown => GateState::BaselineRequired,
            RegressionStatus::Passing
                if session_start && self.mode == RegressionTesting::Required =>
            {
                GateState::BaselineRequired
            }
            RegressionStatus::Passing => GateState::Clear,
        }
    }

    /// Record a failing check: find or create its fix task, then mark META failing.
    ///
    /// Returns the fix task id. When META cannot be written, a fix task
    /// created by this call is deleted again before the pair is retried.
    pub async fn record_failure(&self, test: &str) -> Result<TaskId, OrchestratorError> {
        let likely_cause = self
            .cause_finder
            .as_ref()
            .and_then(|f| f.find_likely_cause(test));
        if let Some(cause) = &likely_cause {
            tracing::info!(test, cause = %cause, "likely cause of regression");
        }

        let mut attempt = 1;
        loop {
            let (fix_task, created) = match self.find_fix_task(test).await? {
                Some(id) => (id, false),
                None => (self.provider.create_task(fix_payload(test, likely_cause.as_deref())).await?, true),
            };

            let since = self
                .provider
                .get_meta()
                .await?
                .and_then(|m| m.regression_details)
                .filter(|d| d.test == test)
                .map(|d| d.since)
                .unwrap_or_else(Utc::now);
            let details = RegressionDetails {
                test: test.to_string(),
                since,
                fix_task: fix_task.clone(),
                likely_cause: likely_cause.clone(),
            };
            let written = retry_conflicts("record regression", || {
                self.provider.update_meta(MetaPatch {
                    regression_status: Some(RegressionStatus::Failing),
                    regression_details: Some(Some(details.clone())),
                    ..MetaPatch::default()
                })
            })
            .await;

            match written {
                Ok(()) => {
                    tracing::warn!(test, fix_task = %fix_task, "regression recorded");
                    return Ok(fix_task);
                }
                Err(e) => {
                    if created && let Err(cleanup) = self.provider.delete_task(&fix_task).await {
                        tracing::error!(task = %fix_task, error = %cleanup, "failed to remove orphaned fix task");
                    }
                    if attempt >= PAIR_ATTEMPTS || !(e.is_transient() || e.is_conflict()) {
                        return Err(e.into());
                    }
                    tracing::warn!(attempt, error = %e, "regression pair not written, retrying");
                    attempt += 1;
                }
            }
        }
    }

    /// Open fix task for `test`, if one exists.
    async fn find_fix_task(&self, test: &str) -> StateResult<Option<TaskId>> {
        let filter = TaskFilter {
            labels: vec![
                REGRESSION_FIX_LABEL.to_string(),
                regression_label(test),
            ],
            ..TaskFilter::all()
        };
        Ok(self
            .provider
            .get_tasks(&filter)
            .await?
            .into_iter()
            .find(|t| t.status != TaskStatus::Done && t.superseded_by().is_none())
            .map(|t| t.id))
    }

    /// Record a successful revalidation run.
    pub async fn record_passing(&self) -> StateResult<()> {
        retry_conflicts("record passing", || {
            self.provider.update_meta(MetaPatch {
                regression_status: Some(RegressionStatus::Passing),
                regression_details: Some(None),
                ..MetaPatch::default()
            })
        })
        .await?;
        tracing::info!("regression suite passing");
        Ok(())
    }
}

fn fix_payload(test: &str, likely_cause: Option<&str>) -> TaskPayload {
    let short: String = test.chars().take(MAX_TEST_IN_TITLE).collect();
    let mut description = format!(
        "The regression check `{}` started failing. Restore it before any new feature work.",
        test
    );
    if let Some(cause) = likely_cause {
        description.push_str(&format!("\n\nLikely cause: {}", cause));
    }
    TaskPayload {
        title: format!("Fix regression: {}", short),
        description,
        acceptance_criteria: vec![
            format!("Regression check `{}` passes again", test),
            "The full regression suite passes after the fix".to_string(),
        ],
        test_steps: vec!["Run the regression suite and confirm it exits successfully".to_string()],
        priority: Priority::URGENT.get(),
        category: Category::Bugfix,
        labels: vec![
            REGRESSION_FIX_LABEL.to_string(),
            regression_label(test),
        ],
        dependencies: Vec::new(),
    }
}

/// Task the driver should work on next.
///
/// While failing, only the linked fix task is eligible. Otherwise an
/// in-progress task is resumed first; then the ready `todo` task with the
/// lowest priority number wins, earlier creation breaking ties.
pub fn next_task<'a>(tasks: &'a [Task], meta: &Meta) -> Option<&'a Task> {
    if meta.regression_status == RegressionStatus::Failing {
        let fix = meta.regression_details.as_ref()?;
        return tasks.iter().find(|t| {
            t.id == fix.fix_task && matches!(t.status, TaskStatus::Todo | TaskStatus::InProgress)
        });
    }

    if let Some(resumed) = tasks.iter().find(|t| t.status == TaskStatus::InProgress) {
        return Some(resumed);
    }

    let is_done = |id: &str| {
        tasks
            .iter()
            .any(|t| t.id == id && t.status == TaskStatus::Done)
    };
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Todo)
        .filter(|t| t.dependencies.iter().all(|d| is_done(d)))
        .min_by_key(|t| t.priority)
}

/// Refuse to start `task` while the regression status is failing, unless it is the fix.
pub fn require_clear(meta: &Meta, task: &Task) -> Result<(), OrchestratorError> {
    if meta.regression_status != RegressionStatus::Failing {
        return Ok(());
    }
    match &meta.regression_details {
        Some(details) if details.fix_task == task.id => Ok(()),
        Some(details) => Err(OrchestratorError::RegressionBlocked {
            fix_task: details.fix_task.clone(),
        }),
        None => Err(OrchestratorError::RegressionBlocked {
            fix_task: "(none recorded)".to_string(),
        }),
    }
}
