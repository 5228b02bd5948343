//! In-memory issue tracker used by tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{IssueDraft, IssueTracker, RemoteComment, RemoteIssue};
use crate::errors::{StateError, StateResult};

#[derive(Default)]
struct FakeState {
    tick: i64,
    issues: Vec<RemoteIssue>,
    comments: HashMap<String, Vec<RemoteComment>>,
}

impl FakeState {
    fn advance(&mut self) -> DateTime<Utc> {
        self.tick += 1;
        Utc.timestamp_opt(1_700_000_000 + self.tick, 0).unwrap()
    }

    fn touch(&mut self, id: &str) {
        let now = self.advance();
        if let Some(issue) = self.issues.iter_mut().find(|i| i.id == id) {
            issue.updated_at = now;
            issue.version = now.to_rfc3339();
        }
    }
}

/// Issues live in memory; every change bumps the issue's version.
#[derive(Default)]
pub(crate) struct FakeTracker {
    state: Mutex<FakeState>,
    /// Every call fails with `ProviderUnavailable`
    pub(crate) outage: AtomicBool,
    /// Every call fails with `RateLimited`
    pub(crate) rate_limited: AtomicBool,
    pub(crate) calls: AtomicU32,
    /// Issues `create_issue` may still create before it starts failing
    pub(crate) create_budget: Mutex<Option<usize>>,
    /// `add_comment` fails with `ProviderUnavailable`
    pub(crate) reject_comments: AtomicBool,
    /// Another writer changes this issue just before our next `update_issue`
    pub(crate) race_next_update: Mutex<Option<String>>,
}

impl FakeTracker {
    pub(crate) fn issue(&self, id: &str) -> Option<RemoteIssue> {
        let state = self.state.lock().unwrap();
        state.issues.iter().find(|i| i.id == id).cloned()
    }

    pub(crate) fn issue_by_title(&self, title: &str) -> Option<RemoteIssue> {
        let state = self.state.lock().unwrap();
        state.issues.iter().find(|i| i.title == title).cloned()
    }

    pub(crate) fn issue_count(&self) -> usize {
        self.state.lock().unwrap().issues.len()
    }

    fn gate(&self) -> StateResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.outage.load(Ordering::SeqCst) {
            return Err(StateError::unavailable("fake", "connection refused"));
        }
        if self.rate_limited.load(Ordering::SeqCst) {
            return Err(StateError::RateLimited {
                provider: "fake".into(),
                retry_after: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl IssueTracker for FakeTracker {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn list_issues(&self) -> StateResult<Vec<RemoteIssue>> {
        self.gate()?;
        Ok(self.state.lock().unwrap().issues.clone())
    }

    async fn get_issue(&self, id: &str) -> StateResult<Option<RemoteIssue>> {
        self.gate()?;
        Ok(self.issue(id))
    }

    async fn create_issue(&self, draft: &IssueDraft) -> StateResult<RemoteIssue> {
        self.gate()?;
        if let Some(budget) = self.create_budget.lock().unwrap().as_mut() {
            if *budget == 0 {
                return Err(StateError::unavailable("fake", "create rejected"));
            }
            *budget -= 1;
        }
        let mut state = self.state.lock().unwrap();
        let now = state.advance();
        let issue = RemoteIssue {
            id: (state.issues.len() + 1).to_string(),
            title: draft.title.clone(),
            body: draft.body.clone(),
            labels: draft.labels.clone(),
            open: draft.open,
            version: now.to_rfc3339(),
            created_at: now,
            updated_at: now,
        };
        state.issues.push(issue.clone());
        Ok(issue)
    }

    async fn update_issue(
        &self,
        id: &str,
        expected_version: &str,
        draft: &IssueDraft,
    ) -> StateResult<RemoteIssue> {
        self.gate()?;
        let mut state = self.state.lock().unwrap();
        if self.race_next_update.lock().unwrap().take_if(|raced| raced.as_str() == id).is_some() {
            state.touch(id);
        }
        let current = state
            .issues
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.version.clone())
            .ok_or_else(|| StateError::NotFound {
                kind: "issue",
                id: id.to_string(),
            })?;
        if current != expected_version {
            return Err(StateError::ConcurrentModification {
                resource: format!("issue {}", id),
                expected: expected_version.to_string(),
                found: current,
            });
        }
        state.touch(id);
        let issue = state
            .issues
            .iter_mut()
            .find(|i| i.id == id)
            .expect("issue exists");
        issue.title = draft.title.clone();
        issue.body = draft.body.clone();
        issue.labels = draft.labels.clone();
        issue.open = draft.open;
        Ok(issue.clone())
    }

    async fn list_comments(&self, id: &str) -> StateResult<Vec<RemoteComment>> {
        self.gate()?;
        let state = self.state.lock().unwrap();
        Ok(state.comments.get(id).cloned().unwrap_or_default())
    }

    async fn add_comment(&self, id: &str, body: &str) -> StateResult<()> {
        self.gate()?;
        if self.reject_comments.load(Ordering::SeqCst) {
            return Err(StateError::unavailable("fake", "comment rejected"));
        }
        let mut state = self.state.lock().unwrap();
        let created_at = state.advance();
        state
            .comments
            .entry(id.to_string())
            .or_default()
            .push(RemoteComment {
                body: body.to_string(),
                created_at,
            });
        state.touch(id);
        Ok(())
    }
}
