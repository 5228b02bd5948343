//! The per-project META record: cross-session knowledge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressionStatus {
    Passing,
    Failing,
    #[default]
    Unknown,
}

impl std::fmt::Display for RegressionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegressionStatus::Passing => write!(f, "passing"),
            RegressionStatus::Failing => write!(f, "failing"),
            RegressionStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionDetails {
    /// Identifier of the failing check
    pub test: String,
    pub since: DateTime<Utc>,
    pub fix_task: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likely_cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDecision {
    pub decision: String,
    pub rationale: String,
    pub timestamp: DateTime<Utc>,
}

/// One entry in the append-only session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionComment {
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub architecture_decisions: Vec<ArchitectureDecision>,
    #[serde(default)]
    pub regression_status: RegressionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regression_details: Option<RegressionDetails>,
    #[serde(default)]
    pub current_focus: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub session_history: Vec<SessionComment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Meta {
    /// Fresh META for a newly initialized project.
    pub fn initial(current_focus: impl Into<String>) -> Self {
        Self {
            current_focus: current_focus.into(),
            updated_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn apply(&mut self, patch: &MetaPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.regression_status {
            self.regression_status = status;
        }
        if let Some(details) = &patch.regression_details {
            self.regression_details = details.clone();
        }
        if let Some(focus) = &patch.current_focus {
            self.current_focus = focus.clone();
        }
        if let Some(checkpoint) = &patch.pending_checkpoint {
            self.pending_checkpoint = checkpoint.clone();
        }
        self.architecture_decisions
            .extend(patch.add_decisions.iter().cloned());
        self.updated_at = Some(now);
    }

    /// Session-history entries written by the given session.
    pub fn comments_for_session<'a>(
        &'a self,
        session_id: &'a str,
    ) -> impl Iterator<Item = &'a SessionComment> + 'a {
        self.session_history
            .iter()
            .filter(move |c| c.body.contains(session_id))
    }
}

/// Partial META update. Every field is freely mutable; decisions are appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaPatch {
    pub regression_status: Option<RegressionStatus>,
    pub regression_details: Option<Option<RegressionDetails>>,
    pub current_focus: Option<String>,
    pub pending_checkpoint: Option<Option<Checkpoint>>,
    pub add_decisions: Vec<ArchitectureDecision>,
}

impl MetaPatch {
    pub fn focus(focus: impl Into<String>) -> Self {
        Self {
            current_focus: Some(focus.into()),
            ..Self::default()
        }
    }

    pub fn decision(decision: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self {
            add_decisions: vec![ArchitectureDecision {
                decision: decision.into(),
                rationale: rationale.into(),
                timestamp: Utc::now(),
            }],
            ..Self::default()
        }
    }
}
