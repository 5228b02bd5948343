//! Typed error hierarchy for tether.
//!
//! Two top-level enums cover the two layers:
//! - `StateError`: everything a state provider can report
//! - `OrchestratorError`: session, gate and driver failures

use std::time::Duration;
use thiserror::Error;

/// Errors reported by a [`crate::provider::StateProvider`].
#[derive(Debug, Error)]
pub enum StateError {
    /// Malformed task fields. Rejected before anything is persisted.
    #[error("Task validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Task {task_id} has locked requirements; cannot change {}", .fields.join(", "))]
    ImmutableFieldViolation { task_id: String, fields: Vec<String> },

    #[error("{resource} was modified concurrently (expected revision {expected}, found {found})")]
    ConcurrentModification {
        resource: String,
        expected: String,
        found: String,
    },

    #[error("State provider '{provider}' unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("State provider '{provider}' is rate limited")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Task {task_id} has unfinished dependencies: {}", .pending.join(", "))]
    DependenciesIncomplete { task_id: String, pending: Vec<String> },

    #[error("No active session")]
    NoActiveSession,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize {what}: {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StateError {
    /// Transient failures that a caller may retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::ProviderUnavailable { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::ConcurrentModification { .. })
    }

    pub fn unavailable(provider: &str, message: impl Into<String>) -> Self {
        StateError::ProviderUnavailable {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serde(what: impl Into<String>, source: serde_json::Error) -> Self {
        StateError::Serialization {
            what: what.into(),
            source,
        }
    }
}

/// Errors from the session manager, regression gate and driver.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// New feature work was requested while the regression status is failing.
    #[error("Regression status is failing; work is restricted to fix task {fix_task}")]
    RegressionBlocked { fix_task: String },

    #[error("Project not initialized. Run 'tether init --spec <file>' first.")]
    NotInitialized,

    #[error("Previous session {session_id} did not end cleanly. Run 'tether start --resume'.")]
    DanglingSession { session_id: String },

    #[error("Failed to parse requirements document: {0}")]
    Requirements(String),

    #[error("Coding agent failed: {0}")]
    Agent(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StateResult<T> = std::result::Result<T, StateError>;
