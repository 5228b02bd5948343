//! Human-in-the-loop checkpoints.
//!
//! After each turn the driver describes what happened in a [`TurnContext`];
//! [`CheckpointController::evaluate`] decides whether a checkpoint fires and
//! [`CheckpointController::resolve`] collects a decision from the configured
//! approval channels.
//!
//! Which trigger kinds are evaluated depends on the execution mode:
//!
//! | Mode          | event | task boundary | turn interval | action |
//! |---------------|:-----:|:-------------:|:-------------:|:------:|
//! | autonomous    |   x   |               |               |        |
//! | interactive   |   x   |       x       |       x       |        |
//! | supervised    |   x   |       x       |       x       |   x    |

pub mod channel;

pub use channel::{ApprovalChannel, Decision, FileChannel, LogChannel, TerminalChannel};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    CheckpointsConfig, DefaultAction, ExecutionMode, ExecutionSection, LimitsConfig,
};
use crate::task::TaskId;

/// Kind of trigger that raised a checkpoint. Ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    TurnInterval,
    TaskBoundary,
    Event,
    Action,
}

impl std::fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointType::TurnInterval => write!(f, "turn interval"),
            CheckpointType::TaskBoundary => write!(f, "task boundary"),
            CheckpointType::Event => write!(f, "event"),
            CheckpointType::Action => write!(f, "action"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Continue,
    Pause,
    Abort,
    /// Continue, with the human's note passed to the agent
    Redirect,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::Continue,
        Resolution::Pause,
        Resolution::Abort,
        Resolution::Redirect,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Continue => "continue",
            Resolution::Pause => "pause",
            Resolution::Abort => "abort",
            Resolution::Redirect => "redirect",
        }
    }

    /// Work goes on after this resolution.
    pub fn proceeds(&self) -> bool {
        matches!(self, Resolution::Continue | Resolution::Redirect)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str() == needle)
            .ok_or_else(|| {
                format!(
                    "Invalid decision '{}'. Valid values: continue, pause, abort, redirect",
                    s
                )
            })
    }
}

impl From<DefaultAction> for Resolution {
    fn from(action: DefaultAction) -> Self {
        match action {
            DefaultAction::Pause => Resolution::Pause,
            DefaultAction::Continue => Resolution::Continue,
            DefaultAction::Abort => Resolution::Abort,
        }
    }
}

/// Risky operations the agent announces before performing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    GitPush,
    FileDelete,
    Deploy,
    SchemaChange,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::GitPush => "git_push",
            ActionKind::FileDelete => "file_delete",
            ActionKind::Deploy => "deploy",
            ActionKind::SchemaChange => "schema_change",
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "git_push" => Ok(ActionKind::GitPush),
            "file_delete" => Ok(ActionKind::FileDelete),
            "deploy" => Ok(ActionKind::Deploy),
            "schema_change" => Ok(ActionKind::SchemaChange),
            other => Err(format!("Unknown action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "type")]
    pub kind: CheckpointType,
    pub reasons: Vec<String>,
    pub raised_at: DateTime<Utc>,
    pub turn: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Checkpoint {
    /// Single-line summary of every reason.
    pub fn summary(&self) -> String {
        format!("[{}] {}", self.kind, self.reasons.join("; "))
    }

    /// Resolved with anything other than `pause`; such checkpoints are not carried over.
    pub fn is_settled(&self) -> bool {
        self.resolution.is_some_and(|r| r != Resolution::Pause)
    }
}

/// What happened during the turn being evaluated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnContext {
    /// 1-based turn number within the session
    pub turn: u32,
    pub task_id: Option<TaskId>,
    /// About to start work on a task
    pub starting_task: bool,
    /// A task reached `done` this turn
    pub completed_task: bool,
    pub regression_failed: bool,
    pub blocker: Option<String>,
    pub uncertainty: Option<String>,
    pub context_percent: Option<u8>,
    /// Totals for the session so far
    pub files_modified: u32,
    pub lines_changed: u32,
    pub actions: Vec<ActionKind>,
}

/// Conditions that end a session gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLimit {
    MaxTurns(u32),
    ContextCritical(u8),
}

impl std::fmt::Display for SessionLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionLimit::MaxTurns(n) => write!(f, "turn limit of {} reached", n),
            SessionLimit::ContextCritical(p) => write!(f, "context usage at {}%", p),
        }
    }
}

pub struct CheckpointController {
    mode: ExecutionMode,
    triggers: CheckpointsConfig,
    limits: LimitsConfig,
    channels: Vec<Arc<dyn ApprovalChannel>>,
    timeout: Option<Duration>,
    default_action: Resolution,
}

impl CheckpointController {
    pub fn new(execution: &ExecutionSection, channels: Vec<Arc<dyn ApprovalChannel>>) -> Self {
        Self {
            mode: execution.mode,
            triggers: execution.checkpoints.clone(),
            limits: execution.limits.clone(),
            channels,
            timeout: execution.approval.timeout(),
            default_action: execution.approval.default_action.into(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn evaluates(&self, kind: CheckpointType) -> bool {
        match self.mode {
            ExecutionMode::Autonomous => kind == CheckpointType::Event,
            ExecutionMode::Interactive => kind != CheckpointType::Action,
            ExecutionMode::Supervised => true,
        }
    }

    /// Every trigger that fires for `ctx`, merged into one checkpoint.
    pub fn evaluate(&self, ctx: &TurnContext) -> Option<Checkpoint> {
        let t = &self.triggers;
        let mut fired: Vec<(CheckpointType, String)> = Vec::new();

        if let Some(blocker) = ctx.blocker.as_deref().filter(|_| t.on_blocker) {
            fired.push((CheckpointType::Event, format!("agent reported a blocker: {}", blocker)));
        }
        if let Some(doubt) = ctx.uncertainty.as_deref().filter(|_| t.on_uncertainty) {
            fired.push((CheckpointType::Event, format!("agent is uncertain: {}", doubt)));
        }
        if ctx.regression_failed && t.on_regression_failure {
            fired.push((CheckpointType::Event, "regression suite failed".to_string()));
        }
        if let Some(pct) = ctx.context_percent
            && t.on_context_high
            && pct >= self.limits.context_warning_percent
        {
            fired.push((
                CheckpointType::Event,
                format!(
                    "context usage {}% is above the {}% warning threshold",
                    pct, self.limits.context_warning_percent
                ),
            ));
        }
        if self.limits.max_files_modified > 0 && ctx.files_modified > self.limits.max_files_modified {
            fired.push((
                CheckpointType::Event,
                format!(
                    "{} files modified this session (limit {})",
                    ctx.files_modified, self.limits.max_files_modified
                ),
            ));
        }
        if self.limits.max_lines_changed > 0 && ctx.lines_changed > self.limits.max_lines_changed {
            fired.push((
                CheckpointType::Event,
                format!(
                    "{} lines changed this session (limit {})",
                    ctx.lines_changed, self.limits.max_lines_changed
                ),
            ));
        }

        if ctx.starting_task && t.before_new_issue {
            let what = ctx.task_id.as_deref().unwrap_or("next task");
            fired.push((CheckpointType::TaskBoundary, format!("about to start {}", what)));
        }
        if ctx.completed_task && t.after_issue_complete {
            let what = ctx.task_id.as_deref().unwrap_or("task");
            fired.push((CheckpointType::TaskBoundary, format!("{} completed", what)));
        }

        if t.turn_interval > 0 && ctx.turn > 0 && ctx.turn % t.turn_interval == 0 {
            fired.push((
                CheckpointType::TurnInterval,
                format!("turn {} (every {} turns)", ctx.turn, t.turn_interval),
            ));
        }

        for action in &ctx.actions {
            let enabled = match action {
                ActionKind::GitPush => t.before_git_push,
                ActionKind::FileDelete => t.before_file_delete,
                ActionKind::Deploy => t.before_deploy,
                ActionKind::SchemaChange => t.before_schema_change,
            };
            if enabled {
                fired.push((
                    CheckpointType::Action,
                    format!("agent requests {}", action.as_str()),
                ));
            }
        }

        fired.retain(|(kind, _)| self.evaluates(*kind));
        let kind = fired.iter().map(|(k, _)| *k).max()?;
        fired.sort_by(|a, b| b.0.cmp(&a.0));

        Some(Checkpoint {
            kind,
            reasons: fired.into_iter().map(|(_, reason)| reason).collect(),
            raised_at: Utc::now(),
            turn: ctx.turn,
            task_id: ctx.task_id.clone(),
            resolution: None,
            resolved_at: None,
            note: None,
        })
    }

    /// Session-ending limit reached after `turns_taken` turns, if any.
    pub fn session_limit(&self, turns_taken: u32, context_percent: Option<u8>) -> Option<SessionLimit> {
        if let Some(pct) = context_percent
            && pct >= self.limits.context_critical_percent
        {
            return Some(SessionLimit::ContextCritical(pct));
        }
        let max = self.limits.max_turns_per_session;
        (max > 0 && turns_taken >= max).then_some(SessionLimit::MaxTurns(max))
    }

    /// Present `checkpoint` on every channel; the first decision wins.
    ///
    /// Falls back to the configured default action when the approval timeout
    /// expires or when no channel is able to answer.
    pub async fn resolve(&self, mut checkpoint: Checkpoint) -> Checkpoint {
        tracing::info!(kind = %checkpoint.kind, turn = checkpoint.turn, "checkpoint raised: {}", checkpoint.reasons.join("; "));

        let mut pending: FuturesUnordered<_> = self
            .channels
            .iter()
            .map(|channel| {
                let channel = channel.clone();
                let checkpoint = checkpoint.clone();
                async move { (channel.name(), channel.request(&checkpoint).await) }
            })
            .collect();

        let first_decision = async {
            while let Some((name, outcome)) = pending.next().await {
                match outcome {
                    Ok(Some(decision)) => return Some(decision),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(channel = name, error = %e, "approval channel failed"),
                }
            }
            None
        };

        let decided = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, first_decision).await.ok().flatten(),
            None => first_decision.await,
        };

        for channel in &self.channels {
            if let Err(e) = channel.withdraw().await {
                tracing::debug!(channel = channel.name(), error = %e, "failed to withdraw checkpoint");
            }
        }

        let (resolution, note) = match decided {
            Some(decision) => {
                tracing::info!(channel = decision.channel, resolution = %decision.resolution, "checkpoint resolved");
                (decision.resolution, decision.note)
            }
            None => {
                tracing::warn!(default = %self.default_action, "no decision received; applying default action");
                (self.default_action, None)
            }
        };
        checkpoint.resolution = Some(resolution);
        checkpoint.resolved_at = Some(Utc::now());
        checkpoint.note = note;
        checkpoint
    }
}
