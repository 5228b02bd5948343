//! The coding-driver loop.
//!
//! One agent turn per iteration:
//!
//! 1. stop request or Ctrl-C
//! 2. session limits (turn budget, critical context usage)
//! 3. regression gate, running a baseline verification when required
//! 4. next task; a task-boundary checkpoint before starting it
//! 5. agent turn, then its signals are applied to the task and META
//! 6. post-turn checkpoint evaluation
//!
//! A checkpoint left pending by an earlier session is presented before any of this.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::checkpoint::{
    ApprovalChannel, Checkpoint, CheckpointController, CheckpointType, Resolution, SessionLimit,
    TurnContext,
};
use crate::config::{Config, RegressionTesting};
use crate::errors::OrchestratorError;
use crate::meta::{Meta, MetaPatch};
use crate::orchestrator::agent::{AgentReport, AgentRequest, CodingAgent};
use crate::orchestrator::verifier::Verifier;
use crate::provider::{StateProvider, retry_conflicts};
use crate::regression::{GateState, GitCauseFinder, RegressionGate, next_task, require_clear};
use crate::session::Handoff;
use crate::task::criteria::check_comment;
use crate::task::{Task, TaskFilter, TaskId, TaskPatch, TaskStatus, criteria_progress};
use crate::ui::SessionUi;

/// Label on a task whose completion check failed, until the regression is fixed.
pub const AWAITING_FIX_LABEL: &str = "awaiting-regression-fix";

/// Cooperative cancellation, checked between turns.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Set the flag on the first Ctrl-C. The running agent turn is not interrupted.
    pub fn install_ctrl_c(&self) {
        let flag = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping after the current turn");
                flag.cancel();
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every task is done
    Completed,
    Limit(SessionLimit),
    Cancelled,
    /// `tether stop` was requested
    StopRequested,
    Paused,
    Aborted,
    /// Open tasks remain but none can be picked
    NoReadyTask,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Completed => write!(f, "all tasks done"),
            StopReason::Limit(limit) => write!(f, "{}", limit),
            StopReason::Cancelled => write!(f, "interrupted"),
            StopReason::StopRequested => write!(f, "stop requested"),
            StopReason::Paused => write!(f, "paused at a checkpoint"),
            StopReason::Aborted => write!(f, "aborted at a checkpoint"),
            StopReason::NoReadyTask => write!(f, "no task is ready to work on"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub reason: StopReason,
    pub turns: u32,
    pub tasks_completed: u32,
    pub pending_checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Default)]
struct LoopState {
    turns: u32,
    tasks_completed: u32,
    files_modified: u32,
    lines_changed: u32,
    context_percent: Option<u8>,
    guidance: Option<String>,
    pending: Option<Checkpoint>,
    current_task: Option<TaskId>,
    /// Non-fatal failures for the handoff
    errors: Vec<String>,
}

/// What applying one agent turn did to its task.
#[derive(Debug, Default)]
struct TurnResult {
    completed: bool,
    regression_failed: bool,
}

pub struct Driver {
    config: Config,
    provider: Arc<dyn StateProvider>,
    agent: Arc<dyn CodingAgent>,
    verifier: Arc<dyn Verifier>,
    gate: RegressionGate,
    checkpoints: CheckpointController,
    cancel: CancelFlag,
    ui: Option<SessionUi>,
}

impl Driver {
    pub fn new(
        config: &Config,
        provider: Arc<dyn StateProvider>,
        agent: Arc<dyn CodingAgent>,
        verifier: Arc<dyn Verifier>,
        channels: Vec<Arc<dyn ApprovalChannel>>,
        cancel: CancelFlag,
    ) -> Self {
        let gate = RegressionGate::new(provider.clone(), config.toml.session.regression_testing)
            .with_cause_finder(Box::new(GitCauseFinder::new(&config.project_dir)));
        Self {
            config: config.clone(),
            checkpoints: CheckpointController::new(&config.toml.execution, channels),
            provider,
            agent,
            verifier,
            gate,
            cancel,
            ui: None,
        }
    }

    pub fn with_ui(mut self, ui: SessionUi) -> Self {
        self.ui = Some(ui);
        self
    }

    /// Drive the session until a stop condition. Always returns a handoff,
    /// also when the loop failed.
    pub async fn run(&self, session_id: &str) -> (Result<SessionOutcome, OrchestratorError>, Handoff) {
        let mut state = LoopState::default();
        let result = self.drive(session_id, &mut state).await;

        match &result {
            Ok(reason) => tracing::info!(
                session = %session_id,
                turns = state.turns,
                completed = state.tasks_completed,
                "session stopped: {}",
                reason
            ),
            Err(e) => tracing::error!(session = %session_id, error = %e, "session loop failed"),
        }
        if let Some(ui) = &self.ui {
            let line = match &result {
                Ok(reason) => format!("Session stopped: {}", reason),
                Err(e) => format!("Session failed: {}", e),
            };
            ui.finish(&line);
        }

        let handoff = self.handoff(&state, &result).await;
        let outcome = result.map(|reason| SessionOutcome {
            reason,
            turns: state.turns,
            tasks_completed: state.tasks_completed,
            pending_checkpoint: state.pending.clone(),
        });
        (outcome, handoff)
    }

    async fn drive(&self, session_id: &str, state: &mut LoopState) -> Result<StopReason, OrchestratorError> {
        if let Some(pending) = self.meta().await?.pending_checkpoint {
            tracing::info!(kind = %pending.kind, "presenting checkpoint left by the previous session");
            if let Some(stop) = self.settle(pending, state).await? {
                return Ok(stop);
            }
        }

        let mut session_start = true;
        loop {
            if let Some(stop) = self.interrupted() {
                return Ok(stop);
            }
            if let Some(limit) = self.checkpoints.session_limit(state.turns, state.context_percent) {
                return Ok(StopReason::Limit(limit));
            }

            let meta = self.meta().await?;
            if self.gate.assess(&meta, session_start) == GateState::BaselineRequired {
                session_start = false;
                tracing::info!("running regression baseline");
                if !self.verify(state).await? {
                    self.park_in_progress(&meta_fix_task(&self.meta().await?)).await?;
                    let ctx = TurnContext {
                        regression_failed: true,
                        ..TurnContext::default()
                    };
                    if let Some(stop) = self.checkpoint_between_turns(ctx, state).await? {
                        return Ok(stop);
                    }
                }
                continue;
            }
            session_start = false;

            let tasks = self.provider.get_tasks(&TaskFilter::all()).await?;
            let Some(task) = next_task(&tasks, &meta).cloned() else {
                return Ok(idle_reason(&tasks, &meta));
            };
            require_clear(&meta, &task)?;

            if task.status != TaskStatus::InProgress {
                let ctx = TurnContext {
                    task_id: Some(task.id.clone()),
                    starting_task: true,
                    ..TurnContext::default()
                };
                if let Some(stop) = self.checkpoint_between_turns(ctx, state).await? {
                    return Ok(stop);
                }
                self.update_task(
                    &task.id,
                    TaskPatch::status(TaskStatus::InProgress)
                        .with_comment(format!("Started in session {}", session_id)),
                )
                .await?;
            }

            state.turns += 1;
            state.current_task = Some(task.id.clone());
            let report = self.agent_turn(session_id, &task, &meta, state).await?;
            let result = self.apply_turn(session_id, &task, &report, state).await?;

            let signals = &report.signals;
            let ctx = TurnContext {
                turn: state.turns,
                task_id: Some(task.id.clone()),
                starting_task: false,
                completed_task: result.completed,
                regression_failed: result.regression_failed,
                blocker: signals.blocker_text(),
                uncertainty: signals.uncertainty_text(),
                context_percent: signals.context_percent,
                files_modified: state.files_modified,
                lines_changed: state.lines_changed,
                actions: signals.actions.clone(),
            };
            if let Some(checkpoint) = self.checkpoints.evaluate(&ctx)
                && let Some(stop) = self.settle(checkpoint, state).await?
            {
                return Ok(stop);
            }
        }
    }

    fn interrupted(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        if self.config.stop_file.exists() {
            if let Err(e) = std::fs::remove_file(&self.config.stop_file) {
                tracing::warn!(error = %e, "failed to remove stop request");
            }
            return Some(StopReason::StopRequested);
        }
        None
    }

    async fn meta(&self) -> Result<Meta, OrchestratorError> {
        self.provider
            .get_meta()
            .await?
            .ok_or(OrchestratorError::NotInitialized)
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<(), OrchestratorError> {
        retry_conflicts("update task", || self.provider.update_task(id, patch.clone())).await?;
        Ok(())
    }

    async fn agent_turn(
        &self,
        session_id: &str,
        task: &Task,
        meta: &Meta,
        state: &mut LoopState,
    ) -> Result<AgentReport, OrchestratorError> {
        let request = AgentRequest {
            session_id: session_id.to_string(),
            turn: state.turns,
            task: task.clone(),
            criteria: criteria_progress(task),
            meta: meta.clone(),
            regression: meta
                .regression_details
                .clone()
                .filter(|d| d.fix_task == task.id),
            guidance: state.guidance.take(),
        };
        tracing::info!(turn = state.turns, task = %task.id, "agent turn started");
        if let Some(ui) = &self.ui {
            ui.start_turn(state.turns, &task.id, &task.title);
        }
        let report = self.agent.run(&request).await?;
        if let Some(ui) = &self.ui {
            let progress = criteria_progress(task);
            ui.turn_finished(report.duration, &progress.to_string());
        }
        Ok(report)
    }

    /// Record what the agent reported for `task`.
    async fn apply_turn(
        &self,
        session_id: &str,
        task: &Task,
        report: &AgentReport,
        state: &mut LoopState,
    ) -> Result<TurnResult, OrchestratorError> {
        let signals = &report.signals;
        let mut result = TurnResult::default();

        state.files_modified = state
            .files_modified
            .saturating_add(signals.files_modified.unwrap_or(0));
        state.lines_changed = state
            .lines_changed
            .saturating_add(signals.lines_changed.unwrap_or(0));
        if signals.context_percent.is_some() {
            state.context_percent = signals.context_percent;
        }

        if !signals.decisions.is_empty() {
            let patch = MetaPatch {
                add_decisions: signals
                    .decisions
                    .iter()
                    .flat_map(|d| MetaPatch::decision(&d.decision, &d.rationale).add_decisions)
                    .collect(),
                ..MetaPatch::default()
            };
            if let Err(e) = retry_conflicts("record decisions", || self.provider.update_meta(patch.clone())).await {
                tracing::error!(error = %e, "failed to record architecture decisions");
                state.errors.push(format!("decisions from turn {} not recorded: {}", state.turns, e));
            }
        }

        if !signals.criteria.is_empty() {
            let body = format!(
                "Session {} turn {}:\n{}",
                session_id,
                state.turns,
                check_comment(&signals.criteria)
            );
            self.update_task(&task.id, TaskPatch::comment(body)).await?;
        }

        if let Some(blocker) = signals.blocker_text() {
            tracing::warn!(task = %task.id, "agent blocked: {}", blocker);
            self.update_task(
                &task.id,
                TaskPatch::status(TaskStatus::Blocked).with_comment(format!("Blocked: {}", blocker)),
            )
            .await?;
            if let Some(ui) = &self.ui {
                ui.blocked(&task.id, &blocker);
            }
            return Ok(result);
        }

        if signals.task_complete {
            let current = self
                .provider
                .get_task(&task.id)
                .await?
                .unwrap_or_else(|| task.clone());
            let progress = criteria_progress(&current);
            if !progress.is_ready() {
                tracing::warn!(task = %task.id, %progress, "completion reported before every criterion was checked");
                self.update_task(
                    &task.id,
                    TaskPatch::comment(format!(
                        "Completion reported with {}; every criterion must be checked first",
                        progress
                    )),
                )
                .await?;
                return Ok(result);
            }
            self.complete(&current, state, &mut result).await?;
        }
        Ok(result)
    }

    /// Verify a finished task and move it to `done`, or record the regression it caused.
    async fn complete(
        &self,
        task: &Task,
        state: &mut LoopState,
        result: &mut TurnResult,
    ) -> Result<(), OrchestratorError> {
        if self.gate.mode() != RegressionTesting::Disabled && !self.verify(state).await? {
            result.regression_failed = true;
            let fix_task = meta_fix_task(&self.meta().await?);
            if fix_task == task.id {
                self.update_task(
                    &task.id,
                    TaskPatch::comment("Verification still failing after the fix attempt"),
                )
                .await?;
            } else {
                self.park(
                    &task.id,
                    format!("Completion check failed; waiting on regression fix {}", fix_task),
                )
                .await?;
            }
            return Ok(());
        }

        let progress = criteria_progress(task);
        self.update_task(
            &task.id,
            TaskPatch::status(TaskStatus::Done).with_comment(format!("Completed ({})", progress)),
        )
        .await?;
        state.tasks_completed += 1;
        result.completed = true;
        tracing::info!(task = %task.id, "task done");
        if let Some(ui) = &self.ui {
            ui.task_done(&task.id, &task.title);
        }
        Ok(())
    }

    /// Run the regression suite and record the outcome. Returns whether it passed.
    async fn verify(&self, state: &mut LoopState) -> Result<bool, OrchestratorError> {
        if let Some(ui) = &self.ui {
            ui.verifying();
        }
        let verification = self.verifier.verify().await?;
        if let Some(ui) = &self.ui {
            ui.regression(verification.passed, verification.failing_test.as_deref());
        }

        if verification.passed {
            self.gate.record_passing().await?;
            self.release_awaiting(state).await;
            return Ok(true);
        }
        let test = verification
            .failing_test
            .unwrap_or_else(|| self.config.toml.session.regression_command.clone());
        let fix_task = self.gate.record_failure(&test).await?;
        tracing::warn!(test = %test, fix_task = %fix_task, "regression suite failing");
        Ok(false)
    }

    /// Block `id` until the regression fix passes.
    async fn park(&self, id: &str, comment: String) -> Result<(), OrchestratorError> {
        self.update_task(
            id,
            TaskPatch::status(TaskStatus::Blocked)
                .with_label(AWAITING_FIX_LABEL)
                .with_comment(comment),
        )
        .await
    }

    /// Park every in-progress task except the fix task, so the fix is the only open work.
    async fn park_in_progress(&self, fix_task: &str) -> Result<(), OrchestratorError> {
        let filter = TaskFilter {
            status: Some(TaskStatus::InProgress),
            ..TaskFilter::default()
        };
        for task in self.provider.get_tasks(&filter).await? {
            if task.id == fix_task {
                continue;
            }
            tracing::info!(task = %task.id, fix_task = %fix_task, "parking task behind regression fix");
            self.park(
                &task.id,
                format!("Regression check failed at session start; waiting on regression fix {}", fix_task),
            )
            .await?;
        }
        Ok(())
    }

    /// Return tasks parked behind a regression fix to `todo`.
    async fn release_awaiting(&self, state: &mut LoopState) {
        let filter = TaskFilter {
            status: Some(TaskStatus::Blocked),
            labels: vec![AWAITING_FIX_LABEL.to_string()],
            ..TaskFilter::default()
        };
        let parked = match self.provider.get_tasks(&filter).await {
            Ok(tasks) => tasks,
            Err(e) => {
                state.errors.push(format!("could not list parked tasks: {}", e));
                return;
            }
        };
        for task in parked {
            let patch = TaskPatch {
                status: Some(TaskStatus::Todo),
                remove_labels: vec![AWAITING_FIX_LABEL.to_string()],
                comment: Some("Regression fixed; ready to be picked up again".to_string()),
                ..TaskPatch::default()
            };
            if let Err(e) = self.update_task(&task.id, patch).await {
                tracing::error!(task = %task.id, error = %e, "failed to release parked task");
                state.errors.push(format!("{} still parked: {}", task.id, e));
            }
        }
    }

    /// Evaluate a checkpoint outside a completed turn. Turn-interval triggers
    /// only fire after turns.
    async fn checkpoint_between_turns(
        &self,
        ctx: TurnContext,
        state: &mut LoopState,
    ) -> Result<Option<StopReason>, OrchestratorError> {
        let ctx = TurnContext { turn: 0, ..ctx };
        let Some(mut checkpoint) = self.checkpoints.evaluate(&ctx) else {
            return Ok(None);
        };
        checkpoint.turn = state.turns;
        self.settle(checkpoint, state).await
    }

    /// Resolve `checkpoint` and turn the decision into a stop reason, if any.
    async fn settle(
        &self,
        checkpoint: Checkpoint,
        state: &mut LoopState,
    ) -> Result<Option<StopReason>, OrchestratorError> {
        if let Some(ui) = &self.ui {
            ui.checkpoint(&checkpoint);
        }
        let resolved = self.checkpoints.resolve(checkpoint).await;
        match resolved.resolution.unwrap_or(Resolution::Pause) {
            Resolution::Continue => {
                if resolved.kind == CheckpointType::Action {
                    state.guidance = Some(format!("Approved: {}", resolved.reasons.join("; ")));
                }
                Ok(None)
            }
            Resolution::Redirect => {
                tracing::info!(note = ?resolved.note, "redirected at checkpoint");
                state.guidance = resolved.note.clone();
                Ok(None)
            }
            Resolution::Pause => {
                state.pending = Some(resolved);
                Ok(Some(StopReason::Paused))
            }
            Resolution::Abort => Ok(Some(StopReason::Aborted)),
        }
    }

    async fn handoff(&self, state: &LoopState, result: &Result<StopReason, OrchestratorError>) -> Handoff {
        let mut errors = state.errors.clone();
        let open_tasks = match self.provider.get_tasks(&TaskFilter::all()).await {
            Ok(tasks) => tasks
                .into_iter()
                .filter(|t| t.status != TaskStatus::Done && t.superseded_by().is_none())
                .map(|t| t.id)
                .collect(),
            Err(e) => {
                errors.push(format!("could not list open tasks: {}", e));
                Vec::new()
            }
        };

        let reason = match result {
            Ok(reason) => reason.to_string(),
            Err(_) => "stopped on error".to_string(),
        };
        let mut summary = format!(
            "Stopped: {}. {} turn(s), {} task(s) completed.",
            reason, state.turns, state.tasks_completed
        );
        if let Some(task) = &state.current_task {
            summary.push_str(&format!(" Last worked on {}.", task));
        }

        Handoff {
            summary,
            open_tasks,
            pending_checkpoint: state.pending.clone(),
            errors,
        }
    }
}

fn meta_fix_task(meta: &Meta) -> TaskId {
    meta.regression_details
        .as_ref()
        .map(|d| d.fix_task.clone())
        .unwrap_or_default()
}

fn idle_reason(tasks: &[Task], meta: &Meta) -> StopReason {
    if tasks.iter().all(|t| t.status == TaskStatus::Done) {
        return StopReason::Completed;
    }
    if let Some(details) = &meta.regression_details {
        tracing::warn!(fix_task = %details.fix_task, "regression fix task is not workable");
    }
    StopReason::NoReadyTask
}
