//! Ways a checkpoint reaches a human.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dialoguer::{Input, Select, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{Checkpoint, Resolution};
use crate::config::{ChannelKind, Config};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A decision collected from one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub resolution: Resolution,
    pub note: Option<String>,
    pub channel: &'static str,
}

#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Present the checkpoint and wait for an answer.
    ///
    /// Returns `None` when this channel only notifies and can never answer.
    async fn request(&self, checkpoint: &Checkpoint) -> Result<Option<Decision>>;

    /// Called once the checkpoint is resolved, by whichever channel.
    async fn withdraw(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the channels listed in `execution.approval.channels`.
pub fn from_config(config: &Config) -> Vec<Arc<dyn ApprovalChannel>> {
    config
        .toml
        .execution
        .approval
        .channels
        .iter()
        .map(|kind| -> Arc<dyn ApprovalChannel> {
            match kind {
                ChannelKind::Terminal => Arc::new(TerminalChannel::default()),
                ChannelKind::File => Arc::new(FileChannel::new(
                    config.checkpoint_file.clone(),
                    config.decision_file.clone(),
                )),
                ChannelKind::Log => Arc::new(LogChannel),
            }
        })
        .collect()
}

// ── terminal ─────────────────────────────────────────────────────────

/// Interactive prompt on the controlling terminal.
///
/// A blocking read on stdin cannot be interrupted, so a prompt outlives a
/// checkpoint settled elsewhere. While it is still on screen no second prompt
/// is stacked on top of it; exit does not wait for it either (see `main`).
#[derive(Default)]
pub struct TerminalChannel {
    prompt_open: Arc<AtomicBool>,
}

impl TerminalChannel {
    pub fn prompt_open(&self) -> bool {
        self.prompt_open.load(Ordering::SeqCst)
    }
}

fn prompt_user(checkpoint: &Checkpoint) -> Result<Decision> {
    println!();
    println!(
        "{} {}",
        console::style("Checkpoint:").yellow().bold(),
        console::style(checkpoint.kind).bold()
    );
    if let Some(task) = &checkpoint.task_id {
        println!("  Task: {}", task);
    }
    for reason in &checkpoint.reasons {
        println!("  - {}", reason);
    }
    println!();

    let options = &[
        "Continue",
        "Pause (resume later with `tether start --resume`)",
        "Abort",
        "Redirect (continue with new guidance)",
    ];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("How should the session proceed?")
        .items(options)
        .default(0)
        .interact()?;

    let resolution = Resolution::ALL[selection];
    let note = match resolution {
        Resolution::Redirect => Some(
            Input::<String>::with_theme(&ColorfulTheme::default())
                .with_prompt("Guidance for the agent")
                .interact_text()?,
        ),
        _ => None,
    };
    Ok(Decision {
        resolution,
        note,
        channel: "terminal",
    })
}

#[async_trait]
impl ApprovalChannel for TerminalChannel {
    fn name(&self) -> &'static str {
        "terminal"
    }

    async fn request(&self, checkpoint: &Checkpoint) -> Result<Option<Decision>> {
        if !console::user_attended() {
            tracing::debug!("no terminal attached; skipping interactive prompt");
            return Ok(None);
        }
        if self.prompt_open.swap(true, Ordering::SeqCst) {
            tracing::warn!("an earlier terminal prompt is still open; not prompting again");
            return Ok(None);
        }
        let checkpoint = checkpoint.clone();
        let open = self.prompt_open.clone();
        let decision = tokio::task::spawn_blocking(move || {
            let decision = prompt_user(&checkpoint);
            open.store(false, Ordering::SeqCst);
            decision
        })
        .await
        .context("terminal prompt panicked")??;
        Ok(Some(decision))
    }

    async fn withdraw(&self) -> Result<()> {
        if self.prompt_open() {
            eprintln!();
            eprintln!(
                "{} checkpoint settled without this prompt; any answer here is ignored",
                console::style("note:").dim()
            );
        }
        Ok(())
    }
}

// ── file ─────────────────────────────────────────────────────────────

/// Decision written by `tether decide`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Record a decision for a running session to pick up.
pub fn write_decision(path: &Path, resolution: Resolution, note: Option<String>) -> Result<()> {
    let record = DecisionRecord {
        resolution,
        note,
        decided_at: Utc::now(),
    };
    let content = serde_json::to_string_pretty(&record)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write decision to {}", path.display()))
}

/// Checkpoint currently waiting on the file channel, if any.
pub fn read_waiting(path: &Path) -> Result<Option<Checkpoint>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let checkpoint = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(checkpoint))
}

/// Publishes the checkpoint as JSON and waits for a decision file.
pub struct FileChannel {
    checkpoint_file: PathBuf,
    decision_file: PathBuf,
}

impl FileChannel {
    pub fn new(checkpoint_file: PathBuf, decision_file: PathBuf) -> Self {
        Self {
            checkpoint_file,
            decision_file,
        }
    }

    fn take_decision(&self) -> Result<Option<DecisionRecord>> {
        if !self.decision_file.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.decision_file)?;
        let record: DecisionRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => {
                // may be half-written; try again next poll
                tracing::debug!(error = %e, "decision file not parseable yet");
                return Ok(None);
            }
        };
        std::fs::remove_file(&self.decision_file)?;
        Ok(Some(record))
    }
}

#[async_trait]
impl ApprovalChannel for FileChannel {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn request(&self, checkpoint: &Checkpoint) -> Result<Option<Decision>> {
        // an answer left over from an earlier checkpoint must not resolve this one
        if self.decision_file.exists() {
            std::fs::remove_file(&self.decision_file)?;
        }
        let content = serde_json::to_string_pretty(checkpoint)?;
        std::fs::write(&self.checkpoint_file, content).with_context(|| {
            format!("Failed to write {}", self.checkpoint_file.display())
        })?;
        tracing::info!(
            "checkpoint written to {}; answer with `tether decide`",
            self.checkpoint_file.display()
        );

        loop {
            if let Some(record) = self.take_decision()? {
                return Ok(Some(Decision {
                    resolution: record.resolution,
                    note: record.note,
                    channel: "file",
                }));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn withdraw(&self) -> Result<()> {
        if self.checkpoint_file.exists() {
            std::fs::remove_file(&self.checkpoint_file)?;
        }
        Ok(())
    }
}

// ── log ──────────────────────────────────────────────────────────────

/// Notification only.
pub struct LogChannel;

#[async_trait]
impl ApprovalChannel for LogChannel {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn request(&self, checkpoint: &Checkpoint) -> Result<Option<Decision>> {
        tracing::warn!(
            kind = %checkpoint.kind,
            turn = checkpoint.turn,
            task = checkpoint.task_id.as_deref().unwrap_or("-"),
            "checkpoint awaiting decision: {}",
            checkpoint.reasons.join("; ")
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointType;
    use tempfile::TempDir;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            kind: CheckpointType::Event,
            reasons: vec!["regression suite failed".into()],
            raised_at: Utc::now(),
            turn: 4,
            task_id: Some("T-2".into()),
            resolution: None,
            resolved_at: None,
            note: None,
        }
    }

    #[tokio::test]
    async fn test_terminal_channel_does_not_stack_prompts() {
        let channel = TerminalChannel::default();
        channel.prompt_open.store(true, Ordering::SeqCst);
        assert!(channel.request(&checkpoint()).await.unwrap().is_none());
        assert!(channel.prompt_open());
        channel.withdraw().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_channel_round_trip() {
        let dir = TempDir::new().unwrap();
        let cp_file = dir.path().join("checkpoint.json");
        let decision_file = dir.path().join("decision.json");
        let channel = Arc::new(FileChannel::new(cp_file.clone(), decision_file.clone()));

        let waiting = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.request(&checkpoint()).await })
        };

        for _ in 0..50 {
            if cp_file.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let published = read_waiting(&cp_file).unwrap().unwrap();
        assert_eq!(published.task_id.as_deref(), Some("T-2"));

        write_decision(&decision_file, Resolution::Redirect, Some("focus on auth".into())).unwrap();
        let decision = waiting.await.unwrap().unwrap().unwrap();
        assert_eq!(decision.resolution, Resolution::Redirect);
        assert_eq!(decision.note.as_deref(), Some("focus on auth"));
        assert!(!decision_file.exists());

        channel.withdraw().await.unwrap();
        assert!(read_waiting(&cp_file).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_channel_ignores_stale_decision() {
        let dir = TempDir::new().unwrap();
        let decision_file = dir.path().join("decision.json");
        write_decision(&decision_file, Resolution::Abort, None).unwrap();

        let channel = FileChannel::new(dir.path().join("checkpoint.json"), decision_file);
        let outcome =
            tokio::time::timeout(Duration::from_millis(100), channel.request(&checkpoint())).await;
        assert!(outcome.is_err(), "stale decision must not answer a new checkpoint");
    }

    #[tokio::test]
    async fn test_log_channel_never_decides() {
        assert!(LogChannel.request(&checkpoint()).await.unwrap().is_none());
    }

    #[test]
    fn test_from_config_builds_listed_channels() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::with_toml(dir.path().to_path_buf(), Default::default(), false);
        config.toml.execution.approval.channels = vec![ChannelKind::File, ChannelKind::Log];
        let names: Vec<_> = from_config(&config).iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["file", "log"]);
    }
}
