//! The external coding agent, treated as an opaque unit of work.

use anyhow::Context;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::config::Config;
use crate::errors::OrchestratorError;
use crate::meta::{Meta, RegressionDetails};
use crate::signals::{AgentSignals, extract_signals};
use crate::task::criteria::render_checklist;
use crate::task::{CriteriaProgress, Task};

/// Everything the agent needs for one turn.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub session_id: String,
    /// 1-based turn number within the session
    pub turn: u32,
    pub task: Task,
    pub criteria: CriteriaProgress,
    pub meta: Meta,
    /// Set while the task is the fix for a failing regression
    pub regression: Option<RegressionDetails>,
    /// Note from a `redirect` checkpoint decision
    pub guidance: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentReport {
    pub output: String,
    pub signals: AgentSignals,
    pub duration: Duration,
}

#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn run(&self, request: &AgentRequest) -> Result<AgentReport, OrchestratorError>;
}

/// Prompt handed to the agent on stdin.
pub fn render_prompt(request: &AgentRequest) -> String {
    let task = &request.task;
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "# Session {} turn {}\n\nYou are working on task {}: {}\n",
        request.session_id, request.turn, task.id, task.title
    ));
    if !request.meta.current_focus.is_empty() {
        prompt.push_str(&format!("Project focus: {}\n", request.meta.current_focus));
    }

    if let Some(guidance) = &request.guidance {
        prompt.push_str(&format!("\n## Guidance from the operator\n\n{}\n", guidance));
    }
    if let Some(regression) = &request.regression {
        prompt.push_str(&format!(
            "\n## Regression\n\nThe check `{}` has been failing since {}. Fix it before anything else.\n",
            regression.test,
            regression.since.to_rfc3339()
        ));
        if let Some(cause) = &regression.likely_cause {
            prompt.push_str(&format!("Likely cause: {}\n", cause));
        }
    }

    if !task.description.is_empty() {
        prompt.push_str("\n## Description\n\n");
        prompt.push_str(&textwrap::fill(&task.description, 100));
        prompt.push('\n');
    }

    prompt.push_str("\n## Acceptance criteria (immutable)\n\n");
    prompt.push_str(&render_checklist(&task.acceptance_criteria, &request.criteria.checked));
    prompt.push('\n');

    if !task.test_steps.is_empty() {
        prompt.push_str("\n## Test steps\n\n");
        for (i, step) in task.test_steps.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, step));
        }
    }

    if !request.meta.architecture_decisions.is_empty() {
        prompt.push_str("\n## Architecture decisions\n\n");
        for d in &request.meta.architecture_decisions {
            prompt.push_str(&format!("- {}: {}\n", d.decision, d.rationale));
        }
    }

    prompt.push_str(
        "\n## Reporting\n\n\
         - `<criterion>N</criterion>` when criterion N is satisfied\n\
         - `<task-complete/>` when every criterion is satisfied\n\
         - `<blocker>why</blocker>` if you cannot continue\n\
         - `<uncertain>question</uncertain>` if a requirement is ambiguous\n\
         - `<action>git_push|file_delete|deploy|schema_change</action>` before such an operation\n\
         - `<decision rationale=\"why\">what</decision>` for architecture decisions\n\
         - `<context>NN%</context>` for how full your context window is\n\
         - `<files-modified>N</files-modified>` and `<lines-changed>N</lines-changed>` for this turn\n",
    );
    prompt
}

/// Runs the configured agent command with the prompt on stdin.
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
    project_dir: PathBuf,
    log_dir: PathBuf,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(config: &Config) -> Self {
        Self {
            command: config.toml.agent.effective_command(),
            args: config.toml.agent.args.clone(),
            project_dir: config.project_dir.clone(),
            log_dir: config.log_dir.clone(),
            timeout: Duration::from_secs(config.toml.session.timeout_minutes.max(1) * 60),
        }
    }

    async fn invoke(&self, request: &AgentRequest) -> anyhow::Result<AgentReport> {
        let prompt = render_prompt(request);
        let stem = format!("{}-turn-{}", request.session_id, request.turn);
        let prompt_file = self.log_dir.join(format!("{}-prompt.md", stem));
        std::fs::write(&prompt_file, &prompt).context("Failed to write prompt file")?;

        let start = Instant::now();
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .current_dir(&self.project_dir)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn agent command '{}'", self.command))?;
        tracing::debug!(pid = child.id().unwrap_or(0), command = %self.command, "agent spawned");

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("Agent did not finish within {:?}", self.timeout))??;
        let duration = start.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let output_file = self.log_dir.join(format!("{}-output.log", stem));
        std::fs::write(&output_file, &stdout).context("Failed to write output file")?;

        if !output.status.success() {
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            anyhow::bail!(
                "agent exited with {} after {:.1}s: {}",
                output.status.code().unwrap_or(-1),
                duration.as_secs_f64(),
                tail
            );
        }

        Ok(AgentReport {
            signals: extract_signals(&stdout),
            output: stdout,
            duration,
        })
    }
}

#[async_trait]
impl CodingAgent for CommandAgent {
    async fn run(&self, request: &AgentRequest) -> Result<AgentReport, OrchestratorError> {
        self.invoke(request)
            .await
            .map_err(|e| OrchestratorError::Agent(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TetherToml;
    use crate::task::tests::payload;
    use chrono::Utc;
    use tempfile::TempDir;

    fn request() -> AgentRequest {
        let task = Task::from_payload("T-3".into(), &payload("Implement login form"), Utc::now()).unwrap();
        AgentRequest {
            session_id: "S-20260101T000000000Z".into(),
            turn: 2,
            criteria: CriteriaProgress {
                checked: vec![true, false],
            },
            task,
            meta: Meta::initial("Authentication"),
            regression: None,
            guidance: Some("Prefer the existing form helpers".into()),
        }
    }

    #[test]
    fn test_prompt_contains_task_and_checklist() {
        let prompt = render_prompt(&request());
        assert!(prompt.contains("task T-3: Implement login form"));
        assert!(prompt.contains("- [x] User can submit the login form"));
        assert!(prompt.contains("- [ ] Invalid password shows an error message"));
        assert!(prompt.contains("1. Open /login"));
        assert!(prompt.contains("Prefer the existing form helpers"));
        assert!(prompt.contains("Project focus: Authentication"));
        assert!(prompt.contains("<task-complete/>"));
    }

    #[cfg(unix)]
    fn agent_config(dir: &TempDir, script: &str) -> Config {
        let mut toml = TetherToml::default();
        toml.agent.command = "sh".into();
        toml.agent.args = vec!["-c".into(), script.into()];
        let config = Config::with_toml(dir.path().to_path_buf(), toml, false);
        config.ensure_directories().unwrap();
        config
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_agent_reads_prompt_and_parses_signals() {
        let dir = TempDir::new().unwrap();
        let config = agent_config(
            &dir,
            "grep -q 'T-3' && echo 'done <criterion>1</criterion><task-complete/>'",
        );
        let report = CommandAgent::new(&config).run(&request()).await.unwrap();
        assert!(report.signals.task_complete);
        assert_eq!(report.signals.criteria, vec![1]);
        assert!(config.log_dir.join("S-20260101T000000000Z-turn-2-prompt.md").exists());
        assert!(config.log_dir.join("S-20260101T000000000Z-turn-2-output.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_agent_failure_is_agent_error() {
        let dir = TempDir::new().unwrap();
        let config = agent_config(&dir, "cat >/dev/null; echo 'no credentials' >&2; exit 3");
        let err = CommandAgent::new(&config).run(&request()).await.unwrap_err();
        match err {
            OrchestratorError::Agent(msg) => {
                assert!(msg.contains("exited with 3"));
                assert!(msg.contains("no credentials"));
            }
            other => panic!("expected Agent error, got {:?}", other),
        }
    }
}
