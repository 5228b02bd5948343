//! Regression verification: runs the project's check suite.

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

use crate::config::Config;
use crate::errors::OrchestratorError;

/// Lines of output kept for logs and fix-task descriptions.
const OUTPUT_TAIL_LINES: usize = 40;

/// `test auth::login_rejects_bad_password ... FAILED`
static CARGO_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^test (\S+) \.\.\. FAILED").unwrap());

/// `FAILED tests/test_auth.py::test_login - AssertionError`
static PYTEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^FAILED (\S+)").unwrap());

/// `  ● Login form › rejects bad password`
static JEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*● (.+?)\s*$").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub passed: bool,
    /// First failing check, when the run failed
    pub failing_test: Option<String>,
    /// Tail of combined stdout/stderr
    pub output: String,
}

impl Verification {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            failing_test: None,
            output: output.into(),
        }
    }

    pub fn failed(test: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            passed: false,
            failing_test: Some(test.into()),
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self) -> Result<Verification, OrchestratorError>;
}

/// First failing test named in `output`, for the runners we recognize.
pub fn failing_test(output: &str) -> Option<String> {
    [&*CARGO_FAILED, &*PYTEST_FAILED, &*JEST_FAILED]
        .into_iter()
        .find_map(|re| re.captures(output).map(|cap| cap[1].to_string()))
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Runs `session.regression_command` through `sh -c` in the project directory.
pub struct CommandVerifier {
    command: String,
    project_dir: PathBuf,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(config: &Config) -> Self {
        Self {
            command: config.toml.session.regression_command.clone(),
            project_dir: config.project_dir.clone(),
            timeout: Duration::from_secs(config.toml.session.verify_timeout_minutes.max(1) * 60),
        }
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self) -> anyhow::Result<Verification> {
        tracing::info!(command = %self.command, "running regression suite");
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.project_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run regression command '{}'", self.command))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to collect regression output")?,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "regression suite timed out");
                return Ok(Verification::failed(
                    format!("{} (timed out)", self.command),
                    String::new(),
                ));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            return Ok(Verification::passed(tail(&combined, OUTPUT_TAIL_LINES)));
        }
        let test = failing_test(&combined).unwrap_or_else(|| self.command.clone());
        tracing::debug!(test = %test, code = ?output.status.code(), "regression suite failed");
        Ok(Verification::failed(test, tail(&combined, OUTPUT_TAIL_LINES)))
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn verify(&self) -> Result<Verification, OrchestratorError> {
        Ok(self.run().await?)
    }
}
