//! Configuration for tether, read from `.tether/tether.toml`.
//!
//! Layering is file → environment → CLI. Every enumerated option is a typed enum
//! so misconfiguration is caught when the file is loaded.
//!
//! # Configuration File Format
//!
//! ```toml
//! [state_provider]
//! type = "github"
//! api_key_env = "GITHUB_TOKEN"
//! repository = "acme/widgets"
//! fallback_to_file = true
//! cache_ttl_seconds = 60
//!
//! [session]
//! regression_testing = "required"
//! regression_command = "cargo test"
//!
//! [execution]
//! mode = "supervised"
//!
//! [execution.checkpoints]
//! turn_interval = 10
//! before_git_push = true
//!
//! [execution.approval]
//! timeout_minutes = 30
//! default_action = "pause"
//! channels = ["terminal", "file"]
//!
//! [execution.limits]
//! max_turns_per_session = 50
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The name of the tether project directory.
pub const TETHER_DIR: &str = ".tether";

/// Which backend holds the durable project state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Local JSON documents under `.tether/state/`
    #[default]
    File,
    /// GitHub issues over the REST API
    Github,
    /// Linear issues over the GraphQL API
    Linear,
}

impl ProviderType {
    pub fn is_remote(self) -> bool {
        !matches!(self, ProviderType::File)
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::File => write!(f, "file"),
            ProviderType::Github => write!(f, "github"),
            ProviderType::Linear => write!(f, "linear"),
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(ProviderType::File),
            "github" => Ok(ProviderType::Github),
            "linear" => Ok(ProviderType::Linear),
            _ => anyhow::bail!(
                "Invalid state provider '{}'. Valid values: file, github, linear",
                s
            ),
        }
    }
}

/// How strictly regression verification is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegressionTesting {
    /// Baseline at every session start and after every completed task
    #[default]
    Required,
    /// Baseline only while the status is unknown
    Recommended,
    /// Never run verification
    Disabled,
}

/// How much autonomy the running agent has between human check-ins.
///
/// | Mode          | Trigger kinds evaluated                          |
/// |---------------|--------------------------------------------------|
/// | `Autonomous`  | event                                            |
/// | `Interactive` | event, task boundary, turn interval              |
/// | `Supervised`  | action, event, task boundary, turn interval      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Autonomous,
    #[default]
    Interactive,
    Supervised,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Autonomous => write!(f, "autonomous"),
            ExecutionMode::Interactive => write!(f, "interactive"),
            ExecutionMode::Supervised => write!(f, "supervised"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "autonomous" => Ok(ExecutionMode::Autonomous),
            "interactive" => Ok(ExecutionMode::Interactive),
            "supervised" => Ok(ExecutionMode::Supervised),
            _ => anyhow::bail!(
                "Invalid execution mode '{}'. Valid values: autonomous, interactive, supervised",
                s
            ),
        }
    }
}

/// Decision applied when an approval wait times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    #[default]
    Pause,
    Continue,
    Abort,
}

/// Where pending checkpoint decisions are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// Interactive prompt on the controlling terminal
    Terminal,
    /// `.tether/checkpoint.json`, answered with `tether decide`
    File,
    /// Log line only; never answers
    Log,
}

/// `[state_provider]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateProviderSection {
    #[serde(rename = "type", default)]
    pub provider_type: ProviderType,
    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_true")]
    pub fallback_to_file: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    /// `owner/repo` for the GitHub backend
    #[serde(default)]
    pub repository: Option<String>,
    /// Team id for the Linear backend
    #[serde(default)]
    pub team_id: Option<String>,
    /// Endpoint override (GitHub Enterprise, proxies)
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_sync_interval() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for StateProviderSection {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::default(),
            api_key_env: None,
            fallback_to_file: true,
            cache_ttl_seconds: default_cache_ttl(),
            repository: None,
            team_id: None,
            api_url: None,
            sync_interval_seconds: default_sync_interval(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl StateProviderSection {
    /// Environment variable consulted for the API key, with a backend default.
    pub fn api_key_var(&self) -> String {
        if let Some(var) = &self.api_key_env {
            return var.clone();
        }
        match self.provider_type {
            ProviderType::Linear => "LINEAR_API_KEY".to_string(),
            _ => "GITHUB_TOKEN".to_string(),
        }
    }

    /// Read the API key from the environment.
    pub fn api_key(&self) -> Result<String> {
        let var = self.api_key_var();
        std::env::var(&var)
            .with_context(|| format!("Environment variable {} is not set", var))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_true")]
    pub continuity_enabled: bool,
    #[serde(default)]
    pub regression_testing: RegressionTesting,
    /// Command that runs the project's verification suite
    #[serde(default = "default_regression_command")]
    pub regression_command: String,
    #[serde(default = "default_session_timeout")]
    pub timeout_minutes: u64,
    #[serde(default = "default_verify_timeout")]
    pub verify_timeout_minutes: u64,
}

fn default_regression_command() -> String {
    "cargo test".to_string()
}

fn default_session_timeout() -> u64 {
    120
}

fn default_verify_timeout() -> u64 {
    15
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            continuity_enabled: true,
            regression_testing: RegressionTesting::default(),
            regression_command: default_regression_command(),
            timeout_minutes: default_session_timeout(),
            verify_timeout_minutes: default_verify_timeout(),
        }
    }
}

/// `[agent]` section: the external coding agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    vec!["--print".to_string()]
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
        }
    }
}

impl AgentSection {
    /// Command with the `CLAUDE_CMD` environment override applied.
    pub fn effective_command(&self) -> String {
        std::env::var("CLAUDE_CMD").unwrap_or_else(|_| self.command.clone())
    }
}

/// `[execution.checkpoints]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointsConfig {
    /// Fire every N agent turns; 0 disables
    #[serde(default = "default_turn_interval")]
    pub turn_interval: u32,
    #[serde(default)]
    pub before_new_issue: bool,
    #[serde(default = "default_true")]
    pub after_issue_complete: bool,
    #[serde(default = "default_true")]
    pub on_regression_failure: bool,
    #[serde(default = "default_true")]
    pub on_blocker: bool,
    #[serde(default)]
    pub on_uncertainty: bool,
    #[serde(default = "default_true")]
    pub on_context_high: bool,
    #[serde(default = "default_true")]
    pub before_file_delete: bool,
    #[serde(default = "default_true")]
    pub before_git_push: bool,
    #[serde(default = "default_true")]
    pub before_deploy: bool,
    #[serde(default = "default_true")]
    pub before_schema_change: bool,
}

fn default_turn_interval() -> u32 {
    10
}

impl Default for CheckpointsConfig {
    fn default() -> Self {
        Self {
            turn_interval: default_turn_interval(),
            before_new_issue: false,
            after_issue_complete: true,
            on_regression_failure: true,
            on_blocker: true,
            on_uncertainty: false,
            on_context_high: true,
            before_file_delete: true,
            before_git_push: true,
            before_deploy: true,
            before_schema_change: true,
        }
    }
}

/// `[execution.approval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Minutes to wait for a decision; 0 waits indefinitely
    #[serde(default = "default_approval_timeout")]
    pub timeout_minutes: u64,
    #[serde(default)]
    pub default_action: DefaultAction,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelKind>,
}

fn default_approval_timeout() -> u64 {
    30
}

fn default_channels() -> Vec<ChannelKind> {
    vec![ChannelKind::Terminal]
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_approval_timeout(),
            default_action: DefaultAction::default(),
            channels: default_channels(),
        }
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_minutes == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_minutes * 60))
        }
    }
}

/// `[execution.limits]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns_per_session: u32,
    #[serde(default = "default_max_files")]
    pub max_files_modified: u32,
    #[serde(default = "default_max_lines")]
    pub max_lines_changed: u32,
    #[serde(default = "default_context_warning")]
    pub context_warning_percent: u8,
    #[serde(default = "default_context_critical")]
    pub context_critical_percent: u8,
}

fn default_max_turns() -> u32 {
    50
}

fn default_max_files() -> u32 {
    20
}

fn default_max_lines() -> u32 {
    1000
}

fn default_context_warning() -> u8 {
    70
}

fn default_context_critical() -> u8 {
    90
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_turns_per_session: default_max_turns(),
            max_files_modified: default_max_files(),
            max_lines_changed: default_max_lines(),
            context_warning_percent: default_context_warning(),
            context_critical_percent: default_context_critical(),
        }
    }
}

/// `[execution]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSection {
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub checkpoints: CheckpointsConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

/// The complete tether.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherToml {
    #[serde(default)]
    pub state_provider: StateProviderSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub execution: ExecutionSection,
}

impl TetherToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse tether.toml")
    }

    /// Load from `<tether_dir>/tether.toml`, or defaults if the file is missing.
    pub fn load_or_default(tether_dir: &Path) -> Result<Self> {
        let config_path = tether_dir.join("tether.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize tether.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `TETHER_MODE` and `TETHER_PROVIDER` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var("TETHER_MODE") {
            self.execution.mode = mode.parse()?;
        }
        if let Ok(provider) = std::env::var("TETHER_PROVIDER") {
            self.state_provider.provider_type = provider.parse()?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let provider = &self.state_provider;

        match provider.provider_type {
            ProviderType::Github if provider.repository.is_none() => {
                warnings.push("state_provider.type = \"github\" requires repository".to_string());
            }
            ProviderType::Linear if provider.team_id.is_none() => {
                warnings.push("state_provider.type = \"linear\" requires team_id".to_string());
            }
            _ => {}
        }

        if provider.provider_type.is_remote() && std::env::var(provider.api_key_var()).is_err() {
            warnings.push(format!(
                "API key environment variable {} is not set",
                provider.api_key_var()
            ));
        }

        if provider.max_retries == 0 {
            warnings.push("state_provider.max_retries = 0 disables retries".to_string());
        }

        let limits = &self.execution.limits;
        if limits.context_warning_percent >= limits.context_critical_percent {
            warnings.push(format!(
                "context_warning_percent ({}) should be below context_critical_percent ({})",
                limits.context_warning_percent, limits.context_critical_percent
            ));
        }
        if limits.context_critical_percent > 100 {
            warnings.push("context_critical_percent cannot exceed 100".to_string());
        }
        if limits.max_turns_per_session == 0 {
            warnings.push("max_turns_per_session = 0 prevents any work".to_string());
        }

        if self.execution.approval.channels.is_empty() {
            warnings.push(
                "execution.approval.channels is empty; checkpoints resolve to default_action"
                    .to_string(),
            );
        }

        if self.session.regression_testing != RegressionTesting::Disabled
            && self.session.regression_command.trim().is_empty()
        {
            warnings.push("session.regression_command is empty".to_string());
        }

        warnings
    }
}

/// Runtime configuration: resolved paths plus the parsed file.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub tether_dir: PathBuf,
    pub config_file: PathBuf,
    pub marker_file: PathBuf,
    pub state_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub log_dir: PathBuf,
    pub stop_file: PathBuf,
    pub checkpoint_file: PathBuf,
    pub decision_file: PathBuf,
    pub verbose: bool,
    pub toml: TetherToml,
}

impl Config {
    /// Resolve paths for `project_dir` and load `tether.toml` with env overrides.
    pub fn load(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let tether_dir = project_dir.join(TETHER_DIR);
        let mut toml = TetherToml::load_or_default(&tether_dir)?;
        toml.apply_env()?;
        Ok(Self::with_toml(project_dir, toml, verbose))
    }

    /// Build a config from an already-parsed file. Used by tests.
    pub fn with_toml(project_dir: PathBuf, toml: TetherToml, verbose: bool) -> Self {
        let tether_dir = project_dir.join(TETHER_DIR);
        Self {
            config_file: tether_dir.join("tether.toml"),
            marker_file: tether_dir.join("project_state.json"),
            state_dir: tether_dir.join("state"),
            snapshot_dir: tether_dir.join("snapshot"),
            log_dir: tether_dir.join("logs"),
            stop_file: tether_dir.join("stop"),
            checkpoint_file: tether_dir.join("checkpoint.json"),
            decision_file: tether_dir.join("decision.json"),
            tether_dir,
            project_dir,
            verbose,
            toml,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.tether_dir)
            .context("Failed to create .tether directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }
}
