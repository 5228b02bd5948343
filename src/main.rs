use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

mod cmd;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version, about = "Session continuity and task orchestration for autonomous coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a project from a requirements document
    Init {
        /// Markdown requirements document; each `## ` heading is a feature
        #[arg(long)]
        spec: PathBuf,
    },
    /// Run a coding session
    Start {
        /// Close a session left open by a crashed process and continue
        #[arg(long)]
        resume: bool,

        /// Execution mode: autonomous, interactive, supervised
        #[arg(long)]
        mode: Option<String>,

        /// Maximum agent turns for this session
        #[arg(long)]
        max_turns: Option<u32>,
    },
    /// Show progress, regression state and any waiting checkpoint
    Status,
    /// List tasks
    Tasks {
        /// todo, in_progress, done, blocked
        #[arg(long)]
        status: Option<String>,

        /// functional, style, infrastructure, testing, bugfix
        #[arg(long)]
        category: Option<String>,

        /// Only tasks carrying this label (repeatable)
        #[arg(long)]
        label: Vec<String>,
    },
    /// Show the session log
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// List recorded sessions instead of log lines
        #[arg(long)]
        sessions: bool,
    },
    /// Ask the running session to stop after the current turn
    Stop,
    /// Answer a waiting checkpoint
    Decide {
        /// continue, pause, abort or redirect
        resolution: String,

        /// Guidance for the agent; required with redirect
        #[arg(long)]
        note: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default tether.toml file
    Init,
}

/// How long exit waits on blocking work, such as a terminal prompt whose
/// checkpoint was already settled by a timeout or another channel.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> Result<()> {
    block_on_then_shutdown(run())
}

/// Run `future` on a fresh runtime, then shut down without waiting on
/// blocking tasks that are still parked on stdin.
fn block_on_then_shutdown<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    output
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = project_dir.join(tether::config::TETHER_DIR).join("logs");
    let _guard = tether::logging::init(Some(&log_dir), cli.verbose);

    match &cli.command {
        Commands::Init { spec } => cmd::cmd_init(&project_dir, &cli, spec).await?,
        Commands::Start {
            resume,
            mode,
            max_turns,
        } => cmd::cmd_start(&project_dir, &cli, *resume, mode.as_deref(), *max_turns).await?,
        Commands::Status => cmd::cmd_status(&project_dir, &cli).await?,
        Commands::Tasks {
            status,
            category,
            label,
        } => {
            cmd::cmd_tasks(&project_dir, &cli, status.as_deref(), category.as_deref(), label)
                .await?
        }
        Commands::Logs { lines, sessions } => {
            cmd::cmd_logs(&project_dir, &cli, *lines, *sessions).await?
        }
        Commands::Stop => cmd::cmd_stop(&project_dir)?,
        Commands::Decide { resolution, note } => {
            cmd::cmd_decide(&project_dir, resolution, note.clone())?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_exit_does_not_wait_for_abandoned_prompt() {
        let started = Instant::now();
        let answered = block_on_then_shutdown(async {
            let prompt = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(30)));
            Ok(tokio::time::timeout(Duration::from_millis(50), prompt).await.is_ok())
        })
        .unwrap();
        assert!(!answered);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
