//! Project initialization and session commands: `tether init`, `tether start`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;

use super::super::Cli;
use tether::session::{RecoveryCase, RecoveryReport};

fn print_recovery(report: &RecoveryReport) {
    let case = match report.case {
        RecoveryCase::Initialized => style("initialized").green(),
        RecoveryCase::Resumed => style("resumed").cyan(),
        RecoveryCase::Degraded => style("degraded").yellow(),
    };
    println!("Project state: {}", case);
    println!("Progress:      {}", report.progress);
    println!("Regression:    {}", report.meta.regression_status);
    if !report.meta.current_focus.is_empty() {
        println!("Focus:         {}", report.meta.current_focus);
    }
    if let Some(pending) = &report.meta.pending_checkpoint {
        println!("Pending:       {}", pending.summary());
    }
    if !report.stale_fields.is_empty() {
        println!();
        println!(
            "{} Running on the local snapshot. Possibly stale: {}",
            style("!").yellow().bold(),
            report.stale_fields.join(", ")
        );
    }
    for warning in &report.warnings {
        println!("{} {}", style("!").yellow().bold(), warning);
    }
    println!();
}

pub async fn cmd_init(project_dir: &Path, cli: &Cli, spec: &Path) -> Result<()> {
    use tether::config::{Config, TetherToml};
    use tether::provider;
    use tether::session::SessionManager;

    let document = std::fs::read_to_string(spec)
        .with_context(|| format!("Failed to read requirements document {}", spec.display()))?;

    let config = Config::load(project_dir, cli.verbose)?;
    config.ensure_directories()?;
    if !config.config_file.exists() {
        TetherToml::default().save(&config.config_file)?;
        println!("Created {}", config.config_file.display());
    }

    let provider = provider::from_config(&config)?;
    let mut manager = SessionManager::new(&config, provider)?;
    let report = manager
        .recover(Some(&document))
        .await
        .context("Failed to initialize project state")?;

    match report.case {
        RecoveryCase::Initialized => {
            println!(
                "Initialized tether project with {} task(s) at {}",
                report.progress.total,
                config.tether_dir.display()
            );
            println!();
            for task in &report.tasks {
                println!(
                    "  {:<8} {} {}",
                    task.id,
                    style(task.priority).dim(),
                    task.title
                );
            }
            println!();
            println!("Next steps:");
            println!("  1. Set [session] regression_command in .tether/tether.toml");
            println!("  2. Run `tether start` to begin the first session");
        }
        _ => {
            println!("Project already initialized; the requirements document was not re-read.");
            println!();
            print_recovery(&report);
        }
    }
    Ok(())
}

pub async fn cmd_start(
    project_dir: &Path,
    cli: &Cli,
    resume: bool,
    mode: Option<&str>,
    max_turns: Option<u32>,
) -> Result<()> {
    use tether::checkpoint::channel;
    use tether::config::Config;
    use tether::orchestrator::{
        CancelFlag, CodingAgent, CommandAgent, CommandVerifier, Driver, StopReason, Verifier,
    };
    use tether::provider;
    use tether::session::SessionManager;
    use tether::ui::SessionUi;

    let mut config = Config::load(project_dir, cli.verbose)?;
    if let Some(mode) = mode {
        config.toml.execution.mode = mode.parse()?;
    }
    if let Some(turns) = max_turns {
        config.toml.execution.limits.max_turns_per_session = turns;
    }
    config.ensure_directories()?;
    for warning in config.toml.validate() {
        println!("{} {}", style("warning:").yellow(), warning);
    }

    let provider = provider::from_config(&config)?;
    let mut manager = SessionManager::new(&config, provider)?;
    let report = manager.recover(None).await?;
    print_recovery(&report);

    let agent: Arc<dyn CodingAgent> = Arc::new(CommandAgent::new(&config));
    let verifier: Arc<dyn Verifier> = Arc::new(CommandVerifier::new(&config));
    let channels = channel::from_config(&config);
    let cancel = CancelFlag::new();
    cancel.install_ctrl_c();
    let ui = SessionUi::new(
        &report.progress,
        config.toml.execution.limits.max_turns_per_session,
        cli.verbose,
    );

    println!(
        "Starting session in {} mode",
        style(config.toml.execution.mode).bold()
    );
    let outcome = manager
        .with_session(resume, |scope| {
            let driver = Driver::new(&config, scope.provider.clone(), agent, verifier, channels, cancel)
                .with_ui(ui);
            async move { driver.run(&scope.session_id).await }
        })
        .await?;

    println!();
    println!(
        "{} turn(s), {} task(s) completed",
        outcome.turns, outcome.tasks_completed
    );
    match outcome.reason {
        StopReason::Paused => {
            if let Some(pending) = &outcome.pending_checkpoint {
                println!("Paused at {}", pending.summary());
            }
            println!("Run `tether start` to review the checkpoint and continue.");
        }
        StopReason::Completed => println!("{}", style("All tasks are done.").green().bold()),
        StopReason::NoReadyTask => {
            println!("No task is ready. Check blocked tasks with `tether tasks --status blocked`.")
        }
        other => println!("Stopped: {}", other),
    }
    Ok(())
}
