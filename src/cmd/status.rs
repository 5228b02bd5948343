//! Read-only views: `tether status`, `tether tasks`, `tether logs`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use super::super::Cli;

pub async fn cmd_status(project_dir: &Path, cli: &Cli) -> Result<()> {
    use tether::checkpoint::channel::read_waiting;
    use tether::config::Config;
    use tether::meta::RegressionStatus;
    use tether::provider;
    use tether::session::MarkerFile;

    println!();
    println!("Tether Project Status");
    println!("=====================");
    println!();

    let config = Config::load(project_dir, cli.verbose)?;
    let Some(marker) = MarkerFile::load(&config.marker_file)? else {
        println!("Project: Not initialized");
        println!();
        println!("Run 'tether init --spec <file>' to initialize the project.");
        println!();
        return Ok(());
    };

    println!("Project:  {}", marker.project_id);
    println!("Provider: {}", config.toml.state_provider.provider_type);
    println!("Mode:     {}", config.toml.execution.mode);
    if let Some(last) = &marker.last_session {
        let ended = match last.ended_at {
            Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => style("still open").yellow().to_string(),
        };
        println!(
            "Last session: {} ({} task(s) completed, ended {})",
            last.id, last.tasks_completed, ended
        );
    }
    println!();

    let provider = provider::from_config(&config)?;
    let meta = provider
        .get_meta()
        .await
        .context("Failed to read project state")?;
    let summary = provider.get_progress_summary().await?;
    println!("Progress:   {}", summary);

    if let Some(meta) = meta {
        let regression = match meta.regression_status {
            RegressionStatus::Passing => style(meta.regression_status.to_string()).green(),
            RegressionStatus::Failing => style(meta.regression_status.to_string()).red().bold(),
            RegressionStatus::Unknown => style(meta.regression_status.to_string()).dim(),
        };
        println!("Regression: {}", regression);
        if let Some(details) = &meta.regression_details {
            println!("  failing check: {}", details.test);
            println!("  since:         {}", details.since.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("  fix task:      {}", details.fix_task);
            if let Some(cause) = &details.likely_cause {
                println!("  likely cause:  {}", cause);
            }
        }
        if !meta.current_focus.is_empty() {
            println!("Focus:      {}", meta.current_focus);
        }
        println!("Decisions:  {}", meta.architecture_decisions.len());
        if let Some(pending) = &meta.pending_checkpoint {
            println!();
            println!("{} {}", style("Pending checkpoint:").magenta().bold(), pending.summary());
        }
    }

    if let Some(waiting) = read_waiting(&config.checkpoint_file)? {
        println!();
        println!(
            "{} {}",
            style("Waiting for decision:").magenta().bold(),
            waiting.summary()
        );
        println!("  Answer with `tether decide <continue|pause|abort|redirect> [--note ...]`");
    }
    println!();
    Ok(())
}

pub async fn cmd_tasks(
    project_dir: &Path,
    cli: &Cli,
    status: Option<&str>,
    category: Option<&str>,
    labels: &[String],
) -> Result<()> {
    use tether::config::Config;
    use tether::provider;
    use tether::task::{Category, TaskFilter, TaskStatus, criteria_progress};

    let filter = TaskFilter {
        status: status
            .map(|s| s.parse::<TaskStatus>())
            .transpose()
            .map_err(anyhow::Error::msg)?,
        category: category
            .map(|c| c.parse::<Category>())
            .transpose()
            .map_err(anyhow::Error::msg)?,
        labels: labels.to_vec(),
    };

    let config = Config::load(project_dir, cli.verbose)?;
    if !config.marker_file.exists() {
        anyhow::bail!("Project not initialized. Run 'tether init --spec <file>' first.");
    }
    let provider = provider::from_config(&config)?;
    let tasks = provider.get_tasks(&filter).await?;

    if tasks.is_empty() {
        println!("No tasks match.");
        return Ok(());
    }

    println!(
        "{:<8} {:<12} {:<4} {:<14} Title",
        "ID", "Status", "Pri", "Criteria"
    );
    println!(
        "{:<8} {:<12} {:<4} {:<14} -----",
        "--------", "------------", "----", "--------------"
    );
    for task in &tasks {
        let status = format!("{:<12}", task.status.as_str());
        let status = match task.status {
            TaskStatus::Done => style(status).green(),
            TaskStatus::InProgress => style(status).cyan(),
            TaskStatus::Blocked => style(status).yellow(),
            TaskStatus::Todo => style(status).dim(),
        };
        println!(
            "{:<8} {} {:<4} {:<14} {}",
            task.id,
            status,
            task.priority.to_string(),
            criteria_progress(task).to_string(),
            task.title
        );
    }
    println!();
    println!("{} task(s)", tasks.len());
    Ok(())
}

pub async fn cmd_logs(project_dir: &Path, cli: &Cli, lines: usize, sessions: bool) -> Result<()> {
    use tether::config::Config;
    use tether::logging::{latest_log_file, tail_file};
    use tether::provider;

    let config = Config::load(project_dir, cli.verbose)?;

    if sessions {
        if !config.marker_file.exists() {
            anyhow::bail!("Project not initialized. Run 'tether init --spec <file>' first.");
        }
        let provider = provider::from_config(&config)?;
        let sessions = provider.list_sessions().await?;
        if sessions.is_empty() {
            println!("No sessions recorded yet.");
            return Ok(());
        }
        for session in sessions {
            let ended = session
                .ended_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "open".to_string());
            let summary = session.summary.lines().next().unwrap_or("");
            println!(
                "{:<24} {} → {:<16} {:>3} done  {}",
                session.session_id,
                session.started_at.format("%Y-%m-%d %H:%M"),
                ended,
                session.tasks_completed,
                style(summary).dim()
            );
        }
        return Ok(());
    }

    match latest_log_file(&config.log_dir)? {
        Some(path) => {
            println!("{}", style(path.display()).dim());
            for line in tail_file(&path, lines)? {
                println!("{}", line);
            }
        }
        None => println!("No log files in {}", config.log_dir.display()),
    }
    Ok(())
}
