//! Talking to a running session: `tether stop`, `tether decide`.

use anyhow::{Context, Result};
use std::path::Path;

use tether::config::Config;

fn initialized_config(project_dir: &Path) -> Result<Config> {
    let config = Config::load(project_dir, false)?;
    if !config.tether_dir.exists() {
        anyhow::bail!("Project not initialized. Run 'tether init --spec <file>' first.");
    }
    Ok(config)
}

pub fn cmd_stop(project_dir: &Path) -> Result<()> {
    let config = initialized_config(project_dir)?;
    std::fs::write(&config.stop_file, chrono::Utc::now().to_rfc3339())
        .with_context(|| format!("Failed to write {}", config.stop_file.display()))?;
    println!("Stop requested. The session ends after the current turn and writes its handoff.");
    Ok(())
}

pub fn cmd_decide(project_dir: &Path, resolution: &str, note: Option<String>) -> Result<()> {
    use tether::checkpoint::Resolution;
    use tether::checkpoint::channel::{read_waiting, write_decision};

    let resolution: Resolution = resolution.parse().map_err(anyhow::Error::msg)?;
    if resolution == Resolution::Redirect && note.as_deref().is_none_or(|n| n.trim().is_empty()) {
        anyhow::bail!("redirect needs guidance for the agent: pass --note \"...\"");
    }

    let config = initialized_config(project_dir)?;
    let Some(waiting) = read_waiting(&config.checkpoint_file)? else {
        anyhow::bail!("No checkpoint is waiting for a decision.");
    };

    write_decision(&config.decision_file, resolution, note)?;
    println!("Recorded '{}' for {}", resolution, waiting.summary());
    Ok(())
}
