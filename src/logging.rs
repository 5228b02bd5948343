//! Tracing setup.
//!
//! - stderr: compact, filtered by `RUST_LOG` (default `tether=info`, `tether=debug` with `--verbose`)
//! - `.tether/logs/tether.log.YYYY-MM-DD`: daily rolling file, same filter, no ANSI
//!
//! Agent prompts and outputs are written next to the log files by the agent
//! runner; they are product artifacts and do not depend on the filter.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "tether.log";

fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "tether=debug" } else { "tether=info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// so buffered file output is flushed.
///
/// Without `log_dir` (project not initialized yet) only stderr is used.
pub fn init(log_dir: Option<&Path>, verbose: bool) -> Option<WorkerGuard> {
    let stderr = fmt::layer().with_writer(std::io::stderr).compact();

    let Some(dir) = log_dir.filter(|d| d.is_dir()) else {
        let _ = tracing_subscriber::registry()
            .with(filter(verbose))
            .with(stderr)
            .try_init();
        return None;
    };

    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init();
    Some(guard)
}

/// Newest rolling log file in `log_dir`.
pub fn latest_log_file(log_dir: &Path) -> Result<Option<PathBuf>> {
    if !log_dir.exists() {
        return Ok(None);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(log_dir)
        .with_context(|| format!("Failed to read {}", log_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX))
        })
        .collect();
    // date suffixes sort lexically
    files.sort();
    Ok(files.pop())
}

/// Last `lines` lines of `path`.
pub fn tail_file(path: &Path, lines: usize) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let all: Vec<&str> = content.lines().collect();
    Ok(all[all.len().saturating_sub(lines)..]
        .iter()
        .map(|l| l.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_latest_log_file_picks_newest_date() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("tether.log.2026-01-01"), "old").unwrap();
        std::fs::write(dir.path().join("tether.log.2026-01-03"), "new").unwrap();
        std::fs::write(dir.path().join("S-1-turn-1-prompt.md"), "prompt").unwrap();

        let latest = latest_log_file(dir.path()).unwrap().unwrap();
        assert!(latest.ends_with("tether.log.2026-01-03"));
    }

    #[test]
    fn test_latest_log_file_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert!(latest_log_file(&dir.path().join("logs")).unwrap().is_none());
    }

    #[test]
    fn test_tail_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tether.log");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();
        assert_eq!(tail_file(&path, 2).unwrap(), vec!["two", "three"]);
        assert_eq!(tail_file(&path, 10).unwrap().len(), 3);
    }
}
