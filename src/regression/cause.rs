//! Guessing which recent change broke a regression check.

use anyhow::{Context, Result};
use git2::{Repository, Sort};
use std::path::{Path, PathBuf};

/// Commits inspected by [`GitCauseFinder`].
pub const DEFAULT_DEPTH: usize = 20;

/// Tokens too common in test ids to say anything about a change.
const NOISE: &[&str] = &["test", "tests", "spec", "specs", "should", "when", "the", "and", "with"];

/// One recent change to the project.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub id: String,
    pub summary: String,
    pub paths: Vec<String>,
}

impl Change {
    fn describe(&self) -> String {
        let short: String = self.id.chars().take(8).collect();
        let mut paths = self.paths.iter().take(5).cloned().collect::<Vec<_>>().join(", ");
        if self.paths.len() > 5 {
            paths.push_str(", ...");
        }
        format!("{} \"{}\" ({})", short, self.summary, paths)
    }
}

/// Pluggable root-cause hook.
pub trait CauseFinder: Send + Sync {
    fn find_likely_cause(&self, failing_test: &str) -> Option<String>;
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .filter(|t| !NOISE.contains(&t.as_str()))
        .collect()
}

/// Change whose paths share the most tokens with the failing test id.
///
/// `changes` is newest first; ties and a zero score go to the newest change.
pub fn rank_changes<'a>(failing_test: &str, changes: &'a [Change]) -> Option<&'a Change> {
    let wanted = tokens(failing_test);
    let score = |change: &Change| -> usize {
        let haystack = change.paths.join(" ").to_lowercase();
        wanted.iter().filter(|t| haystack.contains(t.as_str())).count()
    };
    let best = changes
        .iter()
        .map(|c| (score(c), c))
        .fold(None::<(usize, &Change)>, |acc, (s, c)| match acc {
            Some((best, _)) if best >= s => acc,
            _ => Some((s, c)),
        });
    match best {
        Some((s, change)) if s > 0 => Some(change),
        _ => changes.first(),
    }
}

/// Scores the last few commits of the project's git history.
pub struct GitCauseFinder {
    repo_path: PathBuf,
    depth: usize,
}

impl GitCauseFinder {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            depth: DEFAULT_DEPTH,
        }
    }

    /// Newest first, at most `depth` commits.
    pub fn recent_changes(&self) -> Result<Vec<Change>> {
        let repo = Repository::open(&self.repo_path).context("Failed to open git repository")?;
        let mut walk = repo.revwalk()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
        if walk.push_head().is_err() {
            // unborn branch
            return Ok(Vec::new());
        }

        let mut changes = Vec::new();
        for oid in walk.take(self.depth) {
            let commit = repo.find_commit(oid?)?;
            let tree = commit.tree()?;
            let parent_tree = match commit.parent(0) {
                Ok(parent) => Some(parent.tree()?),
                Err(_) => None,
            };
            let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
            let paths = diff
                .deltas()
                .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()))
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            changes.push(Change {
                id: commit.id().to_string(),
                summary: commit.summary().unwrap_or_default().to_string(),
                paths,
            });
        }
        Ok(changes)
    }
}

impl CauseFinder for GitCauseFinder {
    fn find_likely_cause(&self, failing_test: &str) -> Option<String> {
        let changes = match self.recent_changes() {
            Ok(changes) => changes,
            Err(e) => {
                tracing::debug!(error = %e, "cause analysis skipped");
                return None;
            }
        };
        rank_changes(failing_test, &changes).map(Change::describe)
    }
}
