//! Acceptance-criterion checklist state.
//!
//! Criteria are rendered as a markdown checklist. Progress is recorded by
//! appending comments with checked lines, either quoting the criterion
//! (`- [x] User can log in with email`) or by number (`- [x] #2`). Later
//! comments win, so `- [ ] #2` unchecks a criterion again.

use regex::Regex;
use std::sync::LazyLock;

use super::Task;

static CHECKBOX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[-*]?\s*\[([ xX])\]\s*(.+?)\s*$").unwrap());

static INDEX_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#(\d+)$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriteriaProgress {
    pub checked: Vec<bool>,
}

impl CriteriaProgress {
    pub fn total(&self) -> usize {
        self.checked.len()
    }

    pub fn done(&self) -> usize {
        self.checked.iter().filter(|c| **c).count()
    }

    /// All criteria checked.
    pub fn is_ready(&self) -> bool {
        !self.checked.is_empty() && self.checked.iter().all(|c| *c)
    }
}

impl std::fmt::Display for CriteriaProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} criteria", self.done(), self.total())
    }
}

fn normalize(s: &str) -> String {
    s.trim()
        .trim_end_matches('.')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Recompute criterion state from the checklist lines in a task's comments.
pub fn criteria_progress(task: &Task) -> CriteriaProgress {
    let normalized: Vec<String> = task
        .acceptance_criteria
        .iter()
        .map(|c| normalize(c))
        .collect();
    let mut checked = vec![false; normalized.len()];

    for comment in &task.comments {
        for cap in CHECKBOX_REGEX.captures_iter(&comment.body) {
            let is_checked = cap[1].eq_ignore_ascii_case("x");
            let target = cap[2].trim();

            let index = if let Some(idx) = INDEX_REGEX.captures(target) {
                idx[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .filter(|n| *n < checked.len())
            } else {
                let wanted = normalize(target);
                normalized.iter().position(|c| *c == wanted)
            };

            if let Some(i) = index {
                checked[i] = is_checked;
            }
        }
    }

    CriteriaProgress { checked }
}

/// Render criteria as a markdown checklist.
pub fn render_checklist(criteria: &[String], checked: &[bool]) -> String {
    criteria
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mark = if checked.get(i).copied().unwrap_or(false) {
                "x"
            } else {
                " "
            };
            format!("- [{}] {}", mark, c)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Comment body that checks the given 1-based criterion numbers.
pub fn check_comment(numbers: &[usize]) -> String {
    numbers
        .iter()
        .map(|n| format!("- [x] #{}", n))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::payload;
    use crate::task::{Comment, Task};
    use chrono::Utc;

    fn task_with_comments(bodies: &[&str]) -> Task {
        let mut task =
            Task::from_payload("T-1".into(), &payload("Implement login form"), Utc::now()).unwrap();
        task.comments = bodies.iter().map(|b| Comment::new(*b)).collect();
        task
    }

    #[test]
    fn test_no_comments_nothing_checked() {
        let progress = criteria_progress(&task_with_comments(&[]));
        assert_eq!(progress.total(), 2);
        assert_eq!(progress.done(), 0);
        assert!(!progress.is_ready());
    }

    #[test]
    fn test_check_by_text_ignores_case_and_period() {
        let progress =
            criteria_progress(&task_with_comments(&["- [x] user can submit the login form."]));
        assert_eq!(progress.checked, vec![true, false]);
    }

    #[test]
    fn test_check_by_number() {
        let progress = criteria_progress(&task_with_comments(&["Done:\n- [x] #2"]));
        assert_eq!(progress.checked, vec![false, true]);
    }

    #[test]
    fn test_later_comment_unchecks() {
        let progress = criteria_progress(&task_with_comments(&[
            "- [x] #1\n- [x] #2",
            "regressed:\n- [ ] #1",
        ]));
        assert_eq!(progress.checked, vec![false, true]);
    }

    #[test]
    fn test_out_of_range_number_ignored() {
        let progress = criteria_progress(&task_with_comments(&["- [x] #7", "- [x] #0"]));
        assert_eq!(progress.done(), 0);
    }

    #[test]
    fn test_all_checked_is_ready() {
        let progress = criteria_progress(&task_with_comments(&[&check_comment(&[1, 2])]));
        assert!(progress.is_ready());
        assert_eq!(progress.to_string(), "2/2 criteria");
    }

    #[test]
    fn test_render_checklist() {
        let rendered = render_checklist(
            &["First criterion".into(), "Second criterion".into()],
            &[true],
        );
        assert_eq!(rendered, "- [x] First criterion\n- [ ] Second criterion");
    }
}
