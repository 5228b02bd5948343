//! Payload validation, immutability checks and status transitions.

use chrono::{DateTime, Utc};

use super::{Comment, Priority, Task, TaskPatch, TaskPayload, TaskStatus, push_unique};
use crate::errors::{StateError, StateResult};

pub const TITLE_MIN_CHARS: usize = 10;
pub const TITLE_MAX_CHARS: usize = 100;
pub const CRITERION_MIN_CHARS: usize = 10;

/// Words that carry no testable meaning on their own.
const VAGUE_TERMS: &[&str] = &["properly", "correctly", "good", "works", "work", "working"];

/// Filler that does not rescue a vague criterion.
const FILLER: &[&str] = &[
    "a", "an", "the", "it", "this", "that", "everything", "all", "feature", "should", "must",
    "is", "are", "be", "and", "very", "well", "fine", "as", "expected", "really",
];

/// Validate a create payload. All problems are reported together.
pub fn validate_payload(payload: &TaskPayload) -> StateResult<()> {
    let mut problems = Vec::new();

    let title_len = payload.title.trim().chars().count();
    if !(TITLE_MIN_CHARS..=TITLE_MAX_CHARS).contains(&title_len) {
        problems.push(format!(
            "title must be {}-{} characters, got {}",
            TITLE_MIN_CHARS, TITLE_MAX_CHARS, title_len
        ));
    }

    if let Err(e) = Priority::new(payload.priority) {
        problems.push(e);
    }

    if payload.acceptance_criteria.is_empty() {
        problems.push("acceptance_criteria must not be empty".to_string());
    }
    for (i, criterion) in payload.acceptance_criteria.iter().enumerate() {
        let trimmed = criterion.trim();
        if trimmed.chars().count() < CRITERION_MIN_CHARS {
            problems.push(format!(
                "acceptance criterion {} is shorter than {} characters: '{}'",
                i + 1,
                CRITERION_MIN_CHARS,
                trimmed
            ));
        } else if is_vague(trimmed) {
            problems.push(format!(
                "acceptance criterion {} is not testable: '{}'",
                i + 1,
                trimmed
            ));
        }
    }

    if payload.dependencies.iter().any(|d| d.trim().is_empty()) {
        problems.push("dependencies must not contain empty ids".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(StateError::Validation(problems))
    }
}

/// A criterion is vague when it uses a banned term and nothing else concrete.
fn is_vague(criterion: &str) -> bool {
    let words: Vec<String> = criterion
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();

    let has_vague = words.iter().any(|w| VAGUE_TERMS.contains(&w.as_str()));
    let has_concrete = words
        .iter()
        .any(|w| !VAGUE_TERMS.contains(&w.as_str()) && !FILLER.contains(&w.as_str()));
    has_vague && !has_concrete
}

/// Names of requirement fields the patch would actually change.
fn changed_requirements(task: &Task, patch: &TaskPatch) -> Vec<String> {
    let mut fields = Vec::new();
    if patch.title.as_ref().is_some_and(|t| t.trim() != task.title) {
        fields.push("title".to_string());
    }
    if patch
        .description
        .as_ref()
        .is_some_and(|d| *d != task.description)
    {
        fields.push("description".to_string());
    }
    if patch
        .acceptance_criteria
        .as_ref()
        .is_some_and(|c| *c != task.acceptance_criteria)
    {
        fields.push("acceptance_criteria".to_string());
    }
    if patch
        .test_steps
        .as_ref()
        .is_some_and(|s| *s != task.test_steps)
    {
        fields.push("test_steps".to_string());
    }
    if patch.category.is_some_and(|c| c != task.category) {
        fields.push("category".to_string());
    }
    if patch.priority.is_some_and(|p| p != task.priority.get()) {
        fields.push("priority".to_string());
    }
    fields
}

/// Check whether `task` may move to `to`.
pub fn check_transition(task: &Task, to: TaskStatus) -> StateResult<()> {
    use TaskStatus::*;

    let from = task.status;
    if from == to {
        return Ok(());
    }
    let legal = matches!(
        (from, to),
        (Todo, InProgress)
            | (Todo, Blocked)
            | (InProgress, Done)
            | (InProgress, Blocked)
            | (Blocked, Todo)
            | (Blocked, InProgress)
    );
    if !legal || (from == Blocked && task.superseded_by().is_some()) {
        return Err(StateError::InvalidTransition {
            task_id: task.id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

/// Apply `patch` to `task` in place.
///
/// `status_of` resolves dependency ids to their current status. Nothing is
/// modified when an error is returned. Returns `true` when the task moved to
/// `done` with this patch.
pub fn apply_patch<F>(
    task: &mut Task,
    patch: &TaskPatch,
    status_of: F,
    now: DateTime<Utc>,
) -> StateResult<bool>
where
    F: Fn(&str) -> Option<TaskStatus>,
{
    let changed = changed_requirements(task, patch);
    if task.requirements_locked() && !changed.is_empty() {
        return Err(StateError::ImmutableFieldViolation {
            task_id: task.id.clone(),
            fields: changed,
        });
    }

    let dependencies = patch
        .dependencies
        .clone()
        .unwrap_or_else(|| task.dependencies.clone());

    let mut became_done = false;
    if let Some(to) = patch.status {
        check_transition(task, to)?;
        if to == TaskStatus::InProgress && task.status != TaskStatus::InProgress {
            let pending: Vec<String> = dependencies
                .iter()
                .filter(|d| status_of(d.as_str()) != Some(TaskStatus::Done))
                .cloned()
                .collect();
            if !pending.is_empty() {
                return Err(StateError::DependenciesIncomplete {
                    task_id: task.id.clone(),
                    pending,
                });
            }
        }
        became_done = to == TaskStatus::Done && task.status != TaskStatus::Done;
    }

    if !task.requirements_locked() && patch.touches_requirements() {
        let candidate = TaskPayload {
            title: patch.title.clone().unwrap_or_else(|| task.title.clone()),
            description: patch
                .description
                .clone()
                .unwrap_or_else(|| task.description.clone()),
            acceptance_criteria: patch
                .acceptance_criteria
                .clone()
                .unwrap_or_else(|| task.acceptance_criteria.clone()),
            test_steps: patch
                .test_steps
                .clone()
                .unwrap_or_else(|| task.test_steps.clone()),
            priority: patch.priority.unwrap_or(task.priority.get()),
            category: patch.category.unwrap_or(task.category),
            labels: Vec::new(),
            dependencies: Vec::new(),
        };
        validate_payload(&candidate)?;
        task.title = candidate.title.trim().to_string();
        task.description = candidate.description;
        task.acceptance_criteria = candidate.acceptance_criteria;
        task.test_steps = candidate.test_steps;
        task.priority = Priority(candidate.priority);
        task.category = candidate.category;
    }

    if let Some(status) = patch.status {
        task.status = status;
    }
    if let Some(labels) = &patch.labels {
        task.labels.clear();
        for label in labels {
            push_unique(&mut task.labels, label.trim());
        }
    }
    for label in &patch.add_labels {
        push_unique(&mut task.labels, label.trim());
    }
    task.labels.retain(|l| !patch.remove_labels.contains(l));
    if let Some(assignee) = &patch.assigned_to {
        task.assigned_to = assignee.clone();
    }
    task.dependencies = dependencies;
    if let Some(body) = &patch.comment {
        task.comments.push(Comment {
            body: body.clone(),
            created_at: now,
        });
    }
    task.updated_at = now;
    Ok(became_done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::payload;
    use crate::task::{Category, TaskStatus};

    fn task() -> Task {
        Task::from_payload("T-1".into(), &payload("Implement login form"), Utc::now()).unwrap()
    }

    fn no_deps(_: &str) -> Option<TaskStatus> {
        None
    }

    #[test]
    fn test_valid_payload_passes() {
        assert!(validate_payload(&payload("Implement login form")).is_ok());
    }

    #[test]
    fn test_short_title_rejected() {
        let err = validate_payload(&payload("Login")).unwrap_err();
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn test_long_title_rejected() {
        let title = "x".repeat(101);
        assert!(validate_payload(&payload(&title)).is_err());
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let mut p = payload("Implement login form");
        p.priority = 5;
        assert!(matches!(
            validate_payload(&p),
            Err(StateError::Validation(_))
        ));
    }

    #[test]
    fn test_empty_criteria_rejected() {
        let mut p = payload("Implement login form");
        p.acceptance_criteria.clear();
        assert!(validate_payload(&p).is_err());
    }

    #[test]
    fn test_short_criterion_rejected() {
        let mut p = payload("Implement login form");
        p.acceptance_criteria.push("Fast".into());
        assert!(validate_payload(&p).is_err());
    }

    #[test]
    fn test_vague_criteria_rejected() {
        for vague in ["Everything works properly", "It works correctly", "Should be good and work well"] {
            let mut p = payload("Implement login form");
            p.acceptance_criteria = vec![vague.to_string()];
            assert!(validate_payload(&p).is_err(), "'{}' should be rejected", vague);
        }
    }

    #[test]
    fn test_concrete_criterion_with_vague_word_accepted() {
        let mut p = payload("Implement login form");
        p.acceptance_criteria = vec!["Login works with a valid email and password".to_string()];
        assert!(validate_payload(&p).is_ok());
    }

    #[test]
    fn test_all_problems_reported_together() {
        let mut p = payload("Short");
        p.priority = 0;
        p.acceptance_criteria.clear();
        match validate_payload(&p) {
            Err(StateError::Validation(problems)) => assert_eq!(problems.len(), 3),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_title_change_is_immutable_violation() {
        let mut t = task();
        let before = t.clone();
        let patch = TaskPatch {
            title: Some("A completely different title".into()),
            ..TaskPatch::default()
        };
        let err = apply_patch(&mut t, &patch, no_deps, Utc::now()).unwrap_err();
        assert!(matches!(err, StateError::ImmutableFieldViolation { .. }));
        assert_eq!(t, before);
    }

    #[test]
    fn test_violation_lists_every_changed_field() {
        let mut t = task();
        let patch = TaskPatch {
            priority: Some(1),
            category: Some(Category::Bugfix),
            acceptance_criteria: Some(vec![]),
            ..TaskPatch::default()
        };
        match apply_patch(&mut t, &patch, no_deps, Utc::now()) {
            Err(StateError::ImmutableFieldViolation { fields, .. }) => {
                assert_eq!(fields, vec!["acceptance_criteria", "category", "priority"]);
            }
            other => panic!("expected violation, got {:?}", other),
        }
    }

    #[test]
    fn test_same_value_is_not_a_change() {
        let mut t = task();
        let patch = TaskPatch {
            title: Some(t.title.clone()),
            priority: Some(t.priority.get()),
            status: Some(TaskStatus::InProgress),
            ..TaskPatch::default()
        };
        apply_patch(&mut t, &patch, no_deps, Utc::now()).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
    }

    #[test]
    fn test_todo_to_done_rejected() {
        let mut t = task();
        let err = apply_patch(&mut t, &TaskPatch::status(TaskStatus::Done), no_deps, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert_eq!(t.status, TaskStatus::Todo);
    }

    #[test]
    fn test_done_to_todo_rejected() {
        let mut t = task();
        t.status = TaskStatus::Done;
        assert!(check_transition(&t, TaskStatus::Todo).is_err());
        assert!(check_transition(&t, TaskStatus::InProgress).is_err());
    }

    #[test]
    fn test_legal_path_reports_done() {
        let mut t = task();
        assert!(!apply_patch(&mut t, &TaskPatch::status(TaskStatus::InProgress), no_deps, Utc::now()).unwrap());
        assert!(apply_patch(&mut t, &TaskPatch::status(TaskStatus::Done), no_deps, Utc::now()).unwrap());
        assert_eq!(t.status, TaskStatus::Done);
    }

    #[test]
    fn test_superseded_task_stays_blocked() {
        let mut t = task();
        t.status = TaskStatus::Blocked;
        t.labels.push("superseded-by:T-2".into());
        assert!(check_transition(&t, TaskStatus::Todo).is_err());
    }

    #[test]
    fn test_in_progress_requires_done_dependencies() {
        let mut t = task();
        t.dependencies = vec!["T-0".into(), "T-5".into()];
        let status_of = |id: &str| match id {
            "T-0" => Some(TaskStatus::Done),
            _ => Some(TaskStatus::Todo),
        };
        match apply_patch(&mut t, &TaskPatch::status(TaskStatus::InProgress), status_of, Utc::now()) {
            Err(StateError::DependenciesIncomplete { pending, .. }) => {
                assert_eq!(pending, vec!["T-5".to_string()]);
            }
            other => panic!("expected DependenciesIncomplete, got {:?}", other),
        }
        assert_eq!(t.status, TaskStatus::Todo);
    }

    #[test]
    fn test_labels_comments_and_assignee_merge() {
        let mut t = task();
        let patch = TaskPatch {
            add_labels: vec!["ui".into(), "ui".into()],
            assigned_to: Some(Some("agent-1".into())),
            comment: Some("Started".into()),
            ..TaskPatch::default()
        };
        apply_patch(&mut t, &patch, no_deps, Utc::now()).unwrap();
        let patch = TaskPatch {
            remove_labels: vec!["ui".into()],
            comment: Some("Second".into()),
            ..TaskPatch::default()
        };
        apply_patch(&mut t, &patch, no_deps, Utc::now()).unwrap();
        assert!(t.labels.is_empty());
        assert_eq!(t.assigned_to.as_deref(), Some("agent-1"));
        assert_eq!(t.comments.len(), 2);
        assert_eq!(t.comments[0].body, "Started");
    }

    #[test]
    fn test_unlocked_task_accepts_requirement_edit() {
        let mut t = task();
        t.acceptance_criteria.clear();
        let patch = TaskPatch {
            acceptance_criteria: Some(vec!["Form rejects an empty email field".into()]),
            ..TaskPatch::default()
        };
        apply_patch(&mut t, &patch, no_deps, Utc::now()).unwrap();
        assert_eq!(t.acceptance_criteria.len(), 1);
        assert!(t.requirements_locked());
    }
}
