//! Task, META and session records encoded as issues and comments.
//!
//! The visible part of an issue body is rendered for humans; the source of
//! truth is the hidden `<!-- tether:<kind> {json} -->` block at the end.
//! Hand edits to the visible text are ignored, which keeps requirements locked.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use super::{IssueDraft, RemoteComment, RemoteIssue};
use crate::errors::{StateError, StateResult};
use crate::meta::{Meta, SessionComment};
use crate::provider::Session;
use crate::task::criteria::{criteria_progress, render_checklist};
use crate::task::{Category, Comment, Priority, Task, TaskId, TaskStatus};

pub const META_LABEL: &str = "meta";
pub const DELETED_LABEL: &str = "deleted";
pub const META_TITLE: &str = "tether: project META";

const CATEGORY_PREFIX: &str = "category:";
const PRIORITY_PREFIX: &str = "priority:";
const STATUS_PREFIX: &str = "status:";

static BLOCK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--\s*tether:(task|meta|session)\s+(\{.*?\})\s*-->").unwrap()
});

#[derive(Debug, Serialize, Deserialize)]
struct TaskBlock {
    /// Older blocks carry no title; the issue title is used for those.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    description: String,
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    test_steps: Vec<String>,
    category: Category,
    priority: Priority,
    #[serde(default)]
    status: TaskStatus,
    #[serde(default)]
    dependencies: Vec<TaskId>,
    #[serde(default)]
    assigned_to: Option<String>,
    created_at: DateTime<Utc>,
}

/// Serialize a block so that it can never terminate the HTML comment early.
fn encode_block<T: Serialize>(kind: &str, value: &T) -> StateResult<String> {
    let json = serde_json::to_string(value).map_err(|e| StateError::serde(kind, e))?;
    Ok(format!(
        "<!-- tether:{} {} -->",
        kind,
        json.replace("--", "-\\u002d")
    ))
}

fn decode_block<T: DeserializeOwned>(body: &str, kind: &str) -> Option<StateResult<T>> {
    BLOCK_REGEX
        .captures_iter(body)
        .find(|cap| &cap[1] == kind)
        .map(|cap| serde_json::from_str(&cap[2]).map_err(|e| StateError::serde(kind, e)))
}

/// Body text with hidden blocks removed.
fn visible_text(body: &str) -> String {
    BLOCK_REGEX.replace_all(body, "").trim().to_string()
}

fn is_system_label(label: &str) -> bool {
    label == META_LABEL
        || label == DELETED_LABEL
        || label.starts_with(CATEGORY_PREFIX)
        || label.starts_with(PRIORITY_PREFIX)
        || label.starts_with(STATUS_PREFIX)
}

pub fn is_deleted(issue: &RemoteIssue) -> bool {
    issue.labels.iter().any(|l| l == DELETED_LABEL)
}

pub fn is_meta_issue(issue: &RemoteIssue) -> bool {
    !is_deleted(issue) && issue.labels.iter().any(|l| l == META_LABEL)
}

pub fn is_task_issue(issue: &RemoteIssue) -> bool {
    !is_deleted(issue)
        && !is_meta_issue(issue)
        && BLOCK_REGEX
            .captures_iter(&issue.body)
            .any(|cap| &cap[1] == "task")
}

pub fn task_draft(task: &Task) -> StateResult<IssueDraft> {
    let progress = criteria_progress(task);
    let mut body = String::new();
    if !task.description.trim().is_empty() {
        body.push_str(task.description.trim());
        body.push_str("\n\n");
    }
    body.push_str("## Acceptance Criteria\n");
    body.push_str(&render_checklist(&task.acceptance_criteria, &progress.checked));
    body.push_str("\n\n");
    if !task.test_steps.is_empty() {
        body.push_str("## Test Steps\n");
        for (i, step) in task.test_steps.iter().enumerate() {
            body.push_str(&format!("{}. {}\n", i + 1, step));
        }
        body.push('\n');
    }
    body.push_str(&encode_block(
        "task",
        &TaskBlock {
            title: Some(task.title.clone()),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            test_steps: task.test_steps.clone(),
            category: task.category,
            priority: task.priority,
            status: task.status,
            dependencies: task.dependencies.clone(),
            assigned_to: task.assigned_to.clone(),
            created_at: task.created_at,
        },
    )?);

    let mut labels: Vec<String> = task
        .labels
        .iter()
        .filter(|l| !is_system_label(l))
        .cloned()
        .collect();
    labels.push(format!("{}{}", CATEGORY_PREFIX, task.category));
    labels.push(format!("{}{}", PRIORITY_PREFIX, task.priority.get()));
    labels.push(format!("{}{}", STATUS_PREFIX, task.status));

    Ok(IssueDraft {
        title: task.title.clone(),
        body,
        labels,
        open: task.status != TaskStatus::Done,
    })
}

pub fn task_from_issue(issue: &RemoteIssue, comments: &[RemoteComment]) -> StateResult<Task> {
    let block: TaskBlock = decode_block(&issue.body, "task").ok_or_else(|| {
        StateError::Validation(vec![format!("issue {} carries no task block", issue.id)])
    })??;

    let title = match block.title {
        Some(title) => {
            if title != issue.title {
                tracing::warn!(issue = %issue.id, visible = %issue.title, "issue title edited by hand; keeping the recorded title");
            }
            title
        }
        None => issue.title.clone(),
    };

    // Closing an issue by hand counts as completion.
    let status = if !issue.open && block.status == TaskStatus::InProgress {
        TaskStatus::Done
    } else {
        block.status
    };

    Ok(Task {
        id: issue.id.clone(),
        title,
        description: block.description,
        acceptance_criteria: block.acceptance_criteria,
        test_steps: block.test_steps,
        category: block.category,
        priority: block.priority,
        status,
        labels: issue
            .labels
            .iter()
            .filter(|l| !is_system_label(l))
            .cloned()
            .collect(),
        assigned_to: block.assigned_to,
        dependencies: block.dependencies,
        comments: comments
            .iter()
            .map(|c| Comment {
                body: c.body.clone(),
                created_at: c.created_at,
            })
            .collect(),
        created_at: block.created_at,
        updated_at: issue.updated_at,
    })
}

pub fn meta_draft(meta: &Meta) -> StateResult<IssueDraft> {
    let mut stored = meta.clone();
    stored.session_history.clear();

    let mut body = String::from(
        "Project state maintained by tether. Session history is kept in the comments below.\n\n",
    );
    body.push_str(&format!(
        "- Regression status: **{}**\n- Current focus: {}\n- Architecture decisions: {}\n\n",
        meta.regression_status,
        if meta.current_focus.is_empty() {
            "(none)"
        } else {
            meta.current_focus.as_str()
        },
        meta.architecture_decisions.len()
    ));
    body.push_str(&encode_block("meta", &stored)?);

    Ok(IssueDraft {
        title: META_TITLE.to_string(),
        body,
        labels: vec![META_LABEL.to_string()],
        open: true,
    })
}

pub fn meta_from_issue(issue: &RemoteIssue, comments: &[RemoteComment]) -> StateResult<Meta> {
    let mut meta: Meta = decode_block(&issue.body, "meta").unwrap_or_else(|| Ok(Meta::default()))?;
    meta.session_history = comments
        .iter()
        .map(|c| SessionComment {
            body: visible_text(&c.body),
            created_at: c.created_at,
        })
        .collect();
    Ok(meta)
}

/// Comment body recording a session's state under a human headline.
pub fn session_comment(headline: &str, session: &Session) -> StateResult<String> {
    Ok(format!("{}\n\n{}", headline, encode_block("session", session)?))
}

/// Sessions recorded on the META issue, latest record per id, oldest first.
pub fn sessions_from_comments(comments: &[RemoteComment]) -> Vec<Session> {
    let mut sessions: Vec<Session> = Vec::new();
    for comment in comments {
        let Some(Ok(session)) = decode_block::<Session>(&comment.body, "session") else {
            continue;
        };
        match sessions
            .iter_mut()
            .find(|s| s.session_id == session.session_id)
        {
            Some(existing) => *existing = session,
            None => sessions.push(session),
        }
    }
    sessions.sort_by_key(|s| s.started_at);
    sessions
}
