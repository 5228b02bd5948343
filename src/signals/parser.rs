//! Signal parsing from agent output.
//!
//! Extracts control signals from text using regex patterns for:
//! - `<task-complete/>`
//! - `<criterion>2</criterion>`
//! - `<blocker>description</blocker>` and `<uncertain>description</uncertain>`
//! - `<action>git_push</action>`
//! - `<decision rationale="why">what</decision>`
//! - `<context>85%</context>`, `<files-modified>4</files-modified>`,
//!   `<lines-changed>120</lines-changed>`

use super::types::{AgentSignals, DecisionSignal};
use crate::checkpoint::ActionKind;
use regex::Regex;
use std::sync::LazyLock;

static COMPLETE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<task-complete\s*/>|<task-complete>\s*</task-complete>").unwrap());

static CRITERION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<criterion>\s*#?(\d{1,3})\s*</criterion>").unwrap());

static BLOCKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<blocker>(.*?)</blocker>").unwrap());

static UNCERTAIN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<uncertain>(.*?)</uncertain>").unwrap());

static ACTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<action>\s*([A-Za-z_-]+)\s*</action>").unwrap());

static DECISION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<decision(?:\s+rationale="([^"]*)")?\s*>(.*?)</decision>"#).unwrap()
});

static CONTEXT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<context>\s*(\d{1,3})%?\s*</context>").unwrap());

static FILES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<files-modified>\s*(\d+)\s*</files-modified>").unwrap());

static LINES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<lines-changed>\s*(\d+)\s*</lines-changed>").unwrap());

fn texts(regex: &Regex, text: &str) -> Vec<String> {
    regex
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn last_number<T: std::str::FromStr>(regex: &Regex, text: &str) -> Option<T> {
    regex
        .captures_iter(text)
        .filter_map(|cap| cap.get(1)?.as_str().parse::<T>().ok())
        .last()
}

/// Extract all signals from one turn of agent output.
pub fn extract_signals(text: &str) -> AgentSignals {
    let mut signals = AgentSignals::new();

    signals.task_complete = COMPLETE_REGEX.is_match(text);

    for n in CRITERION_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap[1].parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        if !signals.criteria.contains(&n) {
            signals.criteria.push(n);
        }
    }

    signals.blockers = texts(&BLOCKER_REGEX, text);
    signals.uncertainties = texts(&UNCERTAIN_REGEX, text);

    for cap in ACTION_REGEX.captures_iter(text) {
        match cap[1].parse::<ActionKind>() {
            Ok(action) if !signals.actions.contains(&action) => signals.actions.push(action),
            Ok(_) => {}
            Err(e) => tracing::debug!("ignoring action signal: {}", e),
        }
    }

    for cap in DECISION_REGEX.captures_iter(text) {
        let decision = cap[2].trim();
        if decision.is_empty() {
            continue;
        }
        signals.decisions.push(DecisionSignal {
            decision: decision.to_string(),
            rationale: cap
                .get(1)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        });
    }

    signals.context_percent = last_number::<u16>(&CONTEXT_REGEX, text).map(|p| p.min(100) as u8);
    signals.files_modified = last_number(&FILES_REGEX, text);
    signals.lines_changed = last_number(&LINES_REGEX, text);

    if !signals.is_empty() {
        tracing::debug!(
            complete = signals.task_complete,
            criteria = ?signals.criteria,
            blockers = signals.blockers.len(),
            actions = ?signals.actions,
            context = ?signals.context_percent,
            "agent signals"
        );
    }
    signals
}
