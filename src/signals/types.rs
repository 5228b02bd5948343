//! Signal types emitted by the coding agent.

use serde::{Deserialize, Serialize};

use crate::checkpoint::ActionKind;

/// `<decision rationale="...">...</decision>`: an architecture decision to
/// record in META.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSignal {
    pub decision: String,
    /// Empty when the agent gave none
    #[serde(default)]
    pub rationale: String,
}

/// Everything extracted from one agent turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSignals {
    /// `<task-complete/>`
    pub task_complete: bool,
    /// 1-based indices from `<criterion>n</criterion>`, deduplicated in order
    pub criteria: Vec<usize>,
    pub blockers: Vec<String>,
    pub uncertainties: Vec<String>,
    pub actions: Vec<ActionKind>,
    pub decisions: Vec<DecisionSignal>,
    /// Last `<context>NN%</context>` value, clamped to 100
    pub context_percent: Option<u8>,
    pub files_modified: Option<u32>,
    pub lines_changed: Option<u32>,
}

impl AgentSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_blocker(&self) -> bool {
        !self.blockers.is_empty()
    }

    /// All blockers joined for display.
    pub fn blocker_text(&self) -> Option<String> {
        (!self.blockers.is_empty()).then(|| self.blockers.join("; "))
    }

    pub fn uncertainty_text(&self) -> Option<String> {
        (!self.uncertainties.is_empty()).then(|| self.uncertainties.join("; "))
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        let signals = AgentSignals::new();
        assert!(signals.is_empty());
        assert!(!signals.has_blocker());
        assert!(signals.blocker_text().is_none());
    }

    #[test]
    fn test_blocker_text_joins() {
        let signals = AgentSignals {
            blockers: vec!["Need API key".into(), "Schema unclear".into()],
            ..AgentSignals::default()
        };
        assert_eq!(signals.blocker_text().unwrap(), "Need API key; Schema unclear");
        assert!(!signals.is_empty());
    }
}
