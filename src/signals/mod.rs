//! Control signals the coding agent embeds in its output.
//!
//! The agent reports progress and requests through small XML-like tags:
//! completed criteria, blockers, uncertainty, risky actions it is about to
//! take, architecture decisions, and how full its context window is. The
//! driver turns these into task updates and checkpoint triggers.

mod parser;
mod types;

pub use parser::extract_signals;
pub use types::{AgentSignals, DecisionSignal};
