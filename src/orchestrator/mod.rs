//! Project initialization and the coding-driver loop.

pub mod agent;
pub mod driver;
pub mod initializer;
pub mod verifier;

pub use agent::{AgentReport, AgentRequest, CodingAgent, CommandAgent};
pub use driver::{CancelFlag, Driver, SessionOutcome, StopReason};
pub use initializer::{InitReport, Initializer, parse_requirements};
pub use verifier::{CommandVerifier, Verification, Verifier};
