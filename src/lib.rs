pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod logging;
pub mod meta;
pub mod orchestrator;
pub mod provider;
pub mod regression;
pub mod session;
pub mod signals;
pub mod task;
pub mod ui;
