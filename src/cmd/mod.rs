//! CLI command implementations.
//!
//! | Module     | Commands handled             |
//! |------------|------------------------------|
//! | `project`  | `Init`, `Start`              |
//! | `status`   | `Status`, `Tasks`, `Logs`    |
//! | `control`  | `Stop`, `Decide`             |
//! | `config`   | `Config`                     |

pub mod config;
pub mod control;
pub mod project;
pub mod status;

pub use config::cmd_config;
pub use control::{cmd_decide, cmd_stop};
pub use project::{cmd_init, cmd_start};
pub use status::{cmd_logs, cmd_status, cmd_tasks};
