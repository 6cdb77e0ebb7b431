//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                      |
//! |-----------|--------------------------------------------------------|
//! | `project` | `Init`                                                 |
//! | `config`  | `Config`                                               |
//! | `run`     | `Plan`, `Run`, `Submit`                                |
//! | `agents`  | `Status`, `Stop`, `Cancel`, `Logs`, `Reconcile`, `Cleanup` |

pub mod agents;
pub mod config;
pub mod project;
pub mod run;

pub use agents::{cmd_cancel, cmd_cleanup, cmd_logs, cmd_reconcile, cmd_status, cmd_stop};
pub use config::cmd_config;
pub use project::cmd_init;
pub use run::{cmd_plan, cmd_run, cmd_submit};

use anyhow::Result;
use foreman::config::Config;
use foreman::pipeline::Session;

/// Open a session, creating the `.foreman/` layout if needed.
pub fn open_session(config: &Config) -> Result<Session> {
    config.ensure_directories()?;
    Session::open(config)
}

/// Open a session for commands that only inspect existing state.
pub fn require_session(config: &Config) -> Result<Session> {
    if !config.foreman_dir.exists() {
        anyhow::bail!("Project not initialized. Run 'foreman init' first.");
    }
    Session::open(config)
}
