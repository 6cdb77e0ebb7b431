//! foreman: an agent-pool orchestrator.
//!
//! A request is planned into small ordered increments ([`planner`]), each
//! increment is handed to an external worker process ([`executor`]) and
//! verified, and every agent and task is persisted in a file-backed store
//! ([`store`]) that independent processes can read. [`pipeline`] ties the
//! pieces together behind a small session API.

pub mod config;
pub mod errors;
pub mod executor;
pub mod foreman_config;
pub mod logging;
pub mod pipeline;
pub mod planner;
pub mod profile;
pub mod store;
