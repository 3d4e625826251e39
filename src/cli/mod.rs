//! CLI-specific functionality for taskhub
//!
//! This module contains argument parsing, configuration discovery and the
//! message-to-task routes used by the `taskhub` binary.

pub mod args;
pub mod config;
pub mod routes;

pub use args::{Args, ExecutionMode, MessageSource, RunConfig};
pub use config::ConfigDiscovery;
pub use routes::{install_default_routes, task_from_message};
