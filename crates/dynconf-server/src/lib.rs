//! Dynconf agent library
//!
//! Loads the agent configuration, initialises logging and runs the policy
//! subscriptions of one service against the configured config center.

pub mod agent;
pub mod config;
pub mod startup;

pub use agent::{Agent, run};
pub use config::{BackendKind, Cli, Configuration};
