//! Differential testing of EVM clients.
//!
//! The same single-transaction state test is run on every configured client,
//! their step-by-step traces are canonicalized with [`trace_canon`], and the
//! first step at which any two clients disagree is reported as a consensus
//! bug.

pub mod artifacts;
pub mod client;
pub mod config;
pub mod env;
pub mod forks;
pub mod pipeline;
pub mod statetest;
pub mod supplier;
pub mod tracing;

/// Common information for the `--version` CLI flags.
pub fn version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}
