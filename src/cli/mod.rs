//! Command-line interface for agent-eval.
//!
//! Provides commands for running agents in the sandbox, grading raw results
//! and inspecting traces and configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
