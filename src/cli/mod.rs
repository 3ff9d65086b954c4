//! Command-line interface for stackwright.
//!
//! This module provides the argument definitions and the formatting of
//! plans, pass reports, state and outputs.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
