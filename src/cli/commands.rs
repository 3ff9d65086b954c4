//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stackwright - dependency-ordered cloud stack provisioning.
#[derive(Parser, Debug)]
#[command(name = "stackwright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the stack document.
    #[arg(short, long, global = true, env = "STACKWRIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "STACKWRIGHT_LOG_JSON")]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stack.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the stack document.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Print the dependency graph.
    Graph {
        /// Print Graphviz DOT instead of an edge list.
        #[arg(long)]
        dot: bool,
    },

    /// Generate and display the operation plan.
    Plan {
        /// Show detailed diff information.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Provision the stack.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show recorded resource status.
    Status {
        /// Show attributes of each resource.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Compare recorded attributes with what providers report.
    Drift,

    /// Delete provisioned resources.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Only delete these resources (repeatable).
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },

    /// Show resolved attributes and stack outputs.
    Outputs,

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroy_targets() {
        let cli = Cli::try_parse_from([
            "stackwright",
            "destroy",
            "--target",
            "api",
            "-t",
            "worker",
            "--yes",
        ])
        .unwrap();
        let Commands::Destroy { yes, targets } = cli.command else {
            panic!("expected destroy");
        };
        assert!(yes);
        assert_eq!(targets, vec!["api", "worker"]);
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["stackwright", "plan", "--output", "json", "-v"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(cli.verbose);
    }
}
