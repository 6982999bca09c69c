//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use ferrule_core::run::EventKind;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to pipeline file (defaults to `default_pipeline` from config)
        path: Option<PathBuf>,
    },

    /// Show the instances a run would create, without executing anything
    Plan {
        /// Path to pipeline file
        path: Option<PathBuf>,

        #[command(flatten)]
        event: EventArgs,

        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,
    },

    /// Execute a pipeline locally for an event
    Run {
        /// Path to pipeline file
        path: Option<PathBuf>,

        #[command(flatten)]
        event: EventArgs,

        /// JSON file of secret name to value
        #[arg(long)]
        secrets_file: Option<PathBuf>,

        /// Directory steps run in
        #[arg(short, long)]
        workspace: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<FormatArg>,
    },

    /// Print the JSON schema of pipeline definitions
    Schema,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct EventArgs {
    /// Event kind: push, pull_request or tag_push
    #[arg(short, long, default_value = "push", value_parser = parse_event)]
    pub event: EventKind,

    /// Git ref the event refers to
    #[arg(short = 'r', long = "ref", default_value = "refs/heads/main")]
    pub git_ref: String,
}

fn parse_event(value: &str) -> Result<EventKind, String> {
    value.parse()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },

    /// Print the configuration file path
    Path,
}
