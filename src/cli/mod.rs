use clap::{ArgGroup, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "task-review",
    about = "Review, keep, or revert the edits an agent made during one task"
)]
pub struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/task-review/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the change blocks between two files.
    Diff(DiffArgs),
    /// Print added/removed line counts between two files.
    Stat(StatArgs),
    /// Run a command as the agent and review what it changed.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// File before the change. A missing file counts as not existing yet.
    pub before: PathBuf,
    /// File after the change. A missing file counts as deleted.
    pub after: PathBuf,
    /// Print the file diff as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct StatArgs {
    pub before: PathBuf,
    pub after: PathBuf,
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("decision").args(["keep_all", "revert_all", "revert"])))]
pub struct RunArgs {
    /// Workspace the command runs in.
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Milliseconds between incremental rebuilds (overrides config).
    #[arg(short, long)]
    pub interval: Option<u64>,

    /// Keep every change once the command finishes.
    #[arg(long)]
    pub keep_all: bool,

    /// Revert every change once the command finishes.
    #[arg(long)]
    pub revert_all: bool,

    /// Revert the changes to this file (repeatable).
    #[arg(long, value_name = "PATH")]
    pub revert: Vec<String>,

    /// Print the review as JSON.
    #[arg(long)]
    pub json: bool,

    /// Command to run, after `--`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

/// Parse CLI arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
