use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ref",
    version,
    about = "Run provider metrics over a dataset catalog and record the results"
)]
pub struct Cli {
    /// Config file. Defaults to `$REF_CONFIGURATION/ref.yaml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Raise the default log level to debug. `RUST_LOG` still wins.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute every outstanding metric the catalog implies
    Solve(SolveArgs),
    /// List configured providers and their metrics
    Providers,
}

#[derive(clap::Args, Debug, Clone)]
pub struct SolveArgs {
    /// JSON catalog: an array of rows with `source_type`, `instance_id`, `path` and facets
    #[arg(long)]
    pub catalog: PathBuf,

    /// Time budget in seconds for dispatching work
    #[arg(long, default_value_t = 86_400)]
    pub timeout: u64,

    /// Re-run executions that already have a successful result
    #[arg(long)]
    pub force: bool,
}
