use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Inspect, verify and replay deployment snapshots and journals", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to <config dir>/converge/converge.toml)
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check that a snapshot is internally consistent
    Verify {
        /// Snapshot file
        snapshot: PathBuf,
    },

    /// Rebuild a snapshot from a base snapshot and a journal
    Replay(ReplayArgs),

    /// List the resources recorded in a snapshot
    Show(ShowArgs),

    /// Count the changes a journal recorded
    Summary {
        /// Journal file (JSON lines)
        journal: PathBuf,
    },
}

#[derive(clap::Args)]
pub struct ReplayArgs {
    /// Snapshot the journal was recorded against
    pub base: PathBuf,

    /// Journal file (JSON lines)
    pub journal: PathBuf,

    /// Replay only the first N entries
    #[arg(long, value_name = "N")]
    pub prefix: Option<usize>,

    /// Write the resulting snapshot here
    #[arg(short, long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Verify the snapshot after every entry
    #[arg(long)]
    pub check_prefixes: bool,
}

#[derive(clap::Args)]
pub struct ShowArgs {
    /// Snapshot file
    pub snapshot: PathBuf,

    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<ShowFormat>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowFormat {
    /// Indented resource tree
    #[default]
    Tree,
    /// The snapshot as JSON
    Json,
}
