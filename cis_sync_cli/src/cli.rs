use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cis-sync", version, about = "Read-only marketplace data sync")]
pub struct Cli {
    /// Local SQLite store (watermarks, run log, provisioned entities).
    /// Overrides SYNC_LOCAL_DB_PATH.
    #[arg(long, global = true)]
    pub local_db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the sync scheduler and run until Ctrl-C (default if no subcommand given).
    Run,

    /// Run a single cycle and print the run records.
    Once {
        /// Only sync this table.
        #[arg(long)]
        table: Option<String>,
    },

    /// Print sync status: mode, breaker, per-table watermarks.
    Status,

    /// Print recent sync runs, newest first.
    History {
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Run the deep health check over the recent run log.
    Health,

    /// Test connectivity and audit the external account's grants.
    Check,

    /// Reset a table's watermark so it re-syncs from the beginning.
    ResetWatermark { table: String },

    /// Enable or disable syncing for one table.
    SetEnabled {
        table: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}
