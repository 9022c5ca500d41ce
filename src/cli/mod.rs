//! Command-line interface.
//!
//! Unified CLI for the Trellis sidecar: the long-running server plus
//! one-shot snapshot, restore and initialization operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Trellis - continuous backup and disaster recovery sidecar for
/// revisioned key-value stores.
#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the sidecar: initialize, elect, snapshot.
    Start(commands::StartArgs),
    /// One-shot snapshot operations against the store.
    Snapshot(commands::SnapshotArgs),
    /// Restore the data directory from the latest chain.
    Restore(commands::RestoreArgs),
    /// Validate and initialize the data directory once.
    Initialize(commands::InitializeArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}
