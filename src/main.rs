//! Trellis - unified CLI entrypoint.
//!
//! Usage:
//!   trellis start --config config/trellis.toml
//!   trellis snapshot list [--config PATH]
//!   trellis snapshot take [--is-final]
//!   trellis restore [--data-dir DIR]
//!   trellis initialize [--validate-only]
//!   trellis config validate --config config/trellis.toml
//!
//! Exit codes: 0 on success, 255 on configuration or environment
//! errors, 1 otherwise.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use trellis::cli::commands::{
    run_config, run_initialize, run_restore, run_snapshot, run_start,
};
use trellis::cli::{Cli, Commands};
use trellis::error::TrellisError;

const EXIT_CONFIGURATION: u8 = 255;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/trellis.toml"));

    let result = match cli.command {
        Commands::Start(args) => run_start(&config_path, cli.log_level, args).await,
        Commands::Snapshot(args) => run_snapshot(&config_path, cli.log_level, args).await,
        Commands::Restore(args) => run_restore(&config_path, cli.log_level, args).await,
        Commands::Initialize(args) => run_initialize(&config_path, cli.log_level, args).await,
        Commands::Config(args) => run_config(&config_path, args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("trellis: {err:#}");
            if is_configuration_error(&err) {
                ExitCode::from(EXIT_CONFIGURATION)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn is_configuration_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<TrellisError>(),
            Some(TrellisError::Configuration { .. })
        ) || cause.is::<toml::de::Error>()
    })
}
