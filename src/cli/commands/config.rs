//! `trellis config` - configuration operations.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub operation: ConfigOperation,
}

/// Configuration operations.
#[derive(Subcommand, Debug)]
pub enum ConfigOperation {
    /// Parse and validate the configuration file.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

/// Run a configuration operation.
pub fn run_config(config_path: &std::path::Path, args: ConfigArgs) -> Result<()> {
    let config = Config::from_file(config_path)?;
    match args.operation {
        ConfigOperation::Validate => {
            println!("configuration is valid");
        }
        ConfigOperation::Show => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
