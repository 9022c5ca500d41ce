//! CLI command implementations.

mod config;
mod initialize;
mod restore;
mod snapshot;
mod start;

pub use config::{run_config, ConfigArgs};
pub use initialize::{run_initialize, InitializeArgs};
pub use restore::{run_restore, RestoreArgs};
pub use snapshot::{run_snapshot, SnapshotArgs};
pub use start::{run_start, StartArgs};

use crate::core::config::{Config, ConfigOverrides};
use anyhow::Result;
use std::path::Path;

/// Load the configuration file and apply global overrides.
pub(crate) fn load_config(path: &Path, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = Config::from_file(path)?;
    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}

/// Initialize the tracing subscriber from the configured level.
pub(crate) fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
