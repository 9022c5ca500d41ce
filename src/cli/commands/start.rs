//! `trellis start` - the long-running sidecar.

use super::{init_tracing, load_config};
use crate::core::config::ConfigOverrides;
use crate::core::runtime::Runtime;
use crate::kv::embedded::EmbeddedKv;
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the start command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Take a final full snapshot before shutting down.
    #[arg(long, default_value_t = true)]
    pub final_snapshot: bool,

    /// Override the KV data directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Run the sidecar until a shutdown signal.
pub async fn run_start(
    config_path: &std::path::Path,
    log_level: Option<String>,
    args: StartArgs,
) -> Result<()> {
    let config = load_config(
        config_path,
        &ConfigOverrides {
            log_level,
            data_dir: args.data_dir,
            ..Default::default()
        },
    )?;
    init_tracing(&config.telemetry.log_level);

    let kv = Arc::new(EmbeddedKv::new(&config.kv.member_id));
    let data_dir = config.kv.data_dir.clone();
    let cluster_name = config.kv.cluster_name.clone();

    let mut runtime = Runtime::new(config, kv.clone())?;
    runtime.start().await?;

    // The directory is valid (or freshly restored) now; bind the
    // embedded KV member to it.
    kv.bind_data_dir(&data_dir, &cluster_name)
        .context("failed to open the kv data directory")?;

    let result = runtime.run_until_shutdown(args.final_snapshot).await;
    kv.close().ok();
    result
}
