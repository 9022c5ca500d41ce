//! `trellis initialize` - one-shot data directory initialization.

use super::{init_tracing, load_config};
use crate::core::config::ConfigOverrides;
use crate::init::initializer::{Initializer, InitializerConfig};
use crate::kv::embedded::EmbeddedKv;
use crate::ops::observability::MetricsRegistry;
use anyhow::Result;
use clap::Args;
use std::sync::Arc;

/// Arguments for the initialize command.
#[derive(Args, Debug)]
pub struct InitializeArgs {
    /// Only validate; do not restore or wipe anything.
    #[arg(long)]
    pub validate_only: bool,
}

/// Validate and initialize the data directory once.
pub async fn run_initialize(
    config_path: &std::path::Path,
    log_level: Option<String>,
    args: InitializeArgs,
) -> Result<()> {
    let config = load_config(
        config_path,
        &ConfigOverrides {
            log_level,
            ..Default::default()
        },
    )?;
    init_tracing(&config.telemetry.log_level);

    let metrics = Arc::new(MetricsRegistry::new());

    if args.validate_only {
        let validator = crate::init::validator::DataValidator::new(
            config.kv.data_dir.clone(),
            &config.kv.cluster_name,
            config.kv.cluster_size,
            metrics,
        );
        let status = validator.validate(config.kv.fail_below_revision);
        println!("data directory status: {status:?}");
        return Ok(());
    }

    let kv = Arc::new(EmbeddedKv::new(&config.kv.member_id));
    let initializer = Initializer::new(
        InitializerConfig {
            data_dir: config.kv.data_dir.clone(),
            cluster_name: config.kv.cluster_name.clone(),
            member_id: config.kv.member_id.clone(),
            cluster_size: config.kv.cluster_size,
            fail_below_revision: config.kv.fail_below_revision,
            defrag_event_batch: config.restore.defrag_event_batch,
            restore_timeout_secs: config.restore.restore_timeout_secs,
            defrag_timeout_secs: config.kv.defrag_timeout_secs,
            embedded_quota_bytes: config.kv.embedded_quota_bytes,
            snapstore: Some(config.snapstore.clone()),
        },
        kv,
        metrics,
    );
    initializer.initialize().await?;
    println!("initialized data directory {}", config.kv.data_dir.display());
    Ok(())
}
