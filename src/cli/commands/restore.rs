//! `trellis restore` - restore the data directory from the store.

use super::{init_tracing, load_config};
use crate::core::config::ConfigOverrides;
use crate::ops::observability::MetricsRegistry;
use crate::snapshot::restorer::{RestoreOptions, Restorer};
use crate::snapstore::{get_snapstore, latest_full_and_deltas};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the restore command.
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Restore into this directory instead of the configured one.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Restore the data directory from the latest snapshot chain.
pub async fn run_restore(
    config_path: &std::path::Path,
    log_level: Option<String>,
    args: RestoreArgs,
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

    let store = get_snapstore(&config.snapstore).context("failed to create snap store")?;
    let (base, deltas) = latest_full_and_deltas(store.as_ref())
        .await
        .context("failed to discover latest snapshot chain")?;
    let Some(base) = base else {
        anyhow::bail!("no snapshots found in the configured store");
    };

    let restorer = Restorer::new(store, Arc::new(MetricsRegistry::new()));
    restorer
        .restore(&RestoreOptions {
            base_snapshot: base,
            delta_snapshots: deltas,
            data_dir: config.kv.data_dir.clone(),
            cluster_name: config.kv.cluster_name.clone(),
            member_id: config.kv.member_id.clone(),
            defrag_event_batch: config.restore.defrag_event_batch,
            restore_timeout: std::time::Duration::from_secs(config.restore.restore_timeout_secs),
            defrag_timeout: std::time::Duration::from_secs(config.kv.defrag_timeout_secs),
            embedded_quota_bytes: config.kv.embedded_quota_bytes,
        })
        .await
        .context("restore failed")?;

    println!("restored data directory {}", config.kv.data_dir.display());
    Ok(())
}
