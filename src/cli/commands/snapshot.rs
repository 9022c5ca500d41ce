//! `trellis snapshot` - one-shot snapshot operations.

use super::{init_tracing, load_config};
use crate::compress::compress_stream;
use crate::core::config::ConfigOverrides;
use crate::kv::embedded::EmbeddedKv;
use crate::kv::KvClient;
use crate::snapshot::types::{Snapshot, SnapshotKind};
use crate::snapstore::{get_snapstore, SnapStore};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};

/// Arguments for the snapshot command.
#[derive(Args, Debug)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    pub operation: SnapshotOperation,
}

/// Snapshot operations.
#[derive(Subcommand, Debug)]
pub enum SnapshotOperation {
    /// List snapshots stored under the configured prefixes.
    List,
    /// Take one full snapshot of the data directory now.
    Take {
        /// Mark the snapshot as terminating its generation.
        #[arg(long)]
        is_final: bool,
    },
}

/// Run a snapshot operation.
pub async fn run_snapshot(
    config_path: &std::path::Path,
    log_level: Option<String>,
    args: SnapshotArgs,
) -> Result<()> {
    let config = load_config(
        config_path,
        &ConfigOverrides {
            log_level,
            ..Default::default()
        },
    )?;
    init_tracing(&config.telemetry.log_level);

    let store = get_snapstore(&config.snapstore).context("failed to create snap store")?;

    match args.operation {
        SnapshotOperation::List => {
            let snaps = store.list().await?;
            if snaps.is_empty() {
                println!("no snapshots found");
                return Ok(());
            }
            for snap in snaps {
                println!(
                    "{:<5} {:>12} {:>12}  {}  {}",
                    snap.kind.label(),
                    snap.start_revision,
                    snap.last_revision,
                    snap.created_on.to_rfc3339(),
                    snap.key(),
                );
            }
        }
        SnapshotOperation::Take { is_final } => {
            let kv = EmbeddedKv::open(
                &config.kv.data_dir,
                &config.kv.cluster_name,
                &config.kv.member_id,
            )
            .context("failed to open the kv data directory")?;

            let last_revision = kv.latest_revision().await?;
            let snap = Snapshot::new(
                SnapshotKind::Full,
                0,
                last_revision,
                config.compression.suffix(),
                is_final,
            );
            let mut reader = kv.snapshot_stream().await?;
            if config.compression.enabled {
                reader = compress_stream(reader, config.compression.policy)?;
            }
            store.save(&snap, reader).await?;
            kv.close().ok();
            println!("saved full snapshot {}", snap.key());
        }
    }
    Ok(())
}
