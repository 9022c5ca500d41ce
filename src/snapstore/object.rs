//! Cloud snap store over the `object_store` crate.
//!
//! One implementation covers S3, ABS, GCS and the S3-compatible
//! services (Swift, OSS, OCS, ECS) through an endpoint override.
//! Credentials are resolved from the provider's environment by the
//! underlying builders; Trellis only probes their modification time
//! for rotation detection (see [`super::snapstore_secret_modified_time`]).
//!
//! # Versioning and object lock
//!
//! The provider-neutral client lists only the latest version of each
//! key, so non-latest versions never surface here. It has no API for
//! reading object tags or the bucket's lock configuration: hiding
//! versions via `x-etcd-snapshot-exclude` is the responsibility of
//! whatever tooling sets that tag, and the bucket's object-lock
//! retention window is supplied through
//! [`SnapstoreConfig::object_lock_retention_secs`] so the garbage
//! collector can respect it.

use super::{snapshots_from_keys, SnapStore, SnapstoreConfig, SnapstoreProvider, DEFAULT_CHUNK_SIZE};
use crate::core::error::{TrellisError, TrellisResult};
use crate::snapshot::types::Snapshot;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Snap store backed by a cloud object service.
pub struct ObjectSnapStore {
    inner: Arc<dyn ObjectStore>,
    prefix: String,
    temp_dir: PathBuf,
    retention_period: Option<chrono::Duration>,
}

fn map_store_error(key: &str, err: object_store::Error) -> TrellisError {
    match err {
        object_store::Error::NotFound { .. } => TrellisError::SnapshotNotFound {
            key: key.to_string(),
        },
        other => TrellisError::transient(format!("object store: {other}")),
    }
}

impl ObjectSnapStore {
    /// Build the provider client for the configured service.
    pub fn new(config: &SnapstoreConfig) -> TrellisResult<Self> {
        let configuration =
            |e: object_store::Error| TrellisError::configuration(format!("object store: {e}"));

        let inner: Arc<dyn ObjectStore> = match config.provider {
            SnapstoreProvider::Gcs => Arc::new(
                GoogleCloudStorageBuilder::from_env()
                    .with_bucket_name(config.container.clone())
                    .build()
                    .map_err(configuration)?,
            ),
            SnapstoreProvider::Abs => Arc::new(
                MicrosoftAzureBuilder::from_env()
                    .with_container_name(config.container.clone())
                    .build()
                    .map_err(configuration)?,
            ),
            SnapstoreProvider::S3
            | SnapstoreProvider::Swift
            | SnapstoreProvider::Oss
            | SnapstoreProvider::Ocs
            | SnapstoreProvider::Ecs => {
                let mut builder =
                    AmazonS3Builder::from_env().with_bucket_name(config.container.clone());
                if let Some(endpoint) = &config.endpoint {
                    builder = builder.with_endpoint(endpoint.clone());
                }
                Arc::new(builder.build().map_err(configuration)?)
            }
            SnapstoreProvider::Local | SnapstoreProvider::Fake => {
                return Err(TrellisError::configuration(format!(
                    "provider {} is not served by the object snap store",
                    config.provider
                )))
            }
        };

        Ok(Self {
            inner,
            prefix: config.prefix.clone(),
            temp_dir: config.temp_dir.clone(),
            retention_period: config
                .object_lock_retention_secs
                .map(|secs| chrono::Duration::seconds(secs as i64)),
        })
    }

    fn location(&self, snap: &Snapshot) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(snap.key())
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, snap.key()))
        }
    }

    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(key)
        }
    }
}

#[async_trait]
impl SnapStore for ObjectSnapStore {
    async fn fetch(&self, snap: &Snapshot) -> TrellisResult<Box<dyn Read + Send>> {
        let location = self.location(snap);
        let key = location.to_string();
        let result = self
            .inner
            .get(&location)
            .await
            .map_err(|e| map_store_error(&key, e))?;

        // Spool to the scratch directory so callers get a plain
        // reader without holding the whole object in memory.
        std::fs::create_dir_all(&self.temp_dir)
            .map_err(|e| TrellisError::transient(format!("create temp dir: {e}")))?;
        let mut spool = tempfile::tempfile_in(&self.temp_dir)
            .map_err(|e| TrellisError::transient(format!("create spool file: {e}")))?;

        let mut stream = result.into_stream();
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| map_store_error(&key, e))?
        {
            spool
                .write_all(&chunk)
                .map_err(|e| TrellisError::transient(format!("spool download: {e}")))?;
        }
        spool
            .seek(std::io::SeekFrom::Start(0))
            .map_err(|e| TrellisError::transient(format!("rewind spool: {e}")))?;
        Ok(Box::new(spool))
    }

    async fn save(&self, snap: &Snapshot, mut reader: Box<dyn Read + Send>) -> TrellisResult<()> {
        let location = self.location(snap);
        let key = location.to_string();

        let mut first = vec![0u8; DEFAULT_CHUNK_SIZE];
        let filled = read_full(&mut reader, &mut first)
            .map_err(|e| TrellisError::transient(format!("read upload stream: {e}")))?;
        first.truncate(filled);

        if filled < DEFAULT_CHUNK_SIZE {
            // Small object: single put.
            self.inner
                .put(&location, PutPayload::from(Bytes::from(first)))
                .await
                .map_err(|e| map_store_error(&key, e))?;
            return Ok(());
        }

        // Multipart path; an abandoned upload is never visible.
        let upload = self
            .inner
            .put_multipart(&location)
            .await
            .map_err(|e| map_store_error(&key, e))?;
        let mut writer = WriteMultipart::new(upload);
        writer.write(&first);
        loop {
            let mut chunk = vec![0u8; DEFAULT_CHUNK_SIZE];
            let n = read_full(&mut reader, &mut chunk)
                .map_err(|e| TrellisError::transient(format!("read upload stream: {e}")))?;
            if n == 0 {
                break;
            }
            writer.write(&chunk[..n]);
            if n < DEFAULT_CHUNK_SIZE {
                break;
            }
        }
        writer
            .finish()
            .await
            .map_err(|e| map_store_error(&key, e))?;
        Ok(())
    }

    async fn list(&self) -> TrellisResult<Vec<Snapshot>> {
        let prefix = if self.prefix.is_empty() {
            None
        } else {
            Some(ObjectPath::from(self.prefix.clone()))
        };
        let metas: Vec<object_store::ObjectMeta> = self
            .inner
            .list(prefix.as_ref())
            .try_collect()
            .await
            .map_err(|e| map_store_error(&self.prefix, e))?;
        let keys: Vec<String> = metas
            .iter()
            .map(|m| self.relative_key(m.location.as_ref()).to_string())
            .collect();
        Ok(snapshots_from_keys(keys.iter().map(String::as_str)))
    }

    async fn delete(&self, snap: &Snapshot) -> TrellisResult<()> {
        let location = self.location(snap);
        let key = location.to_string();
        self.inner
            .delete(&location)
            .await
            .map_err(|e| map_store_error(&key, e))
    }

    async fn size(&self, snap: &Snapshot) -> TrellisResult<i64> {
        let location = self.location(snap);
        let key = location.to_string();
        let meta = self
            .inner
            .head(&location)
            .await
            .map_err(|e| map_store_error(&key, e))?;
        Ok(meta.size as i64)
    }

    fn retention_period(&self) -> Option<chrono::Duration> {
        self.retention_period
    }
}

fn read_full(reader: &mut (dyn Read + Send), buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
