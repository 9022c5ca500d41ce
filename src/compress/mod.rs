//! Streaming (de)compression with policy-tagged suffixes.
//!
//! Three named policies: gzip, lz4, zlib. Each owns a fixed file-name
//! suffix which becomes part of the object name and is the
//! authoritative way to pick a decompressor on restore. An empty
//! suffix means raw bytes; an unrecognised one is an error.
//!
//! Both directions are streamed: neither the snapshotter nor the
//! restorer ever holds a whole payload in memory on account of
//! compression.

use crate::core::error::{TrellisError, TrellisResult};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Suffix for gzip-compressed snapshots.
pub const GZIP_SUFFIX: &str = ".gz";
/// Suffix for lz4-compressed snapshots.
pub const LZ4_SUFFIX: &str = ".lz4";
/// Suffix for zlib-compressed snapshots.
pub const ZLIB_SUFFIX: &str = ".zlib";
/// Suffix for uncompressed snapshots.
pub const PLAIN_SUFFIX: &str = "";

/// All non-empty suffixes recognised by the snapshot name parser.
pub const RECOGNISED_SUFFIXES: [&str; 3] = [GZIP_SUFFIX, ZLIB_SUFFIX, LZ4_SUFFIX];

const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Named compression policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionPolicy {
    Gzip,
    Lz4,
    Zlib,
}

impl CompressionPolicy {
    /// The object-name suffix owned by this policy.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Gzip => GZIP_SUFFIX,
            Self::Lz4 => LZ4_SUFFIX,
            Self::Zlib => ZLIB_SUFFIX,
        }
    }

    /// Resolve a policy from an object-name suffix.
    ///
    /// The empty suffix resolves to `None` (raw bytes); anything else
    /// outside the recognised set is an error.
    pub fn from_suffix(suffix: &str) -> TrellisResult<Option<Self>> {
        match suffix {
            PLAIN_SUFFIX => Ok(None),
            GZIP_SUFFIX => Ok(Some(Self::Gzip)),
            LZ4_SUFFIX => Ok(Some(Self::Lz4)),
            ZLIB_SUFFIX => Ok(Some(Self::Zlib)),
            other => Err(TrellisError::UnsupportedCompression {
                suffix: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for CompressionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gzip => write!(f, "gzip"),
            Self::Lz4 => write!(f, "lz4"),
            Self::Zlib => write!(f, "zlib"),
        }
    }
}

/// Compression settings for the snapshotter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Whether snapshots are compressed before upload.
    #[serde(default)]
    pub enabled: bool,

    /// Policy used when compression is enabled.
    #[serde(default = "default_policy")]
    pub policy: CompressionPolicy,
}

fn default_policy() -> CompressionPolicy {
    CompressionPolicy::Gzip
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: default_policy(),
        }
    }
}

impl CompressionConfig {
    /// Suffix to embed in new snapshot names.
    pub fn suffix(&self) -> &'static str {
        if self.enabled {
            self.policy.suffix()
        } else {
            PLAIN_SUFFIX
        }
    }
}

/// Write sink shared between an encoder and the reader draining it.
#[derive(Clone, Default)]
struct SharedBuf(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

impl SharedBuf {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum PolicyEncoder {
    Gzip(flate2::write::GzEncoder<SharedBuf>),
    Zlib(flate2::write::ZlibEncoder<SharedBuf>),
    Lz4(lz4::Encoder<SharedBuf>),
}

impl PolicyEncoder {
    fn new(policy: CompressionPolicy, sink: SharedBuf) -> TrellisResult<Self> {
        Ok(match policy {
            CompressionPolicy::Gzip => Self::Gzip(flate2::write::GzEncoder::new(
                sink,
                flate2::Compression::default(),
            )),
            CompressionPolicy::Zlib => Self::Zlib(flate2::write::ZlibEncoder::new(
                sink,
                flate2::Compression::default(),
            )),
            CompressionPolicy::Lz4 => Self::Lz4(
                lz4::EncoderBuilder::new()
                    .build(sink)
                    .map_err(|e| TrellisError::internal(format!("lz4 encoder: {e}")))?,
            ),
        })
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Gzip(w) => w.write_all(buf),
            Self::Zlib(w) => w.write_all(buf),
            Self::Lz4(w) => w.write_all(buf),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            Self::Gzip(w) => {
                w.finish()?;
            }
            Self::Zlib(w) => {
                w.finish()?;
            }
            Self::Lz4(w) => {
                let (_, result) = w.finish();
                result?;
            }
        }
        Ok(())
    }
}

/// Adapter that compresses an inner reader chunk by chunk.
///
/// Holds at most one input chunk plus the encoder's own buffering at
/// any time.
struct CompressingReader {
    inner: Box<dyn Read + Send>,
    encoder: Option<PolicyEncoder>,
    sink: SharedBuf,
    pending: Vec<u8>,
    offset: usize,
}

impl CompressingReader {
    fn refill(&mut self) -> std::io::Result<()> {
        let mut chunk = [0u8; COPY_CHUNK_SIZE];
        while self.encoder.is_some() {
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                if let Some(encoder) = self.encoder.take() {
                    encoder.finish()?;
                }
                self.pending = self.sink.drain();
                self.offset = 0;
                return Ok(());
            }
            if let Some(encoder) = self.encoder.as_mut() {
                encoder.write(&chunk[..n])?;
            }
            let produced = self.sink.drain();
            if !produced.is_empty() {
                self.pending = produced;
                self.offset = 0;
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Read for CompressingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.pending.len() {
            if self.encoder.is_none() {
                return Ok(0);
            }
            self.pending.clear();
            self.offset = 0;
            self.refill()?;
            if self.pending.is_empty() {
                return Ok(0);
            }
        }
        let n = (self.pending.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

/// Wrap a reader so that reading from the result yields the
/// compressed byte stream.
pub fn compress_stream(
    reader: Box<dyn Read + Send>,
    policy: CompressionPolicy,
) -> TrellisResult<Box<dyn Read + Send>> {
    let sink = SharedBuf::default();
    Ok(Box::new(CompressingReader {
        inner: reader,
        encoder: Some(PolicyEncoder::new(policy, sink.clone())?),
        sink,
        pending: Vec::new(),
        offset: 0,
    }))
}

/// Wrap a reader so that reading from the result yields the
/// decompressed byte stream for the policy named by `suffix`.
///
/// The empty suffix passes the reader through untouched.
pub fn decompress_stream(
    reader: Box<dyn Read + Send>,
    suffix: &str,
) -> TrellisResult<Box<dyn Read + Send>> {
    match CompressionPolicy::from_suffix(suffix)? {
        None => Ok(reader),
        Some(CompressionPolicy::Gzip) => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        Some(CompressionPolicy::Zlib) => Ok(Box::new(flate2::read::ZlibDecoder::new(reader))),
        Some(CompressionPolicy::Lz4) => Ok(Box::new(
            lz4::Decoder::new(reader)
                .map_err(|e| TrellisError::internal(format!("lz4 decoder: {e}")))?,
        )),
    }
}
