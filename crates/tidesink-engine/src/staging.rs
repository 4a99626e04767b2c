//! Staging: serializing batches and writing them to a bulk-load location
//!
//! Batches are serialized as JSONL (one raw record per line), optionally
//! gzip-compressed, then handed to a [`StagingStore`]. The store only
//! needs to survive the duration of one sync; durability beyond that is
//! the raw table's job.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::debug;

use tidesink_core::catalog::StreamConfig;
use tidesink_core::config::StagingCompression;
use tidesink_core::error::{Result, SyncError};
use tidesink_core::record::{RawRecord, Record, StagedArtifact};

/// Intermediate storage for serialized batches.
///
/// Must tolerate concurrent staging for different streams. Staged
/// artifacts may be pre-encrypted bytes; the store does not interpret
/// the payload.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Write one serialized batch, returning a reference usable for
    /// bulk load and cleanup
    async fn stage(
        &self,
        stream: &StreamConfig,
        part: u64,
        payload: Vec<u8>,
        records: u64,
    ) -> Result<StagedArtifact>;

    /// Read a staged artifact back
    async fn retrieve(&self, artifact: &StagedArtifact) -> Result<Vec<u8>>;

    /// Delete a staged artifact
    async fn cleanup(&self, artifact: &StagedArtifact) -> Result<()>;
}

/// Serialize a batch of records into the staging wire format.
///
/// Returns the payload plus the record count (the artifact's
/// authoritative row count for reporting).
pub fn serialize_batch(
    records: Vec<Record>,
    compression: StagingCompression,
) -> Result<(Vec<u8>, u64)> {
    let count = records.len() as u64;
    let mut jsonl = Vec::new();
    for record in records {
        let raw = RawRecord::from_record(record);
        serde_json::to_writer(&mut jsonl, &raw)?;
        jsonl.push(b'\n');
    }
    let payload = match compression {
        StagingCompression::None => jsonl,
        StagingCompression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&jsonl)?;
            encoder.finish()?
        }
    };
    Ok((payload, count))
}

/// Parse a staged payload back into raw records, decompressing when the
/// artifact location says so. Used by in-process bulk-load paths.
pub fn parse_staged_payload(artifact: &StagedArtifact, payload: &[u8]) -> Result<Vec<RawRecord>> {
    let jsonl: Vec<u8> = if artifact.location.ends_with(".gz") {
        let mut decoder = GzDecoder::new(payload);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        out
    } else {
        payload.to_vec()
    };
    jsonl
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).map_err(SyncError::from))
        .collect()
}

/// File extension for the configured compression
fn extension(compression: StagingCompression) -> &'static str {
    match compression {
        StagingCompression::None => "jsonl",
        StagingCompression::Gzip => "jsonl.gz",
    }
}

/// Staging store backed by a local filesystem tree:
/// `root/<namespace>/<stream>/part-<n>.jsonl[.gz]`.
pub struct LocalStaging {
    root: PathBuf,
    compression: StagingCompression,
}

impl LocalStaging {
    /// Create a store rooted at the given directory
    pub fn new(root: impl Into<PathBuf>, compression: StagingCompression) -> Self {
        Self {
            root: root.into(),
            compression,
        }
    }

    fn stream_dir(&self, stream: &StreamConfig) -> PathBuf {
        self.root
            .join(&stream.raw_table.namespace)
            .join(&stream.raw_table.name)
    }
}

#[async_trait]
impl StagingStore for LocalStaging {
    async fn stage(
        &self,
        stream: &StreamConfig,
        part: u64,
        payload: Vec<u8>,
        records: u64,
    ) -> Result<StagedArtifact> {
        let dir = self.stream_dir(stream);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SyncError::staging(stream.key().to_string(), e.to_string()))?;

        let path = dir.join(format!("part-{}.{}", part, extension(self.compression)));
        let bytes = payload.len() as u64;
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| SyncError::staging(stream.key().to_string(), e.to_string()))?;

        debug!(
            "Stream '{}' staged part {} ({} records, {} bytes) at {}",
            stream.key(),
            part,
            records,
            bytes,
            path.display()
        );
        Ok(StagedArtifact {
            stream: stream.key(),
            location: path.to_string_lossy().into_owned(),
            records,
            bytes,
            part,
        })
    }

    async fn retrieve(&self, artifact: &StagedArtifact) -> Result<Vec<u8>> {
        tokio::fs::read(&artifact.location)
            .await
            .map_err(|e| SyncError::staging(artifact.stream.to_string(), e.to_string()))
    }

    async fn cleanup(&self, artifact: &StagedArtifact) -> Result<()> {
        tokio::fs::remove_file(&artifact.location)
            .await
            .map_err(|e| SyncError::staging(artifact.stream.to_string(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidesink_core::catalog::{resolve_catalog, CatalogOptions, FieldType, StreamDescriptor};
    use tidesink_core::record::StreamKey;

    fn stream() -> StreamConfig {
        let descriptor = StreamDescriptor::new(
            "users",
            vec![("id".to_string(), FieldType::Integer)],
        )
        .namespace("public");
        resolve_catalog(&[descriptor], &CatalogOptions::default())
            .unwrap()
            .streams()[0]
            .clone()
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::new(StreamKey::namespaced("public", "users"), json!({"id": i})))
            .collect()
    }

    #[test]
    fn test_serialize_roundtrip_plain() {
        let (payload, count) = serialize_batch(records(3), StagingCompression::None).unwrap();
        assert_eq!(count, 3);

        let artifact = StagedArtifact {
            stream: StreamKey::namespaced("public", "users"),
            location: "part-0.jsonl".to_string(),
            records: count,
            bytes: payload.len() as u64,
            part: 0,
        };
        let parsed = parse_staged_payload(&artifact, &payload).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[1].data, json!({"id": 1}));
    }

    #[test]
    fn test_gzip_payload_is_compressed_and_parses() {
        let many: Vec<Record> = (0..64)
            .map(|_| {
                Record::new(
                    StreamKey::new("t"),
                    json!({"body": "repetitive ".repeat(50)}),
                )
            })
            .collect();
        let (plain, _) = serialize_batch(many.clone(), StagingCompression::None).unwrap();
        let (gz, count) = serialize_batch(many, StagingCompression::Gzip).unwrap();
        assert!(gz.len() < plain.len() / 2);

        let artifact = StagedArtifact {
            stream: StreamKey::new("t"),
            location: "part-0.jsonl.gz".to_string(),
            records: count,
            bytes: gz.len() as u64,
            part: 0,
        };
        assert_eq!(parse_staged_payload(&artifact, &gz).unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_local_staging_stage_retrieve_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let staging = LocalStaging::new(dir.path(), StagingCompression::Gzip);
        let stream = stream();

        let (payload, count) = serialize_batch(records(5), StagingCompression::Gzip).unwrap();
        let artifact = staging.stage(&stream, 0, payload, count).await.unwrap();
        assert_eq!(artifact.records, 5);
        assert!(artifact.location.ends_with("part-0.jsonl.gz"));

        let bytes = staging.retrieve(&artifact).await.unwrap();
        assert_eq!(parse_staged_payload(&artifact, &bytes).unwrap().len(), 5);

        staging.cleanup(&artifact).await.unwrap();
        assert!(staging.retrieve(&artifact).await.is_err());
    }

    #[tokio::test]
    async fn test_local_staging_parts_are_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let staging = LocalStaging::new(dir.path(), StagingCompression::None);
        let stream = stream();

        let (p0, c0) = serialize_batch(records(1), StagingCompression::None).unwrap();
        let (p1, c1) = serialize_batch(records(2), StagingCompression::None).unwrap();
        let a0 = staging.stage(&stream, 0, p0, c0).await.unwrap();
        let a1 = staging.stage(&stream, 1, p1, c1).await.unwrap();
        assert_ne!(a0.location, a1.location);
    }
}
