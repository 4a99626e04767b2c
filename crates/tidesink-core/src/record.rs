//! Record and ingestion event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Internal column names shared by raw and final tables.
///
/// The raw table has the fixed shape (id, emitted_at, loaded_at, data,
/// meta); final tables carry id, emitted_at and meta next to the typed
/// columns.
pub mod columns {
    /// Generated row id, assigned at serialization time
    pub const ID: &str = "_tidesink_id";
    /// Timestamp the source emitted the record
    pub const EMITTED_AT: &str = "_tidesink_emitted_at";
    /// Timestamp the typing/dedup merge processed the raw row (null until then)
    pub const LOADED_AT: &str = "_tidesink_loaded_at";
    /// Untransformed record payload
    pub const DATA: &str = "_tidesink_data";
    /// Typing errors and warnings collected during the merge
    pub const META: &str = "_tidesink_meta";
}

/// Identifies one logical stream: namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    /// Source namespace (schema, database), if any
    pub namespace: Option<String>,
    /// Stream name
    pub name: String,
}

impl StreamKey {
    /// Create a stream key without a namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Create a stream key with a namespace
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}.{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A change record delivered by the ingestion source.
///
/// Owned transiently by the buffer manager until flushed; never mutated
/// after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Stream this record belongs to
    pub stream: StreamKey,
    /// Structured payload
    pub data: serde_json::Value,
    /// Source emission timestamp
    pub emitted_at: DateTime<Utc>,
}

impl Record {
    /// Create a record stamped with the current time
    pub fn new(stream: StreamKey, data: serde_json::Value) -> Self {
        Self {
            stream,
            data,
            emitted_at: Utc::now(),
        }
    }

    /// Set the emission timestamp (builder-style)
    pub fn with_emitted_at(mut self, emitted_at: DateTime<Utc>) -> Self {
        self.emitted_at = emitted_at;
        self
    }

    /// Estimated in-memory size in bytes, used for budget accounting.
    ///
    /// A heuristic, not an exact measure: key and string lengths plus a
    /// fixed overhead per JSON node.
    pub fn estimated_size(&self) -> usize {
        const RECORD_OVERHEAD: usize = 64;
        self.stream.name.len()
            + self.stream.namespace.as_ref().map_or(0, String::len)
            + json_size(&self.data)
            + RECORD_OVERHEAD
    }
}

fn json_size(value: &serde_json::Value) -> usize {
    const NODE_OVERHEAD: usize = 16;
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::Number(_) => {
            NODE_OVERHEAD
        }
        serde_json::Value::String(s) => NODE_OVERHEAD + s.len(),
        serde_json::Value::Array(items) => {
            NODE_OVERHEAD + items.iter().map(json_size).sum::<usize>()
        }
        serde_json::Value::Object(map) => {
            NODE_OVERHEAD
                + map
                    .iter()
                    .map(|(k, v)| k.len() + json_size(v))
                    .sum::<usize>()
        }
    }
}

/// One row of a serialized staging batch.
///
/// This is the wire shape bulk-loaded into the raw table; `loaded_at`
/// and `meta` are populated later by the typing/dedup merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Generated row id
    #[serde(rename = "_tidesink_id")]
    pub id: Uuid,
    /// Source emission timestamp
    #[serde(rename = "_tidesink_emitted_at")]
    pub emitted_at: DateTime<Utc>,
    /// Untransformed payload
    #[serde(rename = "_tidesink_data")]
    pub data: serde_json::Value,
}

impl RawRecord {
    /// Assign a generated id to a buffered record
    pub fn from_record(record: Record) -> Self {
        Self {
            id: Uuid::new_v4(),
            emitted_at: record.emitted_at,
            data: record.data,
        }
    }
}

/// Reference to a staged batch, handed from the staging store to the
/// bulk-load path and back to cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    /// Stream the batch belongs to
    pub stream: StreamKey,
    /// Opaque location understood by the staging store (path, object key)
    pub location: String,
    /// Number of serialized records
    pub records: u64,
    /// Serialized (possibly compressed) size in bytes
    pub bytes: u64,
    /// Monotonic part number within the stream for this sync
    pub part: u64,
}

/// An event on the ingestion wire: a record, or the end-of-stream marker
/// for one stream.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A change record
    Record(Record),
    /// Explicit end-of-stream marker
    StreamComplete(StreamKey),
}

impl SyncEvent {
    /// Create a record event
    pub fn record(stream: StreamKey, data: serde_json::Value) -> Self {
        Self::Record(Record::new(stream, data))
    }

    /// Create an end-of-stream marker
    pub fn complete(stream: StreamKey) -> Self {
        Self::StreamComplete(stream)
    }
}
