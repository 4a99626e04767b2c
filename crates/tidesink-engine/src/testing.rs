//! In-memory test doubles for the engine's seams
//!
//! These live in the library (not behind `cfg(test)`) so downstream
//! crates can drive the orchestrator without a warehouse:
//!
//! - [`MemoryStaging`]: staging store over a map, with per-stream
//!   failure injection
//! - [`MemoryDestination`]: a destination that executes the typing and
//!   dedup semantics in memory, for asserting merge behavior end to end
//! - [`RecordingMigrations`]: migration runner that counts invocations

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use uuid::Uuid;

use tidesink_core::catalog::{FieldType, ParsedCatalog, StreamConfig, TableId};
use tidesink_core::error::{Result, SyncError};
use tidesink_core::record::{StagedArtifact, StreamKey};
use tidesink_sql::handler::{Destination, MergeOutcome, StreamStatus};
use tidesink_sql::migration::MigrationRunner;

use crate::staging::{parse_staged_payload, StagingStore};

/// Staging store backed by an in-memory object map
#[derive(Default)]
pub struct MemoryStaging {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_from_part: Mutex<HashMap<StreamKey, u64>>,
}

impl MemoryStaging {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stage` fail for a stream from the given part number on
    pub fn fail_stream_from_part(&self, stream: StreamKey, part: u64) {
        self.fail_from_part.lock().insert(stream, part);
    }

    /// Number of artifacts currently held
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }
}

#[async_trait]
impl StagingStore for MemoryStaging {
    async fn stage(
        &self,
        stream: &StreamConfig,
        part: u64,
        payload: Vec<u8>,
        records: u64,
    ) -> Result<StagedArtifact> {
        let key = stream.key();
        if let Some(threshold) = self.fail_from_part.lock().get(&key) {
            if part >= *threshold {
                return Err(SyncError::staging(
                    key.to_string(),
                    format!("injected staging failure at part {}", part),
                ));
            }
        }
        let location = format!(
            "memory://{}/{}/part-{}.jsonl",
            stream.raw_table.namespace, stream.raw_table.name, part
        );
        let bytes = payload.len() as u64;
        self.objects.lock().insert(location.clone(), payload);
        Ok(StagedArtifact {
            stream: key,
            location,
            records,
            bytes,
            part,
        })
    }

    async fn retrieve(&self, artifact: &StagedArtifact) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .get(&artifact.location)
            .cloned()
            .ok_or_else(|| {
                SyncError::staging(
                    artifact.stream.to_string(),
                    format!("artifact not found: {}", artifact.location),
                )
            })
    }

    async fn cleanup(&self, artifact: &StagedArtifact) -> Result<()> {
        self.objects.lock().remove(&artifact.location);
        Ok(())
    }
}

/// One typed row in an in-memory final table
#[derive(Debug, Clone)]
pub struct FinalRow {
    /// Generated row id
    pub id: Uuid,
    /// Source emission timestamp
    pub emitted_at: DateTime<Utc>,
    /// Typed values keyed by column name
    pub values: serde_json::Map<String, serde_json::Value>,
    /// Fields that failed coercion to their declared type
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
struct RawRow {
    id: Uuid,
    emitted_at: DateTime<Utc>,
    loaded_at: Option<DateTime<Utc>>,
    data: serde_json::Value,
}

#[derive(Default)]
struct MemoryTables {
    raw: HashMap<TableId, Vec<RawRow>>,
    finals: HashMap<TableId, Vec<FinalRow>>,
    prepared: HashSet<StreamKey>,
}

/// Destination that executes typing and dedup semantics in memory.
///
/// Bulk loads pull artifact bytes back through the staging store, the
/// way a warehouse dereferences a staged location.
pub struct MemoryDestination {
    staging: Arc<dyn StagingStore>,
    tables: Mutex<MemoryTables>,
    fail_finalize: Mutex<HashSet<StreamKey>>,
}

impl MemoryDestination {
    /// Create a destination reading staged artifacts from `staging`
    pub fn new(staging: Arc<dyn StagingStore>) -> Self {
        Self {
            staging,
            tables: Mutex::new(MemoryTables::default()),
            fail_finalize: Mutex::new(HashSet::new()),
        }
    }

    /// Make `finalize_stream` fail for one stream
    pub fn fail_finalize_for(&self, stream: StreamKey) {
        self.fail_finalize.lock().insert(stream);
    }

    /// Rows of a final table, in table order
    pub fn final_rows(&self, table: &TableId) -> Vec<FinalRow> {
        self.tables.lock().finals.get(table).cloned().unwrap_or_default()
    }

    /// Number of rows in a raw table
    pub fn raw_row_count(&self, table: &TableId) -> usize {
        self.tables.lock().raw.get(table).map_or(0, Vec::len)
    }

    /// Seed a final table with pre-existing rows (for overwrite tests)
    pub fn seed_final_rows(&self, table: TableId, rows: Vec<FinalRow>) {
        self.tables.lock().finals.insert(table, rows);
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn initial_status(&self, stream: &StreamConfig) -> Result<StreamStatus> {
        let tables = self.tables.lock();
        let raw_table_exists = tables.raw.contains_key(&stream.raw_table);
        Ok(StreamStatus {
            raw_table_exists,
            final_table_exists: tables.finals.contains_key(&stream.final_table),
            needs_overwrite_reset: stream.descriptor.sync_mode.is_overwrite() && raw_table_exists,
            missing_columns: Vec::new(),
        })
    }

    async fn prepare_stream(&self, stream: &StreamConfig, status: &StreamStatus) -> Result<()> {
        let mut tables = self.tables.lock();
        tables.raw.entry(stream.raw_table.clone()).or_default();
        tables.finals.entry(stream.final_table.clone()).or_default();
        if status.needs_overwrite_reset {
            tables.raw.insert(stream.raw_table.clone(), Vec::new());
        }
        tables.prepared.insert(stream.key());
        Ok(())
    }

    async fn bulk_load(&self, stream: &StreamConfig, artifact: &StagedArtifact) -> Result<u64> {
        let payload = self.staging.retrieve(artifact).await?;
        let records = parse_staged_payload(artifact, &payload)?;
        let count = records.len() as u64;

        let mut tables = self.tables.lock();
        let raw = tables.raw.entry(stream.raw_table.clone()).or_default();
        raw.extend(records.into_iter().map(|r| RawRow {
            id: r.id,
            emitted_at: r.emitted_at,
            loaded_at: None,
            data: r.data,
        }));
        Ok(count)
    }

    async fn finalize_stream(&self, stream: &StreamConfig) -> Result<MergeOutcome> {
        let key = stream.key();
        if self.fail_finalize.lock().contains(&key) {
            return Err(SyncError::sql(format!(
                "injected merge failure for stream '{}'",
                key
            )));
        }

        let mut tables = self.tables.lock();
        if !tables.prepared.contains(&key) {
            return Err(SyncError::internal(format!(
                "stream '{}' finalized without being prepared",
                key
            )));
        }

        let now = Utc::now();
        let raw = tables.raw.entry(stream.raw_table.clone()).or_default();
        let mut new_rows = Vec::new();
        for row in raw.iter_mut().filter(|r| r.loaded_at.is_none()) {
            new_rows.push(type_row(stream, row));
            row.loaded_at = Some(now);
        }

        let dedup = stream.descriptor.sync_mode.is_dedup()
            && !stream.descriptor.primary_key.is_empty();
        if dedup {
            new_rows = dedup_rows(stream, new_rows);
        }
        let rows_typed = new_rows.len() as u64;

        let existing = tables
            .finals
            .entry(stream.final_table.clone())
            .or_default();
        if stream.descriptor.sync_mode.is_overwrite() {
            // Table-swap semantics: the new generation replaces the old
            // in one step, no empty-table window.
            *existing = new_rows;
        } else {
            existing.extend(new_rows);
            if dedup {
                *existing = dedup_rows(stream, std::mem::take(existing));
            }
        }
        Ok(MergeOutcome { rows_typed })
    }
}

/// Coerce one raw row to the stream's declared schema
fn type_row(stream: &StreamConfig, row: &RawRow) -> FinalRow {
    let mut values = serde_json::Map::new();
    let mut errors = Vec::new();
    for column in &stream.columns {
        let raw_value = row.data.get(&column.field).cloned().unwrap_or(serde_json::Value::Null);
        match coerce(&raw_value, column.field_type) {
            Ok(typed) => {
                values.insert(column.column.clone(), typed);
            }
            Err(()) => {
                values.insert(column.column.clone(), serde_json::Value::Null);
                errors.push(column.field.clone());
            }
        }
    }
    FinalRow {
        id: row.id,
        emitted_at: row.emitted_at,
        values,
        errors,
    }
}

/// Coerce a JSON value to a declared type. `Err` marks a typing error
/// captured into row metadata; it never fails the batch.
fn coerce(value: &serde_json::Value, field_type: FieldType) -> std::result::Result<serde_json::Value, ()> {
    use serde_json::Value;
    if value.is_null() {
        return Ok(Value::Null);
    }
    match field_type {
        FieldType::Json => Ok(value.clone()),
        FieldType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Bool(_) | Value::Number(_) => Ok(Value::String(value.to_string())),
            // Scalar extraction yields NULL for containers, silently.
            Value::Array(_) | Value::Object(_) => Ok(Value::Null),
            Value::Null => Ok(Value::Null),
        },
        FieldType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.as_str() {
                "true" | "TRUE" => Ok(Value::Bool(true)),
                "false" | "FALSE" => Ok(Value::Bool(false)),
                _ => Err(()),
            },
            _ => Err(()),
        },
        FieldType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => {
                let f = n.as_f64().ok_or(())?;
                if f.fract() == 0.0 {
                    Ok(Value::from(f as i64))
                } else {
                    Err(())
                }
            }
            Value::String(s) => s.parse::<i64>().map(Value::from).map_err(|_| ()),
            _ => Err(()),
        },
        FieldType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s.parse::<f64>().map(Value::from).map_err(|_| ()),
            _ => Err(()),
        },
        FieldType::Date => match value {
            Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|_| value.clone())
                .map_err(|_| ()),
            _ => Err(()),
        },
        FieldType::Timestamp => match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|_| value.clone())
                .map_err(|_| ()),
            Value::Number(_) => Ok(value.clone()),
            _ => Err(()),
        },
    }
}

/// Keep the authoritative row per primary key: max cursor, ties broken
/// by emitted_at, then generated id.
fn dedup_rows(stream: &StreamConfig, rows: Vec<FinalRow>) -> Vec<FinalRow> {
    let pk_columns: Vec<String> = stream
        .primary_key_columns()
        .iter()
        .map(|c| c.column.clone())
        .collect();
    let cursor = stream.cursor_column().map(|c| c.column.clone());

    let mut winners: Vec<FinalRow> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let key_values: Vec<&serde_json::Value> = pk_columns
            .iter()
            .map(|c| row.values.get(c).unwrap_or(&serde_json::Value::Null))
            .collect();
        let key = serde_json::to_string(&key_values).unwrap_or_default();
        match index.get(&key) {
            Some(&i) => {
                if rank(&row, cursor.as_deref())
                    .cmp(&rank(&winners[i], cursor.as_deref()))
                    == Ordering::Greater
                {
                    winners[i] = row;
                }
            }
            None => {
                index.insert(key, winners.len());
                winners.push(row);
            }
        }
    }
    winners
}

/// Ordering key for dedup: cursor (missing sorts lowest), emitted_at, id
fn rank<'a>(row: &'a FinalRow, cursor: Option<&str>) -> (ComparableJson<'a>, DateTime<Utc>, Uuid) {
    let cursor_value = cursor
        .and_then(|c| row.values.get(c))
        .unwrap_or(&serde_json::Value::Null);
    (ComparableJson(cursor_value), row.emitted_at, row.id)
}

/// Total order over JSON scalars: null sorts below everything, numbers
/// by value, strings lexicographically (RFC 3339 timestamps order
/// correctly), everything else by serialized text.
struct ComparableJson<'a>(&'a serde_json::Value);

impl ComparableJson<'_> {
    fn class(&self) -> u8 {
        use serde_json::Value;
        match self.0 {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) | Value::Object(_) => 4,
        }
    }
}

impl PartialEq for ComparableJson<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ComparableJson<'_> {}

impl PartialOrd for ComparableJson<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComparableJson<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        use serde_json::Value;
        match (self.0, other.0) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (a, b) if self.class() == other.class() => {
                a.to_string().cmp(&b.to_string())
            }
            _ => self.class().cmp(&other.class()),
        }
    }
}

/// Migration runner that records how often it ran
#[derive(Default)]
pub struct RecordingMigrations {
    runs: AtomicU64,
}

impl RecordingMigrations {
    /// Create a runner with zero recorded runs
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `apply_pending` was invoked
    pub fn runs(&self) -> u64 {
        self.runs.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl MigrationRunner for RecordingMigrations {
    async fn apply_pending(&self, _catalog: &ParsedCatalog) -> Result<()> {
        self.runs.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}
