//! Stream catalog types and the catalog resolver
//!
//! The resolver maps the input list of stream descriptors to concrete
//! raw/final table identifiers. It is a pure function of its input: no
//! I/O, deterministic collision handling, stable across syncs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{Result, SyncError};
use crate::record::StreamKey;

/// Sync mode for a destination stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Append new records to the final table
    #[default]
    Append,
    /// Append with primary-key deduplication
    AppendDedup,
    /// Replace the final table's contents each sync
    Overwrite,
    /// Replace with primary-key deduplication
    OverwriteDedup,
}

impl SyncMode {
    /// Whether the merge deduplicates by primary key
    pub fn is_dedup(self) -> bool {
        matches!(self, Self::AppendDedup | Self::OverwriteDedup)
    }

    /// Whether the sync replaces existing final-table contents
    pub fn is_overwrite(self) -> bool {
        matches!(self, Self::Overwrite | Self::OverwriteDedup)
    }
}

/// Declared type of a final-table column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// true/false
    Boolean,
    /// 64-bit integer
    Integer,
    /// Double-precision number
    Number,
    /// Text
    String,
    /// Calendar date
    Date,
    /// Timestamp with timezone
    Timestamp,
    /// Arbitrary structured value, stored untyped
    Json,
}

/// A stream as declared by the ingestion source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Source namespace (schema, database), if any
    pub namespace: Option<String>,
    /// Stream name
    pub name: String,
    /// Destination sync mode
    pub sync_mode: SyncMode,
    /// Ordered primary-key field names (may be empty)
    pub primary_key: Vec<String>,
    /// Field used to pick the most recent row among duplicates
    pub cursor_field: Option<String>,
    /// Declared fields, in source order
    pub schema: Vec<(String, FieldType)>,
}

impl StreamDescriptor {
    /// Create a descriptor with defaults (append, no key, no cursor)
    pub fn new(name: impl Into<String>, schema: Vec<(String, FieldType)>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
            sync_mode: SyncMode::default(),
            primary_key: Vec::new(),
            cursor_field: None,
            schema,
        }
    }

    /// Set the namespace
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Set the sync mode
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Set the primary key fields
    pub fn primary_key(mut self, fields: Vec<String>) -> Self {
        self.primary_key = fields;
        self
    }

    /// Set the cursor field
    pub fn cursor_field(mut self, field: impl Into<String>) -> Self {
        self.cursor_field = Some(field.into());
        self
    }

    /// The stream's identity key
    pub fn key(&self) -> StreamKey {
        StreamKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// A concrete table identifier in the target store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId {
    /// Target namespace (schema)
    pub namespace: String,
    /// Table name
    pub name: String,
}

impl TableId {
    /// Create a table id
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Unquoted `namespace.name` rendering; quoting is the generator's job
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

/// Mapping of one declared field to a final-table column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Field name as it appears in record payloads
    pub field: String,
    /// Normalized destination column name
    pub column: String,
    /// Declared type
    pub field_type: FieldType,
}

/// A stream with resolved destination identifiers
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// The declared stream
    pub descriptor: StreamDescriptor,
    /// Append-only landing table
    pub raw_table: TableId,
    /// Typed, deduplicated table
    pub final_table: TableId,
    /// Field-to-column mapping, in schema order
    pub columns: Vec<ColumnSpec>,
}

impl StreamConfig {
    /// The stream's identity key
    pub fn key(&self) -> StreamKey {
        self.descriptor.key()
    }

    /// Column specs for the primary-key fields, in key order.
    ///
    /// Fields named in the key but absent from the schema were rejected
    /// by the resolver, so this lookup always succeeds.
    pub fn primary_key_columns(&self) -> Vec<&ColumnSpec> {
        self.descriptor
            .primary_key
            .iter()
            .filter_map(|field| self.columns.iter().find(|c| &c.field == field))
            .collect()
    }

    /// Column spec for the cursor field, if one is declared
    pub fn cursor_column(&self) -> Option<&ColumnSpec> {
        self.descriptor
            .cursor_field
            .as_ref()
            .and_then(|field| self.columns.iter().find(|c| &c.field == field))
    }
}

/// Options controlling catalog resolution
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CatalogOptions {
    /// Namespace for final tables when a stream declares none
    pub default_namespace: String,
    /// Override namespace for all raw tables
    pub raw_namespace: Option<String>,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            default_namespace: "public".to_string(),
            raw_namespace: None,
        }
    }
}

/// Default namespace for raw (landing) tables
pub const DEFAULT_RAW_NAMESPACE: &str = "tidesink_raw";

/// The resolved catalog for one sync. Built once at sync start,
/// read-only thereafter.
#[derive(Debug, Clone, Default)]
pub struct ParsedCatalog {
    streams: Vec<StreamConfig>,
}

impl ParsedCatalog {
    /// All resolved streams, in input order
    pub fn streams(&self) -> &[StreamConfig] {
        &self.streams
    }

    /// Look up one stream by key
    pub fn get(&self, key: &StreamKey) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| &s.key() == key)
    }

    /// Number of resolved streams
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Resolve the input streams into concrete table identifiers.
///
/// Collision rule: identifiers that normalize to the same name are
/// disambiguated by appending an 8-hex-digit FNV-1a hash of the
/// original namespace+name, so distinct inputs keep distinct and stable
/// names across syncs.
pub fn resolve_catalog(
    streams: &[StreamDescriptor],
    options: &CatalogOptions,
) -> Result<ParsedCatalog> {
    let mut seen_keys: HashSet<StreamKey> = HashSet::new();
    let mut final_names: HashSet<TableId> = HashSet::new();
    let mut raw_names: HashSet<String> = HashSet::new();
    let mut resolved = Vec::with_capacity(streams.len());

    let raw_namespace = options
        .raw_namespace
        .clone()
        .unwrap_or_else(|| DEFAULT_RAW_NAMESPACE.to_string());

    for descriptor in streams {
        let key = descriptor.key();
        if !seen_keys.insert(key.clone()) {
            return Err(SyncError::config(format!(
                "duplicate stream '{}' in catalog",
                key
            )));
        }
        validate_descriptor(descriptor)?;

        let final_namespace = descriptor
            .namespace
            .as_deref()
            .map(normalize_identifier)
            .unwrap_or_else(|| normalize_identifier(&options.default_namespace));
        let mut final_name = normalize_identifier(&descriptor.name);

        let original = format!(
            "{}.{}",
            descriptor.namespace.as_deref().unwrap_or(""),
            descriptor.name
        );
        let mut final_table = TableId::new(final_namespace.clone(), final_name.clone());
        if final_names.contains(&final_table) {
            final_name = format!("{}_{:08x}", final_name, fnv1a(&original));
            final_table = TableId::new(final_namespace.clone(), final_name.clone());
        }
        final_names.insert(final_table.clone());

        let mut raw_name = format!("{}__{}", final_namespace, final_name);
        if !raw_names.insert(raw_name.clone()) {
            raw_name = format!("{}_{:08x}", raw_name, fnv1a(&original));
            raw_names.insert(raw_name.clone());
        }
        let raw_table = TableId::new(raw_namespace.clone(), raw_name);

        resolved.push(StreamConfig {
            descriptor: descriptor.clone(),
            raw_table,
            final_table,
            columns: resolve_columns(descriptor),
        });
    }

    Ok(ParsedCatalog { streams: resolved })
}

fn validate_descriptor(descriptor: &StreamDescriptor) -> Result<()> {
    if descriptor.name.is_empty() {
        return Err(SyncError::config("stream name must not be empty"));
    }
    if descriptor.schema.is_empty() {
        return Err(SyncError::config(format!(
            "stream '{}' declares no fields",
            descriptor.key()
        )));
    }
    for field in &descriptor.primary_key {
        if !descriptor.schema.iter().any(|(name, _)| name == field) {
            return Err(SyncError::config(format!(
                "stream '{}': primary key field '{}' not in schema",
                descriptor.key(),
                field
            )));
        }
    }
    if let Some(cursor) = &descriptor.cursor_field {
        if !descriptor.schema.iter().any(|(name, _)| name == cursor) {
            return Err(SyncError::config(format!(
                "stream '{}': cursor field '{}' not in schema",
                descriptor.key(),
                cursor
            )));
        }
    }
    Ok(())
}

fn resolve_columns(descriptor: &StreamDescriptor) -> Vec<ColumnSpec> {
    let mut used: HashSet<String> = HashSet::new();
    descriptor
        .schema
        .iter()
        .map(|(field, field_type)| {
            let mut column = normalize_identifier(field);
            if !used.insert(column.clone()) {
                column = format!("{}_{:08x}", column, fnv1a(field));
                used.insert(column.clone());
            }
            ColumnSpec {
                field: field.clone(),
                column,
                field_type: *field_type,
            }
        })
        .collect()
}

/// Lowercase, map non-alphanumerics to `_`, prefix a leading digit.
///
/// Full naming-convention rule-sets are the surrounding platform's job;
/// this is the minimal normalization the engine needs to emit valid
/// identifiers.
fn normalize_identifier(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn fnv1a(input: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in input.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
