//! tidesink-core - data model and catalog resolution for tidesink
//!
//! Tidesink is the write side of a data-replication destination. This
//! crate holds the pieces every other crate builds on:
//!
//! - Stream catalog types and the pure catalog resolver
//! - Record and staged-artifact types with size accounting
//! - Engine and destination configuration
//! - The shared error type with category classification
//!
//! No I/O happens here; everything is a pure data structure or pure
//! function.

pub mod catalog;
pub mod config;
pub mod error;
pub mod record;
pub mod report;

pub use catalog::{
    resolve_catalog, CatalogOptions, ColumnSpec, FieldType, ParsedCatalog, StreamConfig,
    StreamDescriptor, SyncMode, TableId, DEFAULT_RAW_NAMESPACE,
};
pub use config::{DestinationConfig, SensitiveString, StagingCompression, SyncConfig};
pub use error::{ErrorCategory, Result, SyncError};
pub use record::{columns, RawRecord, Record, StagedArtifact, StreamKey, SyncEvent};
pub use report::{StreamSummary, SyncReport};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::catalog::{
        resolve_catalog, CatalogOptions, ColumnSpec, FieldType, ParsedCatalog, StreamConfig,
        StreamDescriptor, SyncMode, TableId,
    };
    pub use crate::config::{SensitiveString, StagingCompression, SyncConfig};
    pub use crate::error::{ErrorCategory, Result, SyncError};
    pub use crate::record::{columns, RawRecord, Record, StagedArtifact, StreamKey, SyncEvent};
    pub use crate::report::{StreamSummary, SyncReport};
}
