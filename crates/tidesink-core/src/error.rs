//! Error types for the tidesink engine
//!
//! Provides granular error classification so callers can tell apart:
//! - Fatal startup conditions (configuration, connectivity, authentication)
//! - Fatal pre-merge conditions (migration failure)
//! - Flush-path failures (staging, bulk load) that halt ingestion
//! - Per-stream merge failures that leave other streams untouched

use std::fmt;
use thiserror::Error;

/// Result type for tidesink operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Configuration error (fatal at startup)
    Configuration,
    /// Connection to the target store failed (fatal at startup)
    Connection,
    /// Authentication against the target store failed (fatal at startup)
    Authentication,
    /// Writing a batch to the staging location failed
    Staging,
    /// Loading a staged artifact into a raw table failed
    BulkLoad,
    /// Statement-level SQL failure (merge, DDL)
    Sql,
    /// Migration failure (fatal for the affected sync)
    Migration,
    /// Schema mismatch that cannot be resolved additively
    Schema,
    /// Ingestion halted after a flush failure
    Halted,
    /// Record or batch serialization failure
    Serialization,
    /// Filesystem or network I/O failure
    Io,
    /// Internal invariant violation
    Internal,
}

impl ErrorCategory {
    /// Whether errors in this category abort the whole sync before or
    /// during startup, as opposed to failing a single stream or flush.
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::Configuration | Self::Connection | Self::Authentication | Self::Migration
        )
    }

    /// Whether errors in this category are reported through the flush
    /// failure signal rather than returned to the ingestion caller.
    #[inline]
    pub const fn is_flush_failure(self) -> bool {
        matches!(self, Self::Staging | Self::BulkLoad)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Connection => write!(f, "connection"),
            Self::Authentication => write!(f, "authentication"),
            Self::Staging => write!(f, "staging"),
            Self::BulkLoad => write!(f, "bulk_load"),
            Self::Sql => write!(f, "sql"),
            Self::Migration => write!(f, "migration"),
            Self::Schema => write!(f, "schema"),
            Self::Halted => write!(f, "halted"),
            Self::Serialization => write!(f, "serialization"),
            Self::Io => write!(f, "io"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for the tidesink engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration invalid or inconsistent
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Could not reach the target store
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Target store rejected the credentials
    #[error("authentication error: {message}")]
    Authentication { message: String },

    /// Staging a serialized batch failed
    #[error("staging error for stream '{stream}': {message}")]
    Staging { stream: String, message: String },

    /// Bulk-loading a staged artifact failed
    #[error("bulk load error for stream '{stream}': {message}")]
    BulkLoad { stream: String, message: String },

    /// Statement execution failed
    #[error("sql error: {message}")]
    Sql {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A migration could not be applied
    #[error("migration '{version}' failed: {message}")]
    Migration { version: String, message: String },

    /// Schema difference that additive evolution cannot cover
    #[error("schema error: {message}")]
    Schema { message: String },

    /// Ingestion halted because a flush worker reported a failure
    #[error("ingestion halted: {cause}")]
    Halted { cause: String },

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SyncError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Staging { .. } => ErrorCategory::Staging,
            Self::BulkLoad { .. } => ErrorCategory::BulkLoad,
            Self::Sql { .. } => ErrorCategory::Sql,
            Self::Migration { .. } => ErrorCategory::Migration,
            Self::Schema { .. } => ErrorCategory::Schema,
            Self::Halted { .. } => ErrorCategory::Halted,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Io,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether this error aborts the whole sync
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create a staging error for a stream
    pub fn staging(stream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Staging {
            stream: stream.into(),
            message: message.into(),
        }
    }

    /// Create a bulk-load error for a stream
    pub fn bulk_load(stream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BulkLoad {
            stream: stream.into(),
            message: message.into(),
        }
    }

    /// Create a sql error
    pub fn sql(message: impl Into<String>) -> Self {
        Self::Sql {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a sql error carrying the offending statement
    pub fn sql_with_statement(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Sql {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a migration error
    pub fn migration(version: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Migration {
            version: version.into(),
            message: message.into(),
        }
    }

    /// Create a schema error
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }

    /// Create a halted error from a flush failure cause
    pub fn halted(cause: impl Into<String>) -> Self {
        Self::Halted {
            cause: cause.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
