//! Configuration types for the tidesink engine

use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Wrapper for sensitive configuration values
///
/// Prevents accidental logging of secrets while allowing access when needed.
#[derive(Debug, Clone, JsonSchema)]
pub struct SensitiveString(#[schemars(with = "String")] SecretString);

impl SensitiveString {
    /// Create a new sensitive string
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Expose the secret value
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// Compression applied to staged artifacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StagingCompression {
    /// Plain bytes
    None,
    /// Gzip
    #[default]
    Gzip,
}

/// Engine configuration for one sync
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct SyncConfig {
    /// Global in-memory buffer budget in bytes, shared across all streams
    #[serde(default = "default_memory_budget_bytes")]
    #[validate(range(min = 1_048_576))]
    pub memory_budget_bytes: usize,

    /// Buffered bytes per stream that trigger an asynchronous flush
    #[serde(default = "default_flush_threshold_bytes")]
    #[validate(range(min = 65_536))]
    pub flush_threshold_bytes: usize,

    /// Number of concurrent flush workers
    #[serde(default = "default_flush_workers")]
    #[validate(range(min = 1, max = 64))]
    pub flush_workers: usize,

    /// Keep staged artifacts after a successful bulk load
    #[serde(default)]
    pub retain_staged_files: bool,

    /// Compression for staged artifacts
    #[serde(default)]
    pub staging_compression: StagingCompression,

    /// Namespace for final tables when a stream declares none
    #[serde(default = "default_namespace")]
    #[validate(length(min = 1, max = 255))]
    pub default_namespace: String,

    /// Override namespace for all raw tables
    #[serde(default)]
    pub raw_namespace: Option<String>,
}

fn default_memory_budget_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_flush_threshold_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_flush_workers() -> usize {
    5
}

fn default_namespace() -> String {
    "public".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: default_memory_budget_bytes(),
            flush_threshold_bytes: default_flush_threshold_bytes(),
            flush_workers: default_flush_workers(),
            retain_staged_files: false,
            staging_compression: StagingCompression::default(),
            default_namespace: default_namespace(),
            raw_namespace: None,
        }
    }
}

impl SyncConfig {
    /// Catalog-resolution options derived from this configuration
    pub fn catalog_options(&self) -> crate::catalog::CatalogOptions {
        crate::catalog::CatalogOptions {
            default_namespace: self.default_namespace.clone(),
            raw_namespace: self.raw_namespace.clone(),
        }
    }
}

/// Connection settings for the target store.
///
/// Credential validation, tunnels and encryption-at-rest live in the
/// surrounding platform; this struct only carries what the engine needs
/// for its startup connectivity check.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct DestinationConfig {
    /// Target host
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// Target port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Target database name
    #[validate(length(min = 1, max = 255))]
    pub database: String,

    /// User name
    #[validate(length(min = 1, max = 255))]
    pub username: String,

    /// Password or token
    #[serde(default)]
    pub password: Option<SensitiveString>,
}

fn default_port() -> u16 {
    5439
}
