//! Versioned schema/format migrations
//!
//! An ordered list of migrations, each gated by a persisted version
//! marker, applied once before normal sync operations. Each shipped
//! migration probes current state before altering anything, so a re-run
//! after a lost completion record is safe.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use tidesink_core::catalog::{ParsedCatalog, StreamConfig, TableId};
use tidesink_core::error::{Result, SyncError};
use tidesink_core::record::columns;

use crate::generator::SqlGenerator;
use crate::handler::SqlClient;

/// One schema/format migration, identified by a stable ordered version
/// token (`NNNN_name`).
#[async_trait]
pub trait Migration: Send + Sync {
    /// Stable version token; migrations apply in ascending token order
    fn version(&self) -> &'static str;

    /// Human-readable summary for logs
    fn description(&self) -> &'static str;

    /// Apply the migration. Must be idempotent or checked-before-applied:
    /// it may run again if recording its completion failed.
    async fn apply(
        &self,
        client: &dyn SqlClient,
        generator: &dyn SqlGenerator,
        catalog: &ParsedCatalog,
    ) -> Result<()>;
}

/// Persistence for applied-migration markers
#[async_trait]
pub trait MigrationLedger: Send + Sync {
    /// Prepare the ledger's own storage
    async fn bootstrap(&self) -> Result<()>;

    /// Whether a version has been recorded as applied
    async fn is_applied(&self, version: &str) -> Result<bool>;

    /// Record a version as applied. Markers are never deleted.
    async fn record(&self, version: &str) -> Result<()>;
}

/// Ledger stored in a table inside the destination database
pub struct SqlMigrationLedger {
    client: Arc<dyn SqlClient>,
    generator: Arc<dyn SqlGenerator>,
    table: TableId,
}

impl SqlMigrationLedger {
    /// Create a ledger in the given namespace
    pub fn new(
        client: Arc<dyn SqlClient>,
        generator: Arc<dyn SqlGenerator>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            generator,
            table: TableId::new(namespace, "_tidesink_migrations"),
        }
    }
}

#[async_trait]
impl MigrationLedger for SqlMigrationLedger {
    async fn bootstrap(&self) -> Result<()> {
        let create_namespace = self.generator.create_namespace(&self.table.namespace);
        let create_table = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(64) NOT NULL, {} TIMESTAMP NOT NULL)",
            self.generator.qualified(&self.table),
            self.generator.quote_identifier("version"),
            self.generator.quote_identifier("applied_at"),
        );
        self.client.execute(&create_namespace).await?;
        self.client.execute(&create_table).await?;
        Ok(())
    }

    async fn is_applied(&self, version: &str) -> Result<bool> {
        let sql = format!(
            "SELECT {version_col} FROM {table} WHERE {version_col} = '{version}'",
            version_col = self.generator.quote_identifier("version"),
            table = self.generator.qualified(&self.table),
            version = self.generator.escape_string(version),
        );
        Ok(!self.client.query(&sql).await?.is_empty())
    }

    async fn record(&self, version: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ('{}', CURRENT_TIMESTAMP)",
            self.generator.qualified(&self.table),
            self.generator.quote_identifier("version"),
            self.generator.quote_identifier("applied_at"),
            self.generator.escape_string(version),
        );
        self.client.execute(&sql).await?;
        Ok(())
    }
}

/// Applies pending migrations in ascending version order, exactly once
/// per version.
pub struct MigrationEngine {
    migrations: Vec<Arc<dyn Migration>>,
    ledger: Arc<dyn MigrationLedger>,
}

impl MigrationEngine {
    /// Create an engine with the built-in migration sequence
    pub fn new(ledger: Arc<dyn MigrationLedger>) -> Self {
        Self {
            migrations: vec![
                Arc::new(RawLoadedAtMigration),
                Arc::new(RawMetaColumnMigration),
            ],
            ledger,
        }
    }

    /// Create an engine with an explicit migration list
    pub fn with_migrations(
        ledger: Arc<dyn MigrationLedger>,
        migrations: Vec<Arc<dyn Migration>>,
    ) -> Self {
        Self { migrations, ledger }
    }

    /// Apply every unapplied migration, in ascending version order.
    ///
    /// Failure is fatal for the sync: it aborts before any merge runs
    /// and is not retried automatically.
    pub async fn apply_pending(
        &self,
        client: &dyn SqlClient,
        generator: &dyn SqlGenerator,
        catalog: &ParsedCatalog,
    ) -> Result<()> {
        self.ledger.bootstrap().await?;

        let mut ordered = self.migrations.clone();
        ordered.sort_by_key(|m| m.version());

        for migration in ordered {
            let version = migration.version();
            if self.ledger.is_applied(version).await? {
                debug!("Migration '{}' already applied, skipping", version);
                continue;
            }
            info!("Applying migration '{}': {}", version, migration.description());
            migration
                .apply(client, generator, catalog)
                .await
                .map_err(|e| SyncError::migration(version, e.to_string()))?;
            self.ledger.record(version).await?;
        }
        Ok(())
    }
}

/// A migration engine bound to its execution context, as the sync
/// orchestrator consumes it.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    /// Apply every unapplied migration for the given catalog
    async fn apply_pending(&self, catalog: &ParsedCatalog) -> Result<()>;
}

/// [`MigrationEngine`] bound to a client and generator
pub struct BoundMigrationEngine {
    engine: MigrationEngine,
    client: Arc<dyn SqlClient>,
    generator: Arc<dyn SqlGenerator>,
}

impl BoundMigrationEngine {
    /// Bind an engine to its execution context
    pub fn new(
        engine: MigrationEngine,
        client: Arc<dyn SqlClient>,
        generator: Arc<dyn SqlGenerator>,
    ) -> Self {
        Self {
            engine,
            client,
            generator,
        }
    }
}

#[async_trait]
impl MigrationRunner for BoundMigrationEngine {
    async fn apply_pending(&self, catalog: &ParsedCatalog) -> Result<()> {
        self.engine
            .apply_pending(self.client.as_ref(), self.generator.as_ref(), catalog)
            .await
    }
}

/// Add a raw-table column if the table exists and the column is absent
async fn add_raw_column_if_missing(
    client: &dyn SqlClient,
    generator: &dyn SqlGenerator,
    stream: &StreamConfig,
    column: &str,
    native_type: &str,
) -> Result<()> {
    let exists = !client
        .query(&generator.table_exists(&stream.raw_table))
        .await?
        .is_empty();
    if !exists {
        return Ok(());
    }
    let existing = client
        .query(&generator.list_columns(&stream.raw_table))
        .await?;
    let present = existing
        .iter()
        .filter_map(|row| row.get("column_name").and_then(|v| v.as_str()))
        .any(|name| name == column);
    if present {
        return Ok(());
    }
    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        generator.qualified(&stream.raw_table),
        generator.quote_identifier(column),
        native_type,
    );
    client.execute(&sql).await?;
    Ok(())
}

/// Adds the load watermark column to raw tables created before it
/// existed. Without it the merge cannot tell processed rows apart.
pub struct RawLoadedAtMigration;

#[async_trait]
impl Migration for RawLoadedAtMigration {
    fn version(&self) -> &'static str {
        "0001_raw_loaded_at"
    }

    fn description(&self) -> &'static str {
        "add the load watermark column to pre-existing raw tables"
    }

    async fn apply(
        &self,
        client: &dyn SqlClient,
        generator: &dyn SqlGenerator,
        catalog: &ParsedCatalog,
    ) -> Result<()> {
        for stream in catalog.streams() {
            add_raw_column_if_missing(client, generator, stream, columns::LOADED_AT, "TIMESTAMP")
                .await?;
        }
        Ok(())
    }
}

/// Adds the typing-metadata column to raw tables created before it
/// existed.
pub struct RawMetaColumnMigration;

#[async_trait]
impl Migration for RawMetaColumnMigration {
    fn version(&self) -> &'static str {
        "0002_raw_meta"
    }

    fn description(&self) -> &'static str {
        "add the typing metadata column to pre-existing raw tables"
    }

    async fn apply(
        &self,
        client: &dyn SqlClient,
        generator: &dyn SqlGenerator,
        catalog: &ParsedCatalog,
    ) -> Result<()> {
        for stream in catalog.streams() {
            add_raw_column_if_missing(client, generator, stream, columns::META, "JSON").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::AnsiSqlGenerator;
    use crate::testing::{MemoryLedger, MemorySqlClient};
    use tidesink_core::catalog::{
        resolve_catalog, CatalogOptions, FieldType, StreamDescriptor,
    };

    fn catalog() -> ParsedCatalog {
        let descriptor = StreamDescriptor::new(
            "users",
            vec![("id".to_string(), FieldType::Integer)],
        )
        .namespace("public");
        resolve_catalog(&[descriptor], &CatalogOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_migrations_apply_once() {
        let client = MemorySqlClient::new()
            .with_table("public__users", &["_tidesink_id", "_tidesink_data"]);
        let generator = AnsiSqlGenerator::new();
        let ledger = Arc::new(MemoryLedger::new());
        let engine = MigrationEngine::new(ledger.clone());

        engine
            .apply_pending(&client, &generator, &catalog())
            .await
            .unwrap();
        assert_eq!(
            ledger.applied_versions(),
            ["0001_raw_loaded_at", "0002_raw_meta"]
        );
        let first_run = client.statements().len();
        assert!(first_run >= 2, "both columns should have been added");

        // Second invocation is a no-op.
        engine
            .apply_pending(&client, &generator, &catalog())
            .await
            .unwrap();
        assert_eq!(ledger.applied_versions().len(), 2);
        assert_eq!(client.statements().len(), first_run);
    }

    #[tokio::test]
    async fn test_migration_skips_missing_raw_table() {
        let client = MemorySqlClient::new();
        let generator = AnsiSqlGenerator::new();
        let engine = MigrationEngine::new(Arc::new(MemoryLedger::new()));

        engine
            .apply_pending(&client, &generator, &catalog())
            .await
            .unwrap();
        assert!(client.statements().is_empty());
    }

    #[tokio::test]
    async fn test_migration_rerun_safe_when_column_present() {
        // Simulates a lost completion record: the column already exists,
        // the migration probes first and does not alter again.
        let client = MemorySqlClient::new().with_table(
            "public__users",
            &["_tidesink_id", "_tidesink_loaded_at", "_tidesink_meta"],
        );
        let generator = AnsiSqlGenerator::new();
        let engine = MigrationEngine::new(Arc::new(MemoryLedger::new()));

        engine
            .apply_pending(&client, &generator, &catalog())
            .await
            .unwrap();
        assert!(client
            .statements()
            .iter()
            .all(|s| !s.starts_with("ALTER TABLE")));
    }

    #[tokio::test]
    async fn test_migration_failure_is_fatal_and_versioned() {
        struct FailingMigration;

        #[async_trait]
        impl Migration for FailingMigration {
            fn version(&self) -> &'static str {
                "0003_widen_cursor"
            }
            fn description(&self) -> &'static str {
                "always fails"
            }
            async fn apply(
                &self,
                _client: &dyn SqlClient,
                _generator: &dyn SqlGenerator,
                _catalog: &ParsedCatalog,
            ) -> Result<()> {
                Err(SyncError::sql("ALTER rejected"))
            }
        }

        let client = MemorySqlClient::new();
        let generator = AnsiSqlGenerator::new();
        let ledger = Arc::new(MemoryLedger::new());
        let engine =
            MigrationEngine::with_migrations(ledger.clone(), vec![Arc::new(FailingMigration)]);

        let err = engine
            .apply_pending(&client, &generator, &catalog())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("0003_widen_cursor"));
        assert!(ledger.applied_versions().is_empty());
    }

    #[tokio::test]
    async fn test_sql_ledger_statement_shapes() {
        let client = Arc::new(MemorySqlClient::new());
        let ledger = SqlMigrationLedger::new(
            client.clone(),
            Arc::new(AnsiSqlGenerator::new()),
            "tidesink_raw",
        );

        ledger.bootstrap().await.unwrap();
        ledger.record("0001_raw_loaded_at").await.unwrap();

        let statements = client.statements();
        assert!(statements
            .iter()
            .any(|s| s.contains("\"tidesink_raw\".\"_tidesink_migrations\"")));
        assert!(statements
            .iter()
            .any(|s| s.starts_with("INSERT INTO") && s.contains("0001_raw_loaded_at")));
    }
}
