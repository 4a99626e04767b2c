//! Destination handling: statement execution and per-stream state
//!
//! - SqlClient: the seam to the target store (execution + transactions)
//! - Destination: what the engine's flush and finalize paths call
//! - SqlDestination: Destination implemented over SqlClient + SqlGenerator

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use tidesink_core::catalog::{ColumnSpec, StreamConfig, TableId};
use tidesink_core::error::Result;
use tidesink_core::record::{StagedArtifact, StreamKey};

use crate::generator::{SqlGenerator, SWAP_SUFFIX};

/// A connection to the target store.
///
/// Implementations must return structured errors that distinguish
/// connectivity/authentication failures from statement-level SQL errors
/// (`SyncError::Connection`/`Authentication` vs `SyncError::Sql`).
#[async_trait]
pub trait SqlClient: Send + Sync {
    /// Execute one statement, returning the affected row count
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Execute a query, returning rows as JSON objects keyed by column name
    async fn query(&self, sql: &str) -> Result<Vec<serde_json::Value>>;

    /// Execute statements as a single logical unit (transactional where
    /// the target supports it), returning per-statement affected counts.
    ///
    /// Partial application is a correctness bug, not an accepted failure
    /// mode: implementations roll back on any statement failure.
    async fn execute_transaction(&self, statements: &[String]) -> Result<Vec<u64>>;
}

/// Initial destination-side state of one stream
#[derive(Debug, Clone, Default)]
pub struct StreamStatus {
    /// Raw table already exists
    pub raw_table_exists: bool,
    /// Final table already exists
    pub final_table_exists: bool,
    /// Raw table must be truncated before ingestion (overwrite modes)
    pub needs_overwrite_reset: bool,
    /// Declared columns missing from the existing final table
    pub missing_columns: Vec<ColumnSpec>,
}

/// Result of one typing/dedup merge
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOutcome {
    /// Rows materialized into the final table
    pub rows_typed: u64,
}

/// The engine-facing destination contract.
///
/// `SqlDestination` is the production implementation; tests use the
/// in-memory double from the engine crate.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Verify connectivity and credentials. Called once before
    /// ingestion; failure aborts the sync.
    async fn check(&self) -> Result<()>;

    /// Inspect destination-side state for one stream
    async fn initial_status(&self, stream: &StreamConfig) -> Result<StreamStatus>;

    /// Create namespaces/tables and apply additive schema changes
    async fn prepare_stream(&self, stream: &StreamConfig, status: &StreamStatus) -> Result<()>;

    /// Load a staged artifact into the stream's raw table
    async fn bulk_load(&self, stream: &StreamConfig, artifact: &StagedArtifact) -> Result<u64>;

    /// Run the typing/dedup merge (and, for overwrite modes, the table
    /// swap) for one stream
    async fn finalize_stream(&self, stream: &StreamConfig) -> Result<MergeOutcome>;
}

/// Destination implemented by composing a [`SqlGenerator`] with a
/// [`SqlClient`], tracking per-stream status between prepare and
/// finalize.
pub struct SqlDestination {
    client: Arc<dyn SqlClient>,
    generator: Arc<dyn SqlGenerator>,
    prepared: RwLock<HashMap<StreamKey, StreamStatus>>,
}

impl SqlDestination {
    /// Create a destination over a client and a generator
    pub fn new(client: Arc<dyn SqlClient>, generator: Arc<dyn SqlGenerator>) -> Self {
        Self {
            client,
            generator,
            prepared: RwLock::new(HashMap::new()),
        }
    }

    async fn probe_table(&self, table: &TableId) -> Result<bool> {
        let rows = self.client.query(&self.generator.table_exists(table)).await?;
        Ok(!rows.is_empty())
    }

    async fn existing_columns(&self, table: &TableId) -> Result<Vec<String>> {
        let rows = self.client.query(&self.generator.list_columns(table)).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("column_name").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Destination for SqlDestination {
    async fn check(&self) -> Result<()> {
        self.client.query("SELECT 1 AS connectivity_check").await?;
        Ok(())
    }

    async fn initial_status(&self, stream: &StreamConfig) -> Result<StreamStatus> {
        let raw_table_exists = self.probe_table(&stream.raw_table).await?;
        let final_table_exists = self.probe_table(&stream.final_table).await?;

        let missing_columns = if final_table_exists {
            let existing = self.existing_columns(&stream.final_table).await?;
            stream
                .columns
                .iter()
                .filter(|c| !existing.iter().any(|name| name == &c.column))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        Ok(StreamStatus {
            raw_table_exists,
            final_table_exists,
            needs_overwrite_reset: stream.descriptor.sync_mode.is_overwrite() && raw_table_exists,
            missing_columns,
        })
    }

    async fn prepare_stream(&self, stream: &StreamConfig, status: &StreamStatus) -> Result<()> {
        let generator = &self.generator;
        let mut statements = vec![
            generator.create_namespace(&stream.raw_table.namespace),
            generator.create_namespace(&stream.final_table.namespace),
            generator.create_raw_table(stream),
            generator.create_final_table(stream, ""),
        ];
        if status.needs_overwrite_reset {
            statements.push(generator.truncate_raw_table(stream));
        }
        if stream.descriptor.sync_mode.is_overwrite() {
            // Fresh side table each sync; a leftover from an aborted run
            // must not leak rows into this one.
            statements.push(generator.drop_final_table(stream, SWAP_SUFFIX));
            statements.push(generator.create_final_table(stream, SWAP_SUFFIX));
        }
        if !status.missing_columns.is_empty() {
            info!(
                "Stream '{}' adding {} column(s) to {}",
                stream.key(),
                status.missing_columns.len(),
                stream.final_table
            );
            statements.extend(generator.add_columns(stream, &status.missing_columns));
        }

        for sql in &statements {
            self.client.execute(sql).await?;
        }

        self.prepared
            .write()
            .await
            .insert(stream.key(), status.clone());
        debug!("Stream '{}' prepared", stream.key());
        Ok(())
    }

    async fn bulk_load(&self, stream: &StreamConfig, artifact: &StagedArtifact) -> Result<u64> {
        let sql = self.generator.bulk_load(stream, artifact);
        self.client.execute(&sql).await?;
        debug!(
            "Stream '{}' loaded part {} ({} records) into {}",
            stream.key(),
            artifact.part,
            artifact.records,
            stream.raw_table
        );
        // COPY affected-count semantics vary by target; the artifact's
        // own record count is authoritative for reporting.
        Ok(artifact.records)
    }

    async fn finalize_stream(&self, stream: &StreamConfig) -> Result<MergeOutcome> {
        if !self.prepared.read().await.contains_key(&stream.key()) {
            return Err(tidesink_core::error::SyncError::internal(format!(
                "stream '{}' finalized without being prepared",
                stream.key()
            )));
        }
        let overwrite = stream.descriptor.sync_mode.is_overwrite();
        let suffix = if overwrite { SWAP_SUFFIX } else { "" };

        let mut statements = self.generator.typing_dedup_statements(stream, suffix);
        if overwrite {
            statements.extend(self.generator.swap_final_table(stream, suffix));
        }

        let affected = self.client.execute_transaction(&statements).await?;
        let rows_typed = affected.first().copied().unwrap_or(0);
        info!(
            "Stream '{}' merge complete: {} row(s) typed into {}",
            stream.key(),
            rows_typed,
            stream.final_table
        );
        Ok(MergeOutcome { rows_typed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::AnsiSqlGenerator;
    use crate::testing::MemorySqlClient;
    use tidesink_core::catalog::{
        resolve_catalog, CatalogOptions, FieldType, StreamDescriptor, SyncMode,
    };
    use tidesink_core::error::ErrorCategory;

    fn stream(mode: SyncMode) -> StreamConfig {
        let descriptor = StreamDescriptor::new(
            "users",
            vec![
                ("id".to_string(), FieldType::Integer),
                ("email".to_string(), FieldType::String),
            ],
        )
        .namespace("public")
        .sync_mode(mode)
        .primary_key(vec!["id".to_string()]);
        resolve_catalog(&[descriptor], &CatalogOptions::default())
            .unwrap()
            .streams()[0]
            .clone()
    }

    fn destination(client: Arc<MemorySqlClient>) -> SqlDestination {
        SqlDestination::new(client, Arc::new(AnsiSqlGenerator::new()))
    }

    #[tokio::test]
    async fn test_initial_status_reports_missing_columns() {
        let client = Arc::new(
            MemorySqlClient::new()
                .with_table("public__users", &[])
                .with_table(
                    "users",
                    &["_tidesink_id", "_tidesink_emitted_at", "_tidesink_meta", "id"],
                ),
        );
        let status = destination(client)
            .initial_status(&stream(SyncMode::AppendDedup))
            .await
            .unwrap();
        assert!(status.raw_table_exists);
        assert!(status.final_table_exists);
        assert_eq!(status.missing_columns.len(), 1);
        assert_eq!(status.missing_columns[0].column, "email");
    }

    #[tokio::test]
    async fn test_prepare_creates_tables_and_adds_columns() {
        let client = Arc::new(MemorySqlClient::new());
        let destination = destination(client.clone());
        let stream = stream(SyncMode::AppendDedup);
        let status = StreamStatus {
            final_table_exists: true,
            missing_columns: vec![ColumnSpec {
                field: "email".to_string(),
                column: "email".to_string(),
                field_type: FieldType::String,
            }],
            ..StreamStatus::default()
        };

        destination.prepare_stream(&stream, &status).await.unwrap();

        let statements = client.statements();
        assert!(statements.iter().any(|s| s.starts_with("CREATE SCHEMA")));
        assert!(statements
            .iter()
            .any(|s| s.contains("CREATE TABLE IF NOT EXISTS \"tidesink_raw\"")));
        assert!(statements.iter().any(|s| s.contains("ADD COLUMN \"email\"")));
    }

    #[tokio::test]
    async fn test_overwrite_prepare_resets_raw_and_side_table() {
        let client = Arc::new(MemorySqlClient::new());
        let destination = destination(client.clone());
        let stream = stream(SyncMode::Overwrite);
        let status = StreamStatus {
            raw_table_exists: true,
            needs_overwrite_reset: true,
            ..StreamStatus::default()
        };

        destination.prepare_stream(&stream, &status).await.unwrap();

        let statements = client.statements();
        assert!(statements.iter().any(|s| s.starts_with("TRUNCATE TABLE")));
        assert!(statements.iter().any(|s| s.contains(SWAP_SUFFIX)));
    }

    #[tokio::test]
    async fn test_finalize_merge_runs_as_one_transaction() {
        let client = Arc::new(MemorySqlClient::new().with_transaction_affected(42));
        let destination = destination(client.clone());
        let stream = stream(SyncMode::AppendDedup);
        destination
            .prepare_stream(&stream, &StreamStatus::default())
            .await
            .unwrap();
        client.clear();

        let outcome = destination.finalize_stream(&stream).await.unwrap();
        assert_eq!(outcome.rows_typed, 42);

        // insert + dedup delete + watermark, all through the transaction path
        assert_eq!(client.statements().len(), 3);
    }

    #[tokio::test]
    async fn test_finalize_without_prepare_is_an_error() {
        let client = Arc::new(MemorySqlClient::new());
        let err = destination(client)
            .finalize_stream(&stream(SyncMode::AppendDedup))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("without being prepared"));
    }

    #[tokio::test]
    async fn test_finalize_overwrite_includes_swap() {
        let client = Arc::new(MemorySqlClient::new());
        let destination = destination(client.clone());
        let stream = stream(SyncMode::Overwrite);
        destination
            .prepare_stream(&stream, &StreamStatus::default())
            .await
            .unwrap();
        client.clear();

        destination.finalize_stream(&stream).await.unwrap();

        let statements = client.statements();
        assert!(statements.iter().any(|s| s.contains("RENAME TO")));
        assert!(statements
            .last()
            .map(|s| s.contains("RENAME TO"))
            .unwrap_or(false));
    }

    #[tokio::test]
    async fn test_merge_failure_is_statement_level() {
        let client = Arc::new(MemorySqlClient::new().fail_on("INSERT INTO"));
        let destination = destination(client.clone());
        let stream = stream(SyncMode::AppendDedup);
        destination
            .prepare_stream(&stream, &StreamStatus::default())
            .await
            .unwrap();
        client.clear();

        let err = destination.finalize_stream(&stream).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Sql);
        // Rolled back: nothing from the merge unit was applied.
        assert!(client.statements().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_load_reports_artifact_records() {
        let client = Arc::new(MemorySqlClient::new());
        let destination = destination(client);
        let artifact = StagedArtifact {
            stream: StreamKey::namespaced("public", "users"),
            location: "/staging/part-0.jsonl".to_string(),
            records: 17,
            bytes: 512,
            part: 0,
        };

        let loaded = destination
            .bulk_load(&stream(SyncMode::Append), &artifact)
            .await
            .unwrap();
        assert_eq!(loaded, 17);
    }
}
