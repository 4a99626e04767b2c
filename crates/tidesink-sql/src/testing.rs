//! In-memory test doubles for the SQL seams
//!
//! [`MemorySqlClient`] records every executed statement and answers the
//! generator's information-schema probes from a registered table set;
//! [`MemoryLedger`] keeps applied-migration markers in memory. Both live
//! in the library so downstream crates can exercise the destination and
//! migration paths without a warehouse.
//!
//! ```rust,ignore
//! let client = Arc::new(
//!     MemorySqlClient::new().with_table("users", &["id", "email"]),
//! );
//! let destination = SqlDestination::new(client.clone(), generator);
//! // ... drive the destination, then assert on client.statements()
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tidesink_core::error::{Result, SyncError};

use crate::handler::SqlClient;
use crate::migration::MigrationLedger;

/// SQL client that records statements and answers schema probes from an
/// in-memory table registry.
///
/// Queries against `information_schema` are resolved from the registered
/// tables; the connectivity check succeeds; every other query returns no
/// rows. `fail_on` turns any statement containing the given fragment
/// into a statement-level error, for driving failure paths.
pub struct MemorySqlClient {
    executed: Mutex<Vec<String>>,
    tables: Mutex<HashMap<String, Vec<String>>>,
    fail_fragment: Mutex<Option<String>>,
    transaction_affected: AtomicU64,
}

impl Default for MemorySqlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySqlClient {
    /// Create a client with no existing tables
    pub fn new() -> Self {
        Self {
            executed: Mutex::new(Vec::new()),
            tables: Mutex::new(HashMap::new()),
            fail_fragment: Mutex::new(None),
            transaction_affected: AtomicU64::new(1),
        }
    }

    /// Register an existing table and its columns
    pub fn with_table(self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.tables
            .lock()
            .insert(name.into(), columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Make every statement containing `fragment` fail
    pub fn fail_on(self, fragment: impl Into<String>) -> Self {
        *self.fail_fragment.lock() = Some(fragment.into());
        self
    }

    /// Affected-row count reported for each transactional statement
    pub fn with_transaction_affected(self, affected: u64) -> Self {
        self.transaction_affected.store(affected, Ordering::SeqCst);
        self
    }

    /// Every statement executed so far, in order
    pub fn statements(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Forget recorded statements
    pub fn clear(&self) {
        self.executed.lock().clear();
    }

    fn check_failure(&self, sql: &str) -> Result<()> {
        if let Some(fragment) = self.fail_fragment.lock().as_ref() {
            if sql.contains(fragment.as_str()) {
                return Err(SyncError::sql_with_statement(
                    format!("injected failure on '{}'", fragment),
                    sql,
                ));
            }
        }
        Ok(())
    }
}

/// Table name bound in an information-schema probe's WHERE clause
fn probe_target(sql: &str) -> Option<&str> {
    let start = sql.find("table_name = '")? + "table_name = '".len();
    let rest = &sql[start..];
    rest.find('\'').map(|end| &rest[..end])
}

#[async_trait]
impl SqlClient for MemorySqlClient {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.check_failure(sql)?;
        self.executed.lock().push(sql.to_string());
        Ok(1)
    }

    async fn query(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        self.check_failure(sql)?;
        let tables = self.tables.lock();
        if sql.contains("information_schema.tables") {
            let hit = probe_target(sql).is_some_and(|name| tables.contains_key(name));
            return Ok(if hit {
                vec![serde_json::json!({"table_exists": 1})]
            } else {
                vec![]
            });
        }
        if sql.contains("information_schema.columns") {
            let columns = probe_target(sql)
                .and_then(|name| tables.get(name))
                .cloned()
                .unwrap_or_default();
            return Ok(columns
                .iter()
                .map(|c| serde_json::json!({"column_name": c}))
                .collect());
        }
        if sql.contains("connectivity_check") {
            return Ok(vec![serde_json::json!({"connectivity_check": 1})]);
        }
        Ok(vec![])
    }

    async fn execute_transaction(&self, statements: &[String]) -> Result<Vec<u64>> {
        // All-or-nothing: a failing statement rolls the unit back, so
        // nothing is recorded as executed.
        for sql in statements {
            self.check_failure(sql)?;
        }
        self.executed.lock().extend(statements.iter().cloned());
        let affected = self.transaction_affected.load(Ordering::SeqCst);
        Ok(vec![affected; statements.len()])
    }
}

/// Migration ledger held in memory
#[derive(Default)]
pub struct MemoryLedger {
    applied: Mutex<Vec<String>>,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded versions, in application order
    pub fn applied_versions(&self) -> Vec<String> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl MigrationLedger for MemoryLedger {
    async fn bootstrap(&self) -> Result<()> {
        Ok(())
    }

    async fn is_applied(&self, version: &str) -> Result<bool> {
        Ok(self.applied.lock().iter().any(|v| v == version))
    }

    async fn record(&self, version: &str) -> Result<()> {
        self.applied.lock().push(version.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_probes_answer_from_registered_tables() {
        let client = MemorySqlClient::new().with_table("users", &["id", "email"]);

        let rows = client
            .query("SELECT 1 AS table_exists FROM information_schema.tables WHERE table_schema = 'public' AND table_name = 'users'")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        let rows = client
            .query("SELECT 1 AS table_exists FROM information_schema.tables WHERE table_schema = 'public' AND table_name = 'orders'")
            .await
            .unwrap();
        assert!(rows.is_empty());

        let rows = client
            .query("SELECT column_name FROM information_schema.columns WHERE table_schema = 'public' AND table_name = 'users' ORDER BY ordinal_position")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["column_name"], "id");
    }

    #[tokio::test]
    async fn test_failure_injection_rolls_back_transaction() {
        let client = MemorySqlClient::new().fail_on("DELETE");
        let err = client
            .execute_transaction(&[
                "INSERT INTO t VALUES (1)".to_string(),
                "DELETE FROM t".to_string(),
            ])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("injected failure"));
        assert!(client.statements().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_remembers_versions() {
        let ledger = MemoryLedger::new();
        assert!(!ledger.is_applied("0001_x").await.unwrap());
        ledger.record("0001_x").await.unwrap();
        assert!(ledger.is_applied("0001_x").await.unwrap());
        assert_eq!(ledger.applied_versions(), vec!["0001_x".to_string()]);
    }
}
