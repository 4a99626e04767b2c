//! SQL generation for raw tables, bulk loads, and typing/dedup merges
//!
//! - SqlGenerator: trait for target-specific SQL generation
//! - AnsiSqlGenerator: generic ANSI-warehouse implementation
//!
//! Statement building is manual string assembly over quoted identifiers;
//! every generated merge is meant to run as one transactional unit.

use tidesink_core::catalog::{ColumnSpec, FieldType, StreamConfig, TableId};
use tidesink_core::record::{columns, StagedArtifact};

/// Suffix of the side table used for overwrite table swaps
pub const SWAP_SUFFIX: &str = "__tidesink_swap";

/// Name of the row-rank column used inside dedup subqueries
const ROW_NUMBER_ALIAS: &str = "_tidesink_row_number";

/// Target-specific SQL generation.
///
/// One implementation per target store; the engine only ever sees this
/// trait. The fixed raw-table shape (id, emitted_at, loaded_at, data,
/// meta) is part of the contract.
pub trait SqlGenerator: Send + Sync {
    /// Get the generator name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Escape a string literal
    fn escape_string(&self, value: &str) -> String;

    /// Quoted `namespace.name` rendering of a table id
    fn qualified(&self, table: &TableId) -> String {
        format!(
            "{}.{}",
            self.quote_identifier(&table.namespace),
            self.quote_identifier(&table.name)
        )
    }

    /// Native column type for a declared field type
    fn native_type(&self, field_type: FieldType) -> &'static str;

    /// Create a namespace (schema) if absent
    fn create_namespace(&self, namespace: &str) -> String;

    /// Create the stream's raw table if absent
    fn create_raw_table(&self, stream: &StreamConfig) -> String;

    /// Create the stream's final table if absent.
    ///
    /// `suffix` is appended to the table name; the overwrite path uses it
    /// to build its side table.
    fn create_final_table(&self, stream: &StreamConfig, suffix: &str) -> String;

    /// Drop a final-table variant if present
    fn drop_final_table(&self, stream: &StreamConfig, suffix: &str) -> String;

    /// Additive column changes for an existing final table
    fn add_columns(&self, stream: &StreamConfig, new_columns: &[ColumnSpec]) -> Vec<String>;

    /// Remove all rows from the stream's raw table (overwrite reset)
    fn truncate_raw_table(&self, stream: &StreamConfig) -> String;

    /// Bulk-load a staged artifact into the stream's raw table
    fn bulk_load(&self, stream: &StreamConfig, artifact: &StagedArtifact) -> String;

    /// Ordered statements for one typing/dedup merge cycle.
    ///
    /// Must be executed as a single transactional unit. The first
    /// statement is the typed insert; its affected-row count is the
    /// number of rows materialized.
    fn typing_dedup_statements(&self, stream: &StreamConfig, suffix: &str) -> Vec<String>;

    /// Transactional swap of the side table into the final position
    fn swap_final_table(&self, stream: &StreamConfig, suffix: &str) -> Vec<String>;

    /// Probe for table existence; yields one row when the table exists
    fn table_exists(&self, table: &TableId) -> String;

    /// List column names of a table; yields rows with a `column_name` field
    fn list_columns(&self, table: &TableId) -> String;
}

/// Generic ANSI-warehouse SQL generator.
///
/// Uses standard SQL/JSON operators (`JSON_VALUE`, `TRY_CAST`,
/// `ROW_NUMBER`) available on the common cloud warehouses. Vendor
/// deviations belong in their own `SqlGenerator` implementations.
#[derive(Debug, Clone, Default)]
pub struct AnsiSqlGenerator;

impl AnsiSqlGenerator {
    /// Create a generator
    pub fn new() -> Self {
        Self
    }

    fn final_table(&self, stream: &StreamConfig, suffix: &str) -> TableId {
        TableId::new(
            stream.final_table.namespace.clone(),
            format!("{}{}", stream.final_table.name, suffix),
        )
    }

    /// JSON-path extraction of one field from the raw payload
    fn extract_expr(&self, column: &ColumnSpec) -> String {
        let path = format!("$.\"{}\"", column.field.replace('"', "\\\""));
        format!(
            "JSON_VALUE({}, '{}')",
            self.quote_identifier(columns::DATA),
            self.escape_string(&path)
        )
    }

    /// Typed extraction of one field, `NULL` on coercion failure
    fn typed_expr(&self, column: &ColumnSpec) -> String {
        match column.field_type {
            FieldType::Json => {
                let path = format!("$.\"{}\"", column.field.replace('"', "\\\""));
                format!(
                    "JSON_QUERY({}, '{}')",
                    self.quote_identifier(columns::DATA),
                    self.escape_string(&path)
                )
            }
            FieldType::String => self.extract_expr(column),
            other => format!(
                "TRY_CAST({} AS {})",
                self.extract_expr(column),
                self.native_type(other)
            ),
        }
    }

    /// Whether coercion of this column can fail and should be tracked
    fn is_fallible(column: &ColumnSpec) -> bool {
        !matches!(column.field_type, FieldType::String | FieldType::Json)
    }

    /// Metadata expression collecting fields that failed coercion
    fn meta_expr(&self, stream: &StreamConfig) -> String {
        let cases: Vec<String> = stream
            .columns
            .iter()
            .filter(|c| Self::is_fallible(c))
            .map(|c| {
                format!(
                    "CASE WHEN {extract} IS NOT NULL AND {typed} IS NULL THEN '{field}' END",
                    extract = self.extract_expr(c),
                    typed = self.typed_expr(c),
                    field = self.escape_string(&c.field)
                )
            })
            .collect();
        if cases.is_empty() {
            return "NULL".to_string();
        }
        format!(
            "JSON_OBJECT('errors' VALUE JSON_ARRAY({} ABSENT ON NULL))",
            cases.join(", ")
        )
    }

    /// Dedup ordering over raw rows: cursor, then emitted_at, then id,
    /// all descending. Streams without a cursor fall back to the tail of
    /// the same rule.
    fn raw_order_by(&self, stream: &StreamConfig) -> String {
        let tail = format!(
            "{} DESC, {} DESC",
            self.quote_identifier(columns::EMITTED_AT),
            self.quote_identifier(columns::ID)
        );
        match stream.cursor_column() {
            Some(cursor) => format!("{} DESC NULLS LAST, {}", self.typed_expr(cursor), tail),
            None => tail,
        }
    }

    /// Same ordering expressed over typed final-table columns
    fn final_order_by(&self, stream: &StreamConfig) -> String {
        let tail = format!(
            "{} DESC, {} DESC",
            self.quote_identifier(columns::EMITTED_AT),
            self.quote_identifier(columns::ID)
        );
        match stream.cursor_column() {
            Some(cursor) => format!(
                "{} DESC NULLS LAST, {}",
                self.quote_identifier(&cursor.column),
                tail
            ),
            None => tail,
        }
    }

    fn typed_insert(&self, stream: &StreamConfig, target: &TableId) -> String {
        let mut insert_columns: Vec<String> = stream
            .columns
            .iter()
            .map(|c| self.quote_identifier(&c.column))
            .collect();
        insert_columns.push(self.quote_identifier(columns::ID));
        insert_columns.push(self.quote_identifier(columns::EMITTED_AT));
        insert_columns.push(self.quote_identifier(columns::META));

        let mut select_exprs: Vec<String> =
            stream.columns.iter().map(|c| self.typed_expr(c)).collect();
        select_exprs.push(self.quote_identifier(columns::ID));
        select_exprs.push(self.quote_identifier(columns::EMITTED_AT));
        select_exprs.push(self.meta_expr(stream));

        let unprocessed = format!("{} IS NULL", self.quote_identifier(columns::LOADED_AT));

        if stream.descriptor.sync_mode.is_dedup() && !stream.descriptor.primary_key.is_empty() {
            let partition: Vec<String> = stream
                .primary_key_columns()
                .iter()
                .map(|c| self.extract_expr(c))
                .collect();
            format!(
                "INSERT INTO {target} ({insert_columns})\n\
                 SELECT {select_exprs}\n\
                 FROM (\n\
                   SELECT *, ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {order}) AS {rank}\n\
                   FROM {raw}\n\
                   WHERE {unprocessed}\n\
                 ) AS new_records\n\
                 WHERE {rank} = 1",
                target = self.qualified(target),
                insert_columns = insert_columns.join(", "),
                select_exprs = select_exprs.join(", "),
                partition = partition.join(", "),
                order = self.raw_order_by(stream),
                rank = ROW_NUMBER_ALIAS,
                raw = self.qualified(&stream.raw_table),
                unprocessed = unprocessed,
            )
        } else {
            format!(
                "INSERT INTO {target} ({insert_columns})\n\
                 SELECT {select_exprs}\n\
                 FROM {raw}\n\
                 WHERE {unprocessed}",
                target = self.qualified(target),
                insert_columns = insert_columns.join(", "),
                select_exprs = select_exprs.join(", "),
                raw = self.qualified(&stream.raw_table),
                unprocessed = unprocessed,
            )
        }
    }

    /// Cross-batch dedup: keep the rank-1 row per primary key in the
    /// target table, delete everything it supersedes.
    fn dedup_delete(&self, stream: &StreamConfig, target: &TableId) -> String {
        let partition: Vec<String> = stream
            .primary_key_columns()
            .iter()
            .map(|c| self.quote_identifier(&c.column))
            .collect();
        format!(
            "DELETE FROM {target} WHERE {id} IN (\n\
               SELECT {id} FROM (\n\
                 SELECT {id}, ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {order}) AS {rank}\n\
                 FROM {target}\n\
               ) AS ranked WHERE {rank} > 1\n\
             )",
            target = self.qualified(target),
            id = self.quote_identifier(columns::ID),
            partition = partition.join(", "),
            order = self.final_order_by(stream),
            rank = ROW_NUMBER_ALIAS,
        )
    }

    fn stamp_loaded_at(&self, stream: &StreamConfig) -> String {
        format!(
            "UPDATE {raw} SET {loaded_at} = CURRENT_TIMESTAMP WHERE {loaded_at} IS NULL",
            raw = self.qualified(&stream.raw_table),
            loaded_at = self.quote_identifier(columns::LOADED_AT),
        )
    }
}

impl SqlGenerator for AnsiSqlGenerator {
    fn name(&self) -> &'static str {
        "ansi"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn escape_string(&self, value: &str) -> String {
        value.replace('\'', "''")
    }

    fn native_type(&self, field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::Boolean => "BOOLEAN",
            FieldType::Integer => "BIGINT",
            FieldType::Number => "DOUBLE PRECISION",
            FieldType::String => "TEXT",
            FieldType::Date => "DATE",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Json => "JSON",
        }
    }

    fn create_namespace(&self, namespace: &str) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote_identifier(namespace))
    }

    fn create_raw_table(&self, stream: &StreamConfig) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
               {id} VARCHAR(36) NOT NULL,\n\
               {emitted_at} TIMESTAMP NOT NULL,\n\
               {loaded_at} TIMESTAMP,\n\
               {data} JSON NOT NULL,\n\
               {meta} JSON\n\
             )",
            table = self.qualified(&stream.raw_table),
            id = self.quote_identifier(columns::ID),
            emitted_at = self.quote_identifier(columns::EMITTED_AT),
            loaded_at = self.quote_identifier(columns::LOADED_AT),
            data = self.quote_identifier(columns::DATA),
            meta = self.quote_identifier(columns::META),
        )
    }

    fn create_final_table(&self, stream: &StreamConfig, suffix: &str) -> String {
        let typed: Vec<String> = stream
            .columns
            .iter()
            .map(|c| {
                format!(
                    "  {} {}",
                    self.quote_identifier(&c.column),
                    self.native_type(c.field_type)
                )
            })
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (\n\
               {id} VARCHAR(36) NOT NULL,\n\
               {emitted_at} TIMESTAMP NOT NULL,\n\
               {meta} JSON,\n\
             {typed}\n\
             )",
            table = self.qualified(&self.final_table(stream, suffix)),
            id = self.quote_identifier(columns::ID),
            emitted_at = self.quote_identifier(columns::EMITTED_AT),
            meta = self.quote_identifier(columns::META),
            typed = typed.join(",\n"),
        )
    }

    fn drop_final_table(&self, stream: &StreamConfig, suffix: &str) -> String {
        format!(
            "DROP TABLE IF EXISTS {}",
            self.qualified(&self.final_table(stream, suffix))
        )
    }

    fn add_columns(&self, stream: &StreamConfig, new_columns: &[ColumnSpec]) -> Vec<String> {
        new_columns
            .iter()
            .map(|c| {
                format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    self.qualified(&stream.final_table),
                    self.quote_identifier(&c.column),
                    self.native_type(c.field_type)
                )
            })
            .collect()
    }

    fn truncate_raw_table(&self, stream: &StreamConfig) -> String {
        format!("TRUNCATE TABLE {}", self.qualified(&stream.raw_table))
    }

    fn bulk_load(&self, stream: &StreamConfig, artifact: &StagedArtifact) -> String {
        format!(
            "COPY INTO {table} ({id}, {emitted_at}, {data})\n\
             FROM '{location}'\n\
             FILE_FORMAT = (TYPE = 'JSON')",
            table = self.qualified(&stream.raw_table),
            id = self.quote_identifier(columns::ID),
            emitted_at = self.quote_identifier(columns::EMITTED_AT),
            data = self.quote_identifier(columns::DATA),
            location = self.escape_string(&artifact.location),
        )
    }

    fn typing_dedup_statements(&self, stream: &StreamConfig, suffix: &str) -> Vec<String> {
        let target = self.final_table(stream, suffix);
        let mut statements = vec![self.typed_insert(stream, &target)];
        if stream.descriptor.sync_mode.is_dedup() && !stream.descriptor.primary_key.is_empty() {
            statements.push(self.dedup_delete(stream, &target));
        }
        statements.push(self.stamp_loaded_at(stream));
        statements
    }

    fn swap_final_table(&self, stream: &StreamConfig, suffix: &str) -> Vec<String> {
        vec![
            self.drop_final_table(stream, ""),
            format!(
                "ALTER TABLE {} RENAME TO {}",
                self.qualified(&self.final_table(stream, suffix)),
                self.quote_identifier(&stream.final_table.name)
            ),
        ]
    }

    fn table_exists(&self, table: &TableId) -> String {
        format!(
            "SELECT 1 AS table_exists FROM information_schema.tables \
             WHERE table_schema = '{}' AND table_name = '{}'",
            self.escape_string(&table.namespace),
            self.escape_string(&table.name)
        )
    }

    fn list_columns(&self, table: &TableId) -> String {
        format!(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = '{}' AND table_name = '{}' \
             ORDER BY ordinal_position",
            self.escape_string(&table.namespace),
            self.escape_string(&table.name)
        )
    }
}
