//! End-to-end sync behavior against the in-memory staging and destination
//!
//! Covers the engine's core guarantees: dedup picks the max-cursor row
//! per key, merges are idempotent, overwrite swaps never leave a stale
//! table, and a flush failure in one stream leaves the others untouched.
//!
//! Run with: cargo test -p tidesink-engine --test sync_properties -- --nocapture

use anyhow::Result;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;

use tidesink_core::catalog::{
    resolve_catalog, FieldType, ParsedCatalog, StreamDescriptor, SyncMode, TableId,
};
use tidesink_core::config::{StagingCompression, SyncConfig};
use tidesink_core::record::{Record, StreamKey, SyncEvent};
use tidesink_core::report::SyncReport;
use tidesink_engine::testing::{FinalRow, MemoryDestination, MemoryStaging, RecordingMigrations};
use tidesink_engine::SyncOrchestrator;
use tidesink_sql::handler::Destination;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config() -> SyncConfig {
    SyncConfig {
        memory_budget_bytes: 4 * 1024 * 1024,
        flush_threshold_bytes: 64 * 1024,
        flush_workers: 3,
        staging_compression: StagingCompression::Gzip,
        ..SyncConfig::default()
    }
}

fn users_descriptor(mode: SyncMode) -> StreamDescriptor {
    StreamDescriptor::new(
        "users",
        vec![
            ("id".to_string(), FieldType::Integer),
            ("updated_at".to_string(), FieldType::Integer),
        ],
    )
    .namespace("public")
    .sync_mode(mode)
    .primary_key(vec!["id".to_string()])
    .cursor_field("updated_at")
}

struct Harness {
    catalog: ParsedCatalog,
    staging: Arc<MemoryStaging>,
    destination: Arc<MemoryDestination>,
    migrations: Arc<RecordingMigrations>,
    config: SyncConfig,
}

impl Harness {
    fn new(descriptors: &[StreamDescriptor], config: SyncConfig) -> Self {
        init_tracing();
        let catalog = resolve_catalog(descriptors, &config.catalog_options()).unwrap();
        let staging = Arc::new(MemoryStaging::new());
        let destination = Arc::new(MemoryDestination::new(staging.clone()));
        Self {
            catalog,
            staging,
            destination,
            migrations: Arc::new(RecordingMigrations::new()),
            config,
        }
    }

    async fn run(&self, events: Vec<SyncEvent>) -> Result<SyncReport> {
        let orchestrator = SyncOrchestrator::new(
            self.config.clone(),
            self.catalog.clone(),
            self.staging.clone(),
            self.destination.clone(),
            self.migrations.clone(),
        );
        Ok(orchestrator
            .run(futures::stream::iter(events).boxed())
            .await?)
    }

    fn final_table(&self, key: &StreamKey) -> TableId {
        self.catalog.get(key).unwrap().final_table.clone()
    }

    fn raw_table(&self, key: &StreamKey) -> TableId {
        self.catalog.get(key).unwrap().raw_table.clone()
    }
}

fn find_by_id(rows: &[FinalRow], id: i64) -> FinalRow {
    rows.iter()
        .find(|r| r.values.get("id") == Some(&json!(id)))
        .cloned()
        .unwrap_or_else(|| panic!("no final row with id {}", id))
}

#[tokio::test]
async fn dedup_keeps_max_cursor_row_per_key() -> Result<()> {
    let harness = Harness::new(&[users_descriptor(SyncMode::AppendDedup)], test_config());
    let users = StreamKey::namespaced("public", "users");

    let report = harness
        .run(vec![
            SyncEvent::record(users.clone(), json!({"id": 1, "updated_at": 1})),
            SyncEvent::record(users.clone(), json!({"id": 1, "updated_at": 2})),
            SyncEvent::record(users.clone(), json!({"id": 2, "updated_at": 1})),
            SyncEvent::complete(users.clone()),
        ])
        .await?;

    assert!(report.is_success());
    let summary = &report.streams[&users];
    assert_eq!(summary.records_written, 3);
    assert_eq!(summary.records_typed, 2);

    let rows = harness.destination.final_rows(&harness.final_table(&users));
    assert_eq!(rows.len(), 2);
    assert_eq!(find_by_id(&rows, 1).values["updated_at"], json!(2));
    assert_eq!(find_by_id(&rows, 2).values["updated_at"], json!(1));

    // Migrations ran exactly once, before any merge.
    assert_eq!(harness.migrations.runs(), 1);
    Ok(())
}

#[tokio::test]
async fn dedup_ties_break_by_emitted_at() -> Result<()> {
    let harness = Harness::new(&[users_descriptor(SyncMode::AppendDedup)], test_config());
    let users = StreamKey::namespaced("public", "users");

    let early = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap();

    let report = harness
        .run(vec![
            SyncEvent::Record(
                Record::new(users.clone(), json!({"id": 1, "updated_at": 5, "tag": "old"}))
                    .with_emitted_at(early),
            ),
            SyncEvent::Record(
                Record::new(users.clone(), json!({"id": 1, "updated_at": 5, "tag": "new"}))
                    .with_emitted_at(late),
            ),
            SyncEvent::complete(users.clone()),
        ])
        .await?;

    assert!(report.is_success());
    let rows = harness.destination.final_rows(&harness.final_table(&users));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].emitted_at, late);
    Ok(())
}

#[tokio::test]
async fn merge_is_idempotent_on_unchanged_raw_table() -> Result<()> {
    let harness = Harness::new(&[users_descriptor(SyncMode::AppendDedup)], test_config());
    let users = StreamKey::namespaced("public", "users");

    harness
        .run(vec![
            SyncEvent::record(users.clone(), json!({"id": 1, "updated_at": 1})),
            SyncEvent::record(users.clone(), json!({"id": 2, "updated_at": 1})),
            SyncEvent::complete(users.clone()),
        ])
        .await?;

    let table = harness.final_table(&users);
    let before: Vec<_> = harness
        .destination
        .final_rows(&table)
        .iter()
        .map(|r| (r.id, r.values.clone()))
        .collect();

    // Re-running the merge with no new raw rows must change nothing.
    let stream = harness.catalog.get(&users).unwrap().clone();
    let outcome = harness.destination.finalize_stream(&stream).await?;
    assert_eq!(outcome.rows_typed, 0);

    let after: Vec<_> = harness
        .destination
        .final_rows(&table)
        .iter()
        .map(|r| (r.id, r.values.clone()))
        .collect();
    assert_eq!(before, after);
    Ok(())
}

#[tokio::test]
async fn overwrite_with_zero_records_swaps_in_empty_table() -> Result<()> {
    let harness = Harness::new(&[users_descriptor(SyncMode::Overwrite)], test_config());
    let users = StreamKey::namespaced("public", "users");
    let table = harness.final_table(&users);

    // Stale rows from an earlier sync.
    harness.destination.seed_final_rows(
        table.clone(),
        vec![FinalRow {
            id: uuid::Uuid::new_v4(),
            emitted_at: Utc::now(),
            values: serde_json::Map::from_iter([("id".to_string(), json!(99))]),
            errors: vec![],
        }],
    );

    let report = harness.run(vec![SyncEvent::complete(users.clone())]).await?;

    assert!(report.is_success());
    assert!(harness.destination.final_rows(&table).is_empty());
    Ok(())
}

#[tokio::test]
async fn flush_failure_isolates_streams() -> Result<()> {
    let mut failing = users_descriptor(SyncMode::AppendDedup);
    failing.name = "unstable".to_string();
    let healthy = users_descriptor(SyncMode::AppendDedup);

    // Large payloads so every record crosses the flush threshold and
    // becomes its own staged part.
    let body = "x".repeat(80 * 1024);

    let harness = Harness::new(&[failing, healthy], test_config());
    let unstable = StreamKey::namespaced("public", "unstable");
    let users = StreamKey::namespaced("public", "users");

    // Parts 0..=2 stage fine, parts 3+ fail.
    harness
        .staging
        .fail_stream_from_part(unstable.clone(), 3);

    // The healthy stream's records are buffered before the failing
    // stream can raise the signal and halt ingestion.
    let mut events = Vec::new();
    for i in 0..3 {
        events.push(SyncEvent::record(
            users.clone(),
            json!({"id": i, "updated_at": 1}),
        ));
    }
    for i in 0..5 {
        events.push(SyncEvent::record(
            unstable.clone(),
            json!({"id": i, "updated_at": 1, "body": body}),
        ));
    }
    events.push(SyncEvent::complete(unstable.clone()));
    events.push(SyncEvent::complete(users.clone()));

    let report = harness.run(events).await?;

    assert!(!report.is_success());
    assert!(report
        .flush_failure
        .as_deref()
        .unwrap()
        .contains("injected staging failure"));

    // The failing stream keeps its successfully loaded batches and
    // reports the cause.
    let unstable_summary = &report.streams[&unstable];
    assert_eq!(unstable_summary.records_written, 3);
    assert!(unstable_summary.error.is_some());
    assert_eq!(
        harness.destination.raw_row_count(&harness.raw_table(&unstable)),
        3
    );

    // The healthy stream is unaffected: full counts, merged normally.
    let users_summary = &report.streams[&users];
    assert!(users_summary.is_success());
    assert_eq!(users_summary.records_written, 3);
    assert_eq!(users_summary.records_typed, 3);
    assert_eq!(
        harness.destination.final_rows(&harness.final_table(&users)).len(),
        3
    );
    Ok(())
}

#[tokio::test]
async fn merge_failure_is_per_stream() -> Result<()> {
    let mut broken = users_descriptor(SyncMode::AppendDedup);
    broken.name = "broken".to_string();
    let healthy = users_descriptor(SyncMode::AppendDedup);

    let harness = Harness::new(&[broken, healthy], test_config());
    let broken_key = StreamKey::namespaced("public", "broken");
    let users = StreamKey::namespaced("public", "users");
    harness.destination.fail_finalize_for(broken_key.clone());

    let report = harness
        .run(vec![
            SyncEvent::record(broken_key.clone(), json!({"id": 1, "updated_at": 1})),
            SyncEvent::record(users.clone(), json!({"id": 1, "updated_at": 1})),
            SyncEvent::complete(broken_key.clone()),
            SyncEvent::complete(users.clone()),
        ])
        .await?;

    // No flush failure: the merge failed after loading.
    assert!(report.flush_failure.is_none());
    assert!(report.streams[&broken_key].error.is_some());
    assert_eq!(report.streams[&broken_key].records_written, 1);
    assert!(report.streams[&users].is_success());
    assert_eq!(report.streams[&users].records_typed, 1);
    Ok(())
}

#[tokio::test]
async fn typing_errors_land_in_row_metadata() -> Result<()> {
    let harness = Harness::new(&[users_descriptor(SyncMode::Append)], test_config());
    let users = StreamKey::namespaced("public", "users");

    let report = harness
        .run(vec![
            SyncEvent::record(users.clone(), json!({"id": "not-a-number", "updated_at": 7})),
            SyncEvent::complete(users.clone()),
        ])
        .await?;

    // A malformed field is a data-quality warning, not a failure.
    assert!(report.is_success());
    let rows = harness.destination.final_rows(&harness.final_table(&users));
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].values["id"], json!(null));
    assert_eq!(rows[0].values["updated_at"], json!(7));
    assert_eq!(rows[0].errors, vec!["id".to_string()]);
    Ok(())
}

#[tokio::test]
async fn streams_without_completion_marker_are_closed_at_end_of_input() -> Result<()> {
    let harness = Harness::new(&[users_descriptor(SyncMode::AppendDedup)], test_config());
    let users = StreamKey::namespaced("public", "users");

    let report = harness
        .run(vec![SyncEvent::record(
            users.clone(),
            json!({"id": 1, "updated_at": 1}),
        )])
        .await?;

    assert!(report.is_success());
    assert_eq!(report.streams[&users].records_written, 1);
    assert_eq!(report.streams[&users].records_typed, 1);
    Ok(())
}

#[tokio::test]
async fn record_for_unknown_stream_is_fatal() -> Result<()> {
    let harness = Harness::new(&[users_descriptor(SyncMode::Append)], test_config());

    let err = harness
        .run(vec![SyncEvent::record(
            StreamKey::namespaced("public", "ghosts"),
            json!({"id": 1}),
        )])
        .await
        .unwrap_err();

    // The catalog is supplied up front; a record outside it is a
    // configuration error, not a droppable event.
    assert!(err.to_string().contains("not present in the catalog"));
    Ok(())
}

#[tokio::test]
async fn staged_artifacts_are_cleaned_up_after_load() -> Result<()> {
    let harness = Harness::new(&[users_descriptor(SyncMode::Append)], test_config());
    let users = StreamKey::namespaced("public", "users");

    let report = harness
        .run(vec![
            SyncEvent::record(users.clone(), json!({"id": 1, "updated_at": 1})),
            SyncEvent::complete(users.clone()),
        ])
        .await?;

    assert!(report.is_success());
    assert_eq!(harness.staging.object_count(), 0);
    Ok(())
}

#[tokio::test]
async fn retained_artifacts_survive_the_sync() -> Result<()> {
    let config = SyncConfig {
        retain_staged_files: true,
        ..test_config()
    };
    let harness = Harness::new(&[users_descriptor(SyncMode::Append)], config);
    let users = StreamKey::namespaced("public", "users");

    let report = harness
        .run(vec![
            SyncEvent::record(users.clone(), json!({"id": 1, "updated_at": 1})),
            SyncEvent::complete(users.clone()),
        ])
        .await?;

    assert!(report.is_success());
    assert_eq!(harness.staging.object_count(), 1);
    Ok(())
}
