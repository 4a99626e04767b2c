//! Top-level sync coordination
//!
//! The orchestrator wires the pieces together: connectivity check,
//! migrations, per-stream preparation, the ingestion loop with
//! threshold-driven flushing, and the close path that runs the
//! typing/dedup merge and assembles the per-stream summaries.
//!
//! Shared mutable state is limited to the buffer budget and the flush
//! failure signal; catalog and configuration are immutable after start.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use validator::Validate;

use tidesink_core::catalog::{ParsedCatalog, StreamConfig};
use tidesink_core::config::SyncConfig;
use tidesink_core::error::{Result, SyncError};
use tidesink_core::record::{StreamKey, SyncEvent};
use tidesink_core::report::{StreamSummary, SyncReport};
use tidesink_sql::handler::Destination;
use tidesink_sql::migration::MigrationRunner;

use crate::buffer::BufferManager;
use crate::flush::{FlushSignal, FlushTask, FlushWorkerPool};
use crate::staging::StagingStore;

/// Coordinates one sync run end to end
pub struct SyncOrchestrator {
    config: SyncConfig,
    catalog: ParsedCatalog,
    staging: Arc<dyn StagingStore>,
    destination: Arc<dyn Destination>,
    migrations: Arc<dyn MigrationRunner>,
}

impl SyncOrchestrator {
    /// Create an orchestrator for one sync
    pub fn new(
        config: SyncConfig,
        catalog: ParsedCatalog,
        staging: Arc<dyn StagingStore>,
        destination: Arc<dyn Destination>,
        migrations: Arc<dyn MigrationRunner>,
    ) -> Self {
        Self {
            config,
            catalog,
            staging,
            destination,
            migrations,
        }
    }

    /// Run the sync: consume events until the input ends, then finalize
    /// every stream and report.
    ///
    /// Fatal conditions (configuration, connectivity, migrations) return
    /// an error before any record is buffered. Flush failures do not:
    /// they halt ingestion, and the affected streams report their cause
    /// in the summary.
    pub async fn run(self, mut events: BoxStream<'_, SyncEvent>) -> Result<SyncReport> {
        self.config
            .validate()
            .map_err(|e| SyncError::config(e.to_string()))?;

        self.destination.check().await?;
        info!("Destination connectivity check passed");

        self.migrations.apply_pending(&self.catalog).await?;

        for stream in self.catalog.streams() {
            let status = self.destination.initial_status(stream).await?;
            self.destination.prepare_stream(stream, &status).await?;
        }
        info!("Sync started: {} stream(s) prepared", self.catalog.len());

        let signal = Arc::new(FlushSignal::new());
        let buffer = BufferManager::new(self.config.memory_budget_bytes);
        let pool = FlushWorkerPool::new(
            &self.config,
            self.staging.clone(),
            self.destination.clone(),
            signal.clone(),
        );

        let mut parts: HashMap<StreamKey, u64> = HashMap::new();
        let mut summaries: BTreeMap<StreamKey, StreamSummary> = BTreeMap::new();
        let mut closed: HashSet<StreamKey> = HashSet::new();
        let mut fatal: Option<SyncError> = None;

        while let Some(event) = events.next().await {
            match event {
                SyncEvent::Record(record) => {
                    if signal.is_set() {
                        info!(
                            "Ingestion halted by flush failure: {}",
                            signal.cause().unwrap_or_default()
                        );
                        break;
                    }
                    let key = record.stream.clone();
                    let Some(stream) = self.catalog.get(&key).cloned() else {
                        fatal = Some(SyncError::config(format!(
                            "record for stream '{}' not present in the catalog",
                            key
                        )));
                        break;
                    };
                    if closed.contains(&key) {
                        warn!("Stream '{}' received a record after completion, dropping", key);
                        continue;
                    }

                    // Liveness under budget pressure: if this record
                    // cannot fit right now, push out the fattest buffer
                    // instead of waiting on a threshold that may never
                    // trigger.
                    if buffer.available_budget() < record.estimated_size() {
                        if let Some((victim, bytes)) = buffer.largest_buffered().await {
                            debug!(
                                "Budget pressure: early flush of '{}' ({} bytes buffered)",
                                victim, bytes
                            );
                            let Some(victim_config) = self.catalog.get(&victim).cloned() else {
                                fatal = Some(SyncError::internal(
                                    "buffered stream missing from catalog",
                                ));
                                break;
                            };
                            if let Err(e) = self
                                .submit_drained(&victim_config, &buffer, &pool, &mut parts)
                                .await
                            {
                                fatal = Some(e);
                                break;
                            }
                        }
                    }

                    match buffer.enqueue(record).await {
                        Ok(buffered) if buffered >= self.config.flush_threshold_bytes => {
                            if let Err(e) = self
                                .submit_drained(&stream, &buffer, &pool, &mut parts)
                                .await
                            {
                                fatal = Some(e);
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            fatal = Some(e);
                            break;
                        }
                    }
                }
                SyncEvent::StreamComplete(key) => {
                    if closed.contains(&key) {
                        warn!("Stream '{}' completed twice, ignoring", key);
                        continue;
                    }
                    let Some(stream) = self.catalog.get(&key).cloned() else {
                        warn!("Completion marker for unknown stream '{}', ignoring", key);
                        continue;
                    };
                    let summary = self
                        .close_stream(&stream, &buffer, &pool, &signal, &mut parts)
                        .await;
                    closed.insert(key.clone());
                    summaries.insert(key, summary);
                }
            }
        }

        if let Some(fatal) = fatal {
            pool.shutdown().await;
            return Err(fatal);
        }

        // Streams without an explicit completion marker are closed as if
        // one had been observed, so buffered records are not dropped.
        for stream in self.catalog.streams().to_vec() {
            let key = stream.key();
            if closed.contains(&key) {
                continue;
            }
            let summary = self
                .close_stream(&stream, &buffer, &pool, &signal, &mut parts)
                .await;
            closed.insert(key.clone());
            summaries.insert(key, summary);
        }

        pool.shutdown().await;

        let report = SyncReport {
            streams: summaries,
            flush_failure: signal.cause(),
        };
        info!(
            "Sync finished: {} stream(s), {} record(s) written, success={}",
            report.streams.len(),
            report.total_records_written(),
            report.is_success()
        );
        Ok(report)
    }

    /// Drain whatever is buffered for the stream and hand it to the pool
    async fn submit_drained(
        &self,
        stream: &StreamConfig,
        buffer: &BufferManager,
        pool: &FlushWorkerPool,
        parts: &mut HashMap<StreamKey, u64>,
    ) -> Result<()> {
        let key = stream.key();
        let Some(batch) = buffer.drain(&key).await else {
            return Ok(());
        };
        let part = parts.entry(key.clone()).or_insert(0);
        let task = FlushTask {
            stream: stream.clone(),
            batch,
            part: *part,
        };
        *part += 1;
        pool.submit(task).await
    }

    /// Close one stream: final flush, quiescence, merge, summary.
    ///
    /// A merge failure is a per-stream condition; other streams proceed.
    async fn close_stream(
        &self,
        stream: &StreamConfig,
        buffer: &BufferManager,
        pool: &FlushWorkerPool,
        signal: &FlushSignal,
        parts: &mut HashMap<StreamKey, u64>,
    ) -> StreamSummary {
        let key = stream.key();

        // A failed stream's pipeline is broken: its buffered remainder
        // stays unflushed. Other streams still flush and merge; the
        // global signal only halts ingestion.
        if !signal.stream_failed(&key) {
            if let Err(e) = self.submit_drained(stream, buffer, pool, parts).await {
                error!("Stream '{}' final flush submission failed: {}", key, e);
                return StreamSummary {
                    records_written: pool.stats().stream(&key).records,
                    records_typed: 0,
                    error: Some(e.to_string()),
                };
            }
        }

        pool.wait_idle(&key).await;
        let stats = pool.stats().stream(&key);
        let mut summary = StreamSummary {
            records_written: stats.records,
            records_typed: 0,
            error: None,
        };

        if let Some(cause) = signal.stream_cause(&key) {
            // Partial completion: already-loaded raw batches stay, the
            // merge is skipped for this stream.
            summary.error = Some(cause);
            warn!(
                "Stream '{}' closed partially: {} record(s) in raw, flush failed",
                key, stats.records
            );
            return summary;
        }

        match self.destination.finalize_stream(stream).await {
            Ok(outcome) => {
                summary.records_typed = outcome.rows_typed;
                info!(
                    "Stream '{}' closed: {} written, {} typed",
                    key, summary.records_written, summary.records_typed
                );
            }
            Err(e) => {
                error!("Stream '{}' merge failed: {}", key, e);
                summary.error = Some(e.to_string());
            }
        }
        summary
    }
}
