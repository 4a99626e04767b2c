//! Flush workers: drain buffered batches into the raw tables
//!
//! A bounded pool of workers consumes flush tasks from a queue. Each
//! task serializes its batch, stages it, bulk-loads the artifact, and
//! cleans the artifact up. Tasks are fire-and-report: any failure sets
//! the shared [`FlushSignal`] and is not retried; the halt decision
//! belongs to the orchestrator. In-flight tasks always run to
//! completion so no partially-staged artifact is left behind.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tidesink_core::catalog::StreamConfig;
use tidesink_core::config::SyncConfig;
use tidesink_core::error::{Result, SyncError};
use tidesink_core::record::StreamKey;
use tidesink_sql::handler::Destination;

use crate::buffer::DrainedBatch;
use crate::staging::{serialize_batch, StagingStore};

/// Process-wide, write-once-per-sync flush failure signal.
///
/// Monotonic: once set it stays set for the sync. The first cause wins;
/// every stream whose flush failed is recorded so summaries can tell
/// failed streams from merely-halted ones.
#[derive(Default)]
pub struct FlushSignal {
    occurred: AtomicBool,
    state: Mutex<SignalState>,
}

#[derive(Default)]
struct SignalState {
    cause: Option<String>,
    failed_streams: HashMap<StreamKey, String>,
}

impl FlushSignal {
    /// Create an unset signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a flush failure for one stream
    pub fn set(&self, stream: &StreamKey, cause: impl Into<String>) {
        let cause = cause.into();
        let mut state = self.state.lock();
        self.occurred.store(true, Ordering::SeqCst);
        state
            .failed_streams
            .entry(stream.clone())
            .or_insert_with(|| cause.clone());
        if state.cause.is_none() {
            state.cause = Some(cause);
        }
    }

    /// Whether any flush has failed
    pub fn is_set(&self) -> bool {
        self.occurred.load(Ordering::SeqCst)
    }

    /// The first recorded cause, if any
    pub fn cause(&self) -> Option<String> {
        self.state.lock().cause.clone()
    }

    /// The first recorded cause for a specific stream, if its flush failed
    pub fn stream_cause(&self, stream: &StreamKey) -> Option<String> {
        self.state.lock().failed_streams.get(stream).cloned()
    }

    /// Whether a specific stream's flush failed
    pub fn stream_failed(&self, stream: &StreamKey) -> bool {
        self.stream_cause(stream).is_some()
    }
}

/// Per-stream flush counters
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamFlushStats {
    /// Records loaded into the raw table
    pub records: u64,
    /// Batches loaded
    pub batches: u64,
    /// Staged bytes
    pub bytes: u64,
}

/// Aggregated flush statistics across workers
#[derive(Default)]
pub struct FlushStats {
    per_stream: Mutex<HashMap<StreamKey, StreamFlushStats>>,
}

impl FlushStats {
    fn add(&self, stream: &StreamKey, records: u64, bytes: u64) {
        let mut per_stream = self.per_stream.lock();
        let entry = per_stream.entry(stream.clone()).or_default();
        entry.records += records;
        entry.batches += 1;
        entry.bytes += bytes;
    }

    /// Counters for one stream
    pub fn stream(&self, stream: &StreamKey) -> StreamFlushStats {
        self.per_stream.lock().get(stream).copied().unwrap_or_default()
    }
}

/// Counts in-flight flush tasks per stream so the close path can await
/// quiescence before merging.
///
/// Completion is signalled through a watch channel: a completion that
/// lands between a waiter's count check and its await still flips the
/// channel version, so the waiter cannot sleep through it.
struct FlushTracker {
    inflight: Mutex<HashMap<StreamKey, usize>>,
    completions: watch::Sender<u64>,
}

impl Default for FlushTracker {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            completions: watch::channel(0).0,
        }
    }
}

impl FlushTracker {
    fn begin(&self, stream: &StreamKey) {
        let mut inflight = self.inflight.lock();
        *inflight.entry(stream.clone()).or_insert(0) += 1;
    }

    fn complete(&self, stream: &StreamKey) {
        let mut inflight = self.inflight.lock();
        if let Some(count) = inflight.get_mut(stream) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inflight.remove(stream);
            }
        }
        drop(inflight);
        self.completions.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn count(&self, stream: &StreamKey) -> usize {
        self.inflight.lock().get(stream).copied().unwrap_or(0)
    }

    async fn wait_idle(&self, stream: &StreamKey) {
        let mut completions = self.completions.subscribe();
        while self.count(stream) > 0 {
            if completions.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One unit of flush work
pub struct FlushTask {
    /// Stream the batch belongs to
    pub stream: StreamConfig,
    /// Drained records (holding their budget permits)
    pub batch: DrainedBatch,
    /// Part number within the stream for this sync
    pub part: u64,
}

/// Bounded pool of flush workers
pub struct FlushWorkerPool {
    sender: mpsc::Sender<FlushTask>,
    workers: Vec<JoinHandle<()>>,
    tracker: Arc<FlushTracker>,
    stats: Arc<FlushStats>,
    signal: Arc<FlushSignal>,
}

impl FlushWorkerPool {
    /// Spawn the worker pool
    pub fn new(
        config: &SyncConfig,
        staging: Arc<dyn StagingStore>,
        destination: Arc<dyn Destination>,
        signal: Arc<FlushSignal>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel::<FlushTask>(config.flush_workers * 2);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let tracker = Arc::new(FlushTracker::default());
        let stats = Arc::new(FlushStats::default());

        let workers = (0..config.flush_workers)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let staging = staging.clone();
                let destination = destination.clone();
                let signal = signal.clone();
                let tracker = tracker.clone();
                let stats = stats.clone();
                let compression = config.staging_compression;
                let retain = config.retain_staged_files;
                tokio::spawn(async move {
                    loop {
                        let task = { receiver.lock().await.recv().await };
                        let Some(mut task) = task else { break };
                        let key = task.stream.key();
                        let result = run_flush(
                            &mut task,
                            staging.as_ref(),
                            destination.as_ref(),
                            &stats,
                            compression,
                            retain,
                        )
                        .await;
                        if let Err(e) = result {
                            error!("Flush worker {} failed for stream '{}': {}", worker_id, key, e);
                            signal.set(&key, e.to_string());
                        }
                        tracker.complete(&key);
                    }
                    debug!("Flush worker {} stopped", worker_id);
                })
            })
            .collect();

        info!("Flush worker pool started ({} workers)", config.flush_workers);
        Self {
            sender,
            workers,
            tracker,
            stats,
            signal,
        }
    }

    /// Submit a batch for flushing. Applies queue backpressure when all
    /// workers are busy.
    pub async fn submit(&self, task: FlushTask) -> Result<()> {
        let key = task.stream.key();
        self.tracker.begin(&key);
        if let Err(e) = self.sender.send(task).await {
            self.tracker.complete(&key);
            return Err(SyncError::internal(format!(
                "flush queue closed while submitting batch for '{}': {}",
                key, e
            )));
        }
        Ok(())
    }

    /// Await completion of every in-flight flush for one stream
    pub async fn wait_idle(&self, stream: &StreamKey) {
        self.tracker.wait_idle(stream).await;
    }

    /// Flush counters
    pub fn stats(&self) -> &FlushStats {
        &self.stats
    }

    /// The shared failure signal
    pub fn signal(&self) -> &FlushSignal {
        &self.signal
    }

    /// Stop accepting work and wait for the workers to drain
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Flush worker panicked during shutdown: {}", e);
            }
        }
    }
}

async fn run_flush(
    task: &mut FlushTask,
    staging: &dyn StagingStore,
    destination: &dyn Destination,
    stats: &FlushStats,
    compression: tidesink_core::config::StagingCompression,
    retain: bool,
) -> Result<()> {
    let key = task.stream.key();
    let (payload, count) = serialize_batch(task.batch.take_records(), compression)?;
    let artifact = staging.stage(&task.stream, task.part, payload, count).await?;

    let loaded = destination.bulk_load(&task.stream, &artifact).await?;
    stats.add(&key, loaded, artifact.bytes);
    debug!(
        "Stream '{}' flushed part {}: {} records, {} bytes",
        key, task.part, loaded, artifact.bytes
    );

    if !retain {
        if let Err(e) = staging.cleanup(&artifact).await {
            // The raw rows are already loaded; a leftover artifact is a
            // cost problem, not a correctness problem.
            warn!("Stream '{}' failed to clean up staged artifact: {}", key, e);
        }
    }
    Ok(())
}
