//! In-memory record buffering under a global byte budget
//!
//! One semaphore permit per byte. `enqueue` awaits permits when the
//! budget is exhausted; that await is the backpressure mechanism, and no
//! record is ever dropped. A drained batch carries its permits, so the
//! budget is released only when the batch itself is released (after
//! staging), matching the record lifecycle: created by ingestion, freed
//! once staged.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use tidesink_core::error::{Result, SyncError};
use tidesink_core::record::{Record, StreamKey};

/// Records drained from one stream, holding their share of the budget
/// until dropped.
pub struct DrainedBatch {
    /// The drained records, in enqueue order
    pub records: Vec<Record>,
    /// Estimated bytes accounted against the budget
    pub bytes: usize,
    _permits: Vec<OwnedSemaphorePermit>,
}

impl DrainedBatch {
    /// Number of records in the batch
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Move the records out while keeping the budget permits held.
    ///
    /// The permits stand for the bytes until the batch is dropped after
    /// staging, even once the records themselves have been consumed.
    pub fn take_records(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.records)
    }
}

impl std::fmt::Debug for DrainedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainedBatch")
            .field("records", &self.records.len())
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[derive(Default)]
struct StreamBuffer {
    records: Vec<Record>,
    bytes: usize,
    permits: Vec<OwnedSemaphorePermit>,
}

/// Per-stream record buffers under one global byte budget
pub struct BufferManager {
    budget: Arc<Semaphore>,
    budget_bytes: usize,
    buffers: Mutex<HashMap<StreamKey, StreamBuffer>>,
}

impl BufferManager {
    /// Create a buffer manager with the given byte budget
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            budget: Arc::new(Semaphore::new(budget_bytes)),
            budget_bytes,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer one record, awaiting budget if necessary.
    ///
    /// Returns the stream's buffered byte count after the insert, which
    /// drives the caller's flush-threshold decision. A record larger
    /// than the entire budget is rejected rather than left to wait for
    /// space that can never free.
    pub async fn enqueue(&self, record: Record) -> Result<usize> {
        let size = record.estimated_size();
        if size > self.budget_bytes {
            return Err(SyncError::config(format!(
                "record of {} bytes exceeds the {} byte memory budget",
                size, self.budget_bytes
            )));
        }
        let permits = u32::try_from(size)
            .map_err(|_| SyncError::config(format!("record of {} bytes is too large", size)))?;
        let permit = self
            .budget
            .clone()
            .acquire_many_owned(permits)
            .await
            .map_err(|_| SyncError::internal("memory budget semaphore closed"))?;

        let mut buffers = self.buffers.lock().await;
        let buffer = buffers.entry(record.stream.clone()).or_default();
        buffer.records.push(record);
        buffer.bytes += size;
        buffer.permits.push(permit);
        Ok(buffer.bytes)
    }

    /// Atomically take everything buffered for one stream.
    ///
    /// Records enqueued after the drain snapshot belong to the next
    /// batch. Returns `None` when nothing is buffered.
    pub async fn drain(&self, stream: &StreamKey) -> Option<DrainedBatch> {
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers.remove(stream)?;
        if buffer.records.is_empty() {
            return None;
        }
        Some(DrainedBatch {
            records: buffer.records,
            bytes: buffer.bytes,
            _permits: buffer.permits,
        })
    }

    /// Bytes currently buffered for one stream
    pub async fn buffered_bytes(&self, stream: &StreamKey) -> usize {
        self.buffers
            .lock()
            .await
            .get(stream)
            .map_or(0, |b| b.bytes)
    }

    /// The stream holding the most buffered bytes, if any
    pub async fn largest_buffered(&self) -> Option<(StreamKey, usize)> {
        self.buffers
            .lock()
            .await
            .iter()
            .max_by_key(|(_, b)| b.bytes)
            .map(|(k, b)| (k.clone(), b.bytes))
    }

    /// Unused budget in bytes
    pub fn available_budget(&self) -> usize {
        self.budget.available_permits()
    }

    /// The configured budget in bytes
    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }
}
