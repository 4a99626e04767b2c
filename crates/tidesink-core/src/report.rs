//! Per-stream and per-sync outcome reporting

use std::collections::BTreeMap;

use crate::record::StreamKey;

/// Outcome of one stream within a sync
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    /// Records loaded into the raw table
    pub records_written: u64,
    /// Rows materialized by the typing/dedup merge
    pub records_typed: u64,
    /// Failure cause, if the stream did not complete cleanly
    pub error: Option<String>,
}

impl StreamSummary {
    /// Whether the stream completed without error
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of one sync run
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Per-stream summaries, keyed by stream
    pub streams: BTreeMap<StreamKey, StreamSummary>,
    /// Cause of the flush failure that halted ingestion, if any
    pub flush_failure: Option<String>,
}

impl SyncReport {
    /// Whether every stream completed without error
    pub fn is_success(&self) -> bool {
        self.flush_failure.is_none() && self.streams.values().all(StreamSummary::is_success)
    }

    /// Total records written to raw tables across all streams
    pub fn total_records_written(&self) -> u64 {
        self.streams.values().map(|s| s.records_written).sum()
    }
}
