//! tidesink-engine - buffering, staging, flushing, and orchestration
//!
//! The runtime half of the tidesink sync engine:
//!
//! ```text
//! ingestion ──▶ BufferManager ──▶ FlushWorkerPool ──▶ StagingStore
//!                  (byte budget)     (bounded pool)       │
//!                                                         ▼
//!                                              Destination (raw load)
//!                                                         │
//!              SyncOrchestrator ── on stream close ──▶ merge ──▶ report
//! ```
//!
//! Backpressure is the buffer's semaphore: `enqueue` awaits budget, it
//! never drops. A flush failure raises the shared [`FlushSignal`];
//! ingestion halts, in-flight work completes, and the affected streams
//! report partial completion.

pub mod buffer;
pub mod flush;
pub mod orchestrator;
pub mod staging;
pub mod testing;

pub use buffer::{BufferManager, DrainedBatch};
pub use flush::{FlushSignal, FlushStats, FlushTask, FlushWorkerPool, StreamFlushStats};
pub use orchestrator::SyncOrchestrator;
pub use staging::{parse_staged_payload, serialize_batch, LocalStaging, StagingStore};
