//! tidesink-sql - SQL generation, destination handling, and migrations
//!
//! The target-store half of the tidesink engine:
//!
//! - [`SqlGenerator`] produces raw-table DDL, COPY-style bulk loads, and
//!   the typing/dedup merge statements; [`AnsiSqlGenerator`] is the
//!   generic warehouse implementation.
//! - [`SqlClient`] is the execution seam (statements, queries, and
//!   transactional batches); one implementation per target store.
//! - [`Destination`] is what the engine calls: prepare, bulk load,
//!   finalize. [`SqlDestination`] composes a generator with a client.
//! - [`MigrationEngine`] applies versioned schema migrations exactly
//!   once before any merge runs.
//! - [`testing`] ships in-memory doubles for the client and ledger
//!   seams.

pub mod generator;
pub mod handler;
pub mod migration;
pub mod testing;

pub use generator::{AnsiSqlGenerator, SqlGenerator, SWAP_SUFFIX};
pub use handler::{Destination, MergeOutcome, SqlClient, SqlDestination, StreamStatus};
pub use migration::{
    BoundMigrationEngine, Migration, MigrationEngine, MigrationLedger, MigrationRunner,
    RawLoadedAtMigration, RawMetaColumnMigration, SqlMigrationLedger,
};
pub use testing::{MemoryLedger, MemorySqlClient};
