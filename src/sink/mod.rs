//! Target tables for loaded snapshots.
//!
//! A [`SnapshotTable`] answers two questions: which snapshots are already
//! committed (the watermark), and "append this snapshot unless it is already
//! there". Both Delta Lake and an in-memory table implement it.

pub mod delta;
pub mod memory;
pub mod parquet;

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::WarehouseError;
use crate::feed::SnapshotRows;
use crate::snapshot::SnapshotTimestamp;

pub use delta::DeltaSnapshotTable;
pub use memory::MemoryTable;

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Rows are now committed at this table version.
    Committed { version: i64 },
    /// The snapshot was already committed; nothing was written.
    AlreadyPresent,
}

/// A warehouse table holding one atomic group of rows per snapshot.
#[async_trait]
pub trait SnapshotTable: Send + Sync {
    fn name(&self) -> &str;

    /// Timestamps of every snapshot currently committed.
    ///
    /// Must reflect committed state only and must fail rather than guess.
    async fn committed_snapshots(&self) -> Result<BTreeSet<SnapshotTimestamp>, WarehouseError>;

    /// Atomically append every row of one snapshot.
    ///
    /// Either all rows become visible or none do. If the snapshot is already
    /// committed, by this or a concurrent writer, returns
    /// [`CommitOutcome::AlreadyPresent`] and writes nothing.
    async fn append_snapshot(&self, rows: &SnapshotRows) -> Result<CommitOutcome, WarehouseError>;
}
