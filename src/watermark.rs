//! Watermark resolution and delta selection.
//!
//! The watermark is the set of snapshot timestamps a table has committed,
//! never a single high-water mark: a gap left by a failed file stays
//! selectable on every later run.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::RunError;
use crate::retry::{RetryPolicy, retry};
use crate::sink::SnapshotTable;
use crate::snapshot::SnapshotTimestamp;
use crate::source::{Listing, SnapshotObject};

/// Snapshot timestamps committed to a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermark(BTreeSet<SnapshotTimestamp>);

impl Watermark {
    pub fn new(committed: BTreeSet<SnapshotTimestamp>) -> Self {
        Self(committed)
    }

    pub fn contains(&self, timestamp: &SnapshotTimestamp) -> bool {
        self.0.contains(timestamp)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Latest committed timestamp, for logging only.
    pub fn latest(&self) -> Option<SnapshotTimestamp> {
        self.0.last().copied()
    }
}

/// Read the table's committed snapshots, retrying transient failures.
///
/// Fails closed: if the set cannot be read the run must not load anything.
pub async fn resolve(table: &dyn SnapshotTable, policy: &RetryPolicy) -> Result<Watermark, RunError> {
    let what = format!("watermark:{}", table.name());
    let attempted = retry(policy, &what, move |_| table.committed_snapshots()).await;

    match attempted.result {
        Ok(committed) => {
            let watermark = Watermark::new(committed);
            if watermark.is_empty() {
                info!(target = %table.name(), "Table holds no snapshots yet");
            } else if let Some(latest) = watermark.latest() {
                info!(
                    target = %table.name(),
                    "Watermark holds {} snapshot(s), latest {}",
                    watermark.len(),
                    latest
                );
            }
            Ok(watermark)
        }
        Err(source) => Err(RunError::Watermark {
            table: table.name().to_string(),
            attempts: attempted.attempts,
            source,
        }),
    }
}

/// Split candidates into those still to load and those already committed.
///
/// Both halves keep the listing's ascending timestamp order.
pub fn select_delta(
    listing: &Listing,
    watermark: &Watermark,
) -> (Vec<SnapshotObject>, Vec<SnapshotObject>) {
    let (committed, pending): (Vec<_>, Vec<_>) = listing
        .candidates
        .iter()
        .cloned()
        .partition(|object| watermark.contains(&object.timestamp));

    debug!(
        "Selected {} pending, {} already committed",
        pending.len(),
        committed.len()
    );
    (pending, committed)
}
