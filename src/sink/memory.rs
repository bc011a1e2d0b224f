//! In-memory snapshot table.
//!
//! Keeps committed snapshots in a map guarded by one async mutex, so the
//! presence check and the append are a single atomic step. Faults can be
//! queued to exercise retry and recovery paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{CommitOutcome, SnapshotTable};
use crate::error::WarehouseError;
use crate::feed::SnapshotRows;
use crate::snapshot::SnapshotTimestamp;

/// Failure injected into the next matching append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendFault {
    /// Fails with a transient error before anything is written.
    Unavailable,
    /// Commits the rows, then reports a transient failure, as if the
    /// acknowledgement was lost on the way back.
    LostAcknowledgement,
}

/// What a committed snapshot looks like from the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedSnapshot {
    pub version: i64,
    pub rows: usize,
    pub partition_values: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    version: i64,
    snapshots: BTreeMap<SnapshotTimestamp, CommittedSnapshot>,
    watermark_faults: usize,
    append_faults: Vec<(Option<SnapshotTimestamp>, AppendFault)>,
    append_calls: usize,
}

#[derive(Debug)]
pub struct MemoryTable {
    name: String,
    state: Mutex<State>,
    commit_delay: Option<Duration>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State {
                version: -1,
                ..State::default()
            }),
            commit_delay: None,
        }
    }

    /// Sleep before every append, to let concurrent writers interleave.
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    /// Mark a snapshot as committed without rows.
    pub async fn seed(&self, timestamp: SnapshotTimestamp) {
        let mut state = self.state.lock().await;
        state.version += 1;
        let version = state.version;
        state.snapshots.insert(
            timestamp,
            CommittedSnapshot {
                version,
                rows: 0,
                partition_values: BTreeMap::new(),
            },
        );
    }

    /// Fail the next `count` watermark reads.
    pub async fn fail_watermark(&self, count: usize) {
        self.state.lock().await.watermark_faults += count;
    }

    /// Queue a fault for the next append of `timestamp` (or of any snapshot).
    pub async fn inject(&self, timestamp: Option<SnapshotTimestamp>, fault: AppendFault) {
        self.state.lock().await.append_faults.push((timestamp, fault));
    }

    pub async fn snapshots(&self) -> BTreeMap<SnapshotTimestamp, CommittedSnapshot> {
        self.state.lock().await.snapshots.clone()
    }

    pub async fn total_rows(&self) -> usize {
        self.state.lock().await.snapshots.values().map(|s| s.rows).sum()
    }

    pub async fn append_calls(&self) -> usize {
        self.state.lock().await.append_calls
    }

    fn unavailable(&self, message: &str) -> WarehouseError {
        WarehouseError::Unavailable {
            table: self.name.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl SnapshotTable for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn committed_snapshots(&self) -> Result<BTreeSet<SnapshotTimestamp>, WarehouseError> {
        let mut state = self.state.lock().await;
        if state.watermark_faults > 0 {
            state.watermark_faults -= 1;
            return Err(self.unavailable("injected watermark failure"));
        }
        Ok(state.snapshots.keys().copied().collect())
    }

    async fn append_snapshot(&self, rows: &SnapshotRows) -> Result<CommitOutcome, WarehouseError> {
        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        state.append_calls += 1;

        let matching = state
            .append_faults
            .iter()
            .position(|(ts, _)| ts.is_none_or(|ts| ts == rows.timestamp));
        let fault = matching.map(|idx| state.append_faults.remove(idx).1);

        if fault == Some(AppendFault::Unavailable) {
            return Err(self.unavailable("injected append failure"));
        }

        if state.snapshots.contains_key(&rows.timestamp) {
            return Ok(CommitOutcome::AlreadyPresent);
        }

        state.version += 1;
        let version = state.version;
        state.snapshots.insert(
            rows.timestamp,
            CommittedSnapshot {
                version,
                rows: rows.num_rows(),
                partition_values: rows.partition_values.clone(),
            },
        );

        if fault == Some(AppendFault::LostAcknowledgement) {
            return Err(self.unavailable("injected lost acknowledgement"));
        }
        Ok(CommitOutcome::Committed { version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedKind;

    fn rows(stamp: &str) -> SnapshotRows {
        FeedKind::Status
            .parse_snapshot(
                SnapshotTimestamp::parse_stamp(stamp).unwrap(),
                br#"{"data": {"stations": [{"station_id": "a"}]}}"#,
                &chrono_tz::UTC,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_is_conditional() {
        let table = MemoryTable::new("t");
        let first = rows("20240115_140000");

        assert_eq!(
            table.append_snapshot(&first).await.unwrap(),
            CommitOutcome::Committed { version: 0 }
        );
        assert_eq!(
            table.append_snapshot(&first).await.unwrap(),
            CommitOutcome::AlreadyPresent
        );
        assert_eq!(table.total_rows().await, 1);
        assert_eq!(table.committed_snapshots().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_faults_are_consumed() {
        let table = MemoryTable::new("t");
        let snapshot = rows("20240115_140000");
        table.fail_watermark(1).await;
        table.inject(Some(snapshot.timestamp), AppendFault::Unavailable).await;

        assert!(table.committed_snapshots().await.is_err());
        assert!(table.committed_snapshots().await.is_ok());

        let other = rows("20240115_141500");
        assert!(table.append_snapshot(&other).await.is_ok());
        assert!(table.append_snapshot(&snapshot).await.is_err());
        assert!(table.append_snapshot(&snapshot).await.is_ok());
    }

    #[tokio::test]
    async fn test_lost_acknowledgement_still_commits() {
        let table = MemoryTable::new("t");
        let snapshot = rows("20240115_140000");
        table.inject(None, AppendFault::LostAcknowledgement).await;

        assert!(table.append_snapshot(&snapshot).await.is_err());
        assert_eq!(
            table.append_snapshot(&snapshot).await.unwrap(),
            CommitOutcome::AlreadyPresent
        );
        assert_eq!(table.snapshots().await.len(), 1);
    }
}
