//! Batch loader: one snapshot file in, one atomic table append out.

use chrono_tz::Tz;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::emit;
use crate::error::{CommitSnafu, FetchSnafu, LoadError, ParseSnafu, TaskJoinSnafu};
use crate::feed::FeedKind;
use crate::metrics::events::{RecordsDropped, RowsCommitted};
use crate::sink::{CommitOutcome, SnapshotTable};
use crate::source::{SnapshotObject, SnapshotSource};

/// Result of one successful load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Loaded {
    pub outcome: CommitOutcome,
    pub rows: usize,
    pub dropped_records: usize,
}

/// Fetches, parses and appends single snapshot files.
pub struct BatchLoader {
    feed: String,
    kind: FeedKind,
    source: Arc<dyn SnapshotSource>,
    table: Arc<dyn SnapshotTable>,
    tz: Tz,
}

impl BatchLoader {
    pub fn new(
        feed: impl Into<String>,
        kind: FeedKind,
        source: Arc<dyn SnapshotSource>,
        table: Arc<dyn SnapshotTable>,
        tz: Tz,
    ) -> Self {
        Self {
            feed: feed.into(),
            kind,
            source,
            table,
            tz,
        }
    }

    /// Load one snapshot file.
    ///
    /// Parsing runs on the blocking pool. Rows only count as committed when
    /// this call commits them; an [`CommitOutcome::AlreadyPresent`] result
    /// reports the parsed row count but emits nothing.
    pub async fn load(&self, object: &SnapshotObject) -> Result<Loaded, LoadError> {
        let location = object.location.as_str();

        let payload = self
            .source
            .fetch(object)
            .await
            .context(FetchSnafu { location })?;
        debug!(target = %self.feed, "Fetched {} ({} bytes)", location, payload.len());

        let (kind, tz, timestamp) = (self.kind, self.tz, object.timestamp);
        let rows = tokio::task::spawn_blocking(move || kind.parse_snapshot(timestamp, &payload, &tz))
            .await
            .context(TaskJoinSnafu { location })?
            .context(ParseSnafu { location })?;

        if rows.dropped_records > 0 {
            warn!(
                target = %self.feed,
                "Dropped {} record(s) without station_id from {}",
                rows.dropped_records,
                location
            );
        }

        let outcome = self
            .table
            .append_snapshot(&rows)
            .await
            .context(CommitSnafu { location })?;

        if let CommitOutcome::Committed { .. } = outcome {
            emit!(RowsCommitted {
                feed: self.feed.clone(),
                count: rows.num_rows() as u64,
            });
            emit!(RecordsDropped {
                feed: self.feed.clone(),
                count: rows.dropped_records as u64,
            });
        }

        Ok(Loaded {
            outcome,
            rows: rows.num_rows(),
            dropped_records: rows.dropped_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::retry::{Classify, ErrorClass};
    use crate::sink::MemoryTable;
    use crate::snapshot::SnapshotTimestamp;
    use crate::source::Listing;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;

    struct FixedSource(HashMap<String, &'static str>);

    #[async_trait]
    impl SnapshotSource for FixedSource {
        fn describe(&self) -> String {
            "fixed".to_string()
        }

        async fn list(&self) -> Result<Listing, StorageError> {
            Ok(Listing::default())
        }

        async fn fetch(&self, object: &SnapshotObject) -> Result<Bytes, StorageError> {
            Ok(Bytes::from_static(
                self.0.get(&object.location).copied().unwrap_or("").as_bytes(),
            ))
        }
    }

    fn object(location: &str, stamp: &str) -> SnapshotObject {
        SnapshotObject {
            timestamp: SnapshotTimestamp::parse_stamp(stamp).unwrap(),
            location: location.to_string(),
        }
    }

    fn loader(files: &[(&str, &'static str)], table: Arc<MemoryTable>) -> BatchLoader {
        let source = FixedSource(files.iter().map(|(k, v)| (k.to_string(), *v)).collect());
        BatchLoader::new(
            "station_status",
            FeedKind::Status,
            Arc::new(source),
            table,
            chrono_tz::UTC,
        )
    }

    #[tokio::test]
    async fn test_load_commits_and_counts_dropped() {
        let table = Arc::new(MemoryTable::new("raw_station_status"));
        let loader = loader(
            &[(
                "a.json",
                r#"{"last_updated": 1, "data": {"stations": [
                    {"station_id": "72", "num_bikes_available": 3},
                    {"num_bikes_available": 1},
                    {"station_id": "79"}
                ]}}"#,
            )],
            table.clone(),
        );

        let loaded = loader
            .load(&object("a.json", "20240115_140000"))
            .await
            .unwrap();
        assert!(matches!(loaded.outcome, CommitOutcome::Committed { .. }));
        assert_eq!(loaded.rows, 2);
        assert_eq!(loaded.dropped_records, 1);
        assert_eq!(table.total_rows().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_permanent() {
        let table = Arc::new(MemoryTable::new("raw_station_status"));
        let loader = loader(
            &[("bad.json", "{not json"), ("empty.json", r#"{"data": {}}"#)],
            table.clone(),
        );

        for (location, stamp) in [("bad.json", "20240115_140000"), ("empty.json", "20240115_141500")] {
            let err = loader.load(&object(location, stamp)).await.unwrap_err();
            assert!(matches!(err, LoadError::Parse { .. }));
            assert_eq!(err.class(), ErrorClass::Permanent);
        }
        assert_eq!(table.append_calls().await, 0);
    }

    #[tokio::test]
    async fn test_already_present_reports_without_committing() {
        let table = Arc::new(MemoryTable::new("raw_station_status"));
        let snapshot = object("a.json", "20240115_140000");
        table.seed(snapshot.timestamp).await;

        let loader = loader(
            &[("a.json", r#"{"data": {"stations": [{"station_id": "72"}]}}"#)],
            table.clone(),
        );
        let loaded = loader.load(&snapshot).await.unwrap();
        assert_eq!(loaded.outcome, CommitOutcome::AlreadyPresent);
        assert_eq!(table.total_rows().await, 0);
    }
}
