//! Run coordination.
//!
//! A [`Coordinator`] owns one feed: its lake source, its target table and
//! the policies around them. Each call to [`Coordinator::run`] resolves the
//! watermark, lists the lake, selects the delta and loads it, producing a
//! [`RunSummary`].
//!
//! # Ordering and concurrency
//!
//! The delta is loaded in ascending timestamp order with at most
//! `max_concurrent_files` loads in flight. Results are aggregated in the same
//! order. Cancellation is observed between files: a file that has started
//! runs to completion, including its commit.

mod summary;

pub use summary::{LoadFailure, LoadResult, LoadStatus, RunSummary};

use chrono::Utc;
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use snafu::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, FeedConfig};
use crate::dlq::{DeadLetterQueue, FailedFile};
use crate::emit;
use crate::error::{ConfigSnafu, PipelineError, PipelineStorageSnafu, RunError, WarehouseSnafu};
use crate::feed::FeedKind;
use crate::loader::BatchLoader;
use crate::metrics::events::{
    FileStatus, RunCompleted, SnapshotFileFailed, SnapshotFileProcessed, UnparseableObjects,
    WatermarkResolved,
};
use crate::retry::{Classify, RetryPolicy, retry};
use crate::sink::{CommitOutcome, DeltaSnapshotTable, SnapshotTable};
use crate::source::{LakeSource, Listing, SnapshotObject, SnapshotSource};
use crate::storage::StorageProvider;
use crate::watermark::{self, Watermark, select_delta};

/// What a run would do, without doing it.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub feed: String,
    pub table: String,
    pub committed: usize,
    pub already_loaded: usize,
    pub pending: Vec<SnapshotObject>,
    pub unparseable: Vec<String>,
}

/// Sequences watermark, listing, selection and loads for one feed.
pub struct Coordinator {
    feed: String,
    source: Arc<dyn SnapshotSource>,
    table: Arc<dyn SnapshotTable>,
    loader: BatchLoader,
    policy: RetryPolicy,
    max_concurrent_files: usize,
    dlq: Option<Arc<DeadLetterQueue>>,
}

impl Coordinator {
    pub fn new(
        feed: impl Into<String>,
        kind: FeedKind,
        source: Arc<dyn SnapshotSource>,
        table: Arc<dyn SnapshotTable>,
        tz: Tz,
    ) -> Self {
        let feed = feed.into();
        let loader = BatchLoader::new(feed.clone(), kind, source.clone(), table.clone(), tz);
        Self {
            feed,
            source,
            table,
            loader,
            policy: RetryPolicy::default(),
            max_concurrent_files: 1,
            dlq: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_concurrent_files(mut self, max: usize) -> Self {
        self.max_concurrent_files = max.max(1);
        self
    }

    pub fn with_dlq(mut self, dlq: Option<Arc<DeadLetterQueue>>) -> Self {
        self.dlq = dlq;
        self
    }

    /// Build a coordinator for a configured feed against its Delta table.
    ///
    /// The table must already exist with every column the feed writes.
    pub async fn from_config(
        name: &str,
        feed: &FeedConfig,
        config: &Config,
        dlq: Option<Arc<DeadLetterQueue>>,
    ) -> Result<Self, PipelineError> {
        let lake = StorageProvider::for_url_with_options(
            &config.lake.url,
            config.lake.storage_options.clone(),
        )
        .await
        .context(PipelineStorageSnafu)?;
        let source = LakeSource::new(Arc::new(lake), &feed.source_prefix, feed.file_prefix());

        let table = DeltaSnapshotTable::open(
            table_name(&feed.table_uri),
            feed.kind,
            &feed.table_uri,
            feed.storage_options.clone(),
        )
        .await
        .context(WarehouseSnafu)?;

        let tz = config.timezone().context(ConfigSnafu)?;
        Ok(Self::new(name, feed.kind, Arc::new(source), Arc::new(table), tz)
            .with_retry_policy(RetryPolicy::from(&config.retry))
            .with_max_concurrent_files(config.max_concurrent_files)
            .with_dlq(dlq))
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    async fn list(&self) -> Result<Listing, RunError> {
        let what = format!("list:{}", self.feed);
        let source = self.source.as_ref();
        let attempted = retry(&self.policy, &what, move |_| source.list()).await;

        attempted.result.map_err(|source| RunError::Listing {
            prefix: self.source.describe(),
            attempts: attempted.attempts,
            source,
        })
    }

    /// Resolve the watermark and list the lake.
    ///
    /// The watermark is read first; if it cannot be read nothing else happens.
    async fn prepare(&self) -> Result<(Watermark, Listing), RunError> {
        let watermark = watermark::resolve(self.table.as_ref(), &self.policy).await?;
        let listing = self.list().await?;

        if !listing.unparseable.is_empty() {
            warn!(
                target = %self.feed,
                "{} object(s) have no parseable timestamp: {}",
                listing.unparseable.len(),
                listing.unparseable.join(", ")
            );
            emit!(UnparseableObjects {
                feed: self.feed.clone(),
                count: listing.unparseable.len() as u64,
            });
        }
        Ok((watermark, listing))
    }

    /// Work out what a run would load.
    pub async fn plan(&self) -> Result<RunPlan, RunError> {
        let (watermark, listing) = self.prepare().await?;
        let (pending, committed) = select_delta(&listing, &watermark);

        Ok(RunPlan {
            feed: self.feed.clone(),
            table: self.table.name().to_string(),
            committed: watermark.len(),
            already_loaded: committed.len(),
            pending,
            unparseable: listing.unparseable,
        })
    }

    /// Load every snapshot in the lake that the table does not hold yet.
    ///
    /// Fails only if the watermark or the listing cannot be read; per-file
    /// failures are reported in the summary.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<RunSummary, RunError> {
        let start = Instant::now();
        let run_started = Utc::now();

        let (watermark, listing) = self.prepare().await?;
        let (pending, committed) = select_delta(&listing, &watermark);

        emit!(WatermarkResolved {
            feed: self.feed.clone(),
            committed: watermark.len(),
            pending: pending.len(),
        });
        info!(
            target = %self.feed,
            "{} candidate(s), {} already loaded, {} to load",
            listing.candidates.len(),
            committed.len(),
            pending.len()
        );

        let mut summary = RunSummary::new(&self.feed);
        summary.considered = listing.candidates.len();
        summary.unparseable = listing.unparseable;

        for object in committed {
            self.finish(&mut summary, LoadResult::skipped(object, 0));
        }

        let results: Vec<LoadResult> = stream::iter(pending)
            .map(|object| self.load_one(object, shutdown))
            .buffered(self.max_concurrent_files)
            .collect()
            .await;

        for result in results {
            self.finish(&mut summary, result);
        }

        summary.cancelled = shutdown.is_cancelled();
        self.record_failures(&summary, run_started).await;

        emit!(RunCompleted {
            feed: self.feed.clone(),
            duration: start.elapsed(),
            cancelled: summary.cancelled,
        });
        summary.log();
        Ok(summary)
    }

    /// Load one file under the retry policy, unless the run was cancelled first.
    async fn load_one(&self, object: SnapshotObject, shutdown: &CancellationToken) -> LoadResult {
        if shutdown.is_cancelled() {
            return LoadResult::not_attempted(object);
        }

        debug!(target = %self.feed, "Loading {}", object.location);
        let what = format!("load:{}", object.location);
        let loader = &self.loader;
        let target = &object;
        let attempted = retry(&self.policy, &what, move |_| loader.load(target)).await;

        match attempted.result {
            Ok(loaded) => match loaded.outcome {
                CommitOutcome::Committed { version } => {
                    debug!(
                        target = %self.feed,
                        "Loaded {} ({} rows) at version {}",
                        object.location,
                        loaded.rows,
                        version
                    );
                    LoadResult::loaded(
                        object,
                        loaded.rows,
                        loaded.dropped_records,
                        attempted.attempts,
                    )
                }
                CommitOutcome::AlreadyPresent => {
                    info!(
                        target = %self.feed,
                        "{} was loaded concurrently, skipping",
                        object.location
                    );
                    LoadResult::skipped(object, attempted.attempts)
                }
            },
            Err(err) => {
                let class = err.class();
                error!(
                    target = %self.feed,
                    "Giving up on {} after {} attempt(s) [{}]: {}",
                    object.location,
                    attempted.attempts,
                    class.as_str(),
                    err
                );
                emit!(SnapshotFileFailed {
                    feed: self.feed.clone(),
                    class,
                });
                LoadResult::failed(object, class, err.to_string(), attempted.attempts)
            }
        }
    }

    fn finish(&self, summary: &mut RunSummary, result: LoadResult) {
        let status = match result.status {
            LoadStatus::Loaded => FileStatus::Loaded,
            LoadStatus::SkippedDuplicate => FileStatus::SkippedDuplicate,
            LoadStatus::Failed => FileStatus::Failed,
            LoadStatus::NotAttempted => FileStatus::NotAttempted,
        };
        emit!(SnapshotFileProcessed {
            feed: self.feed.clone(),
            status,
        });
        summary.record(result);
    }

    async fn record_failures(&self, summary: &RunSummary, run_started: chrono::DateTime<Utc>) {
        let Some(dlq) = &self.dlq else {
            return;
        };

        let records: Vec<FailedFile> = summary
            .failures
            .iter()
            .filter_map(|result| FailedFile::from_result(result, Utc::now()))
            .collect();

        // Loads are already committed; a DLQ outage only loses the report.
        if let Err(e) = dlq.write_run(&self.feed, run_started, &records).await {
            error!(target = %self.feed, "Failed to record failures to DLQ: {}", e);
        }
    }
}

/// Table name from the last path segment of its URI.
pub fn table_name(table_uri: &str) -> String {
    table_uri
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(table_uri)
        .to_string()
}

/// Run every coordinator once, in order.
///
/// A run error aborts only its own feed. Returns the summaries of completed
/// runs and the errors of aborted ones.
pub async fn run_all(
    coordinators: &[Coordinator],
    shutdown: &CancellationToken,
) -> (Vec<RunSummary>, Vec<(String, RunError)>) {
    let mut summaries = Vec::with_capacity(coordinators.len());
    let mut aborted = Vec::new();

    for coordinator in coordinators {
        if shutdown.is_cancelled() {
            info!(target = %coordinator.feed(), "Shutdown requested, not starting run");
            break;
        }
        match coordinator.run(shutdown).await {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                error!(target = %coordinator.feed(), "Run aborted: {}", e);
                aborted.push((coordinator.feed().to_string(), e));
            }
        }
    }

    (summaries, aborted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryTable;
    use crate::snapshot::SnapshotTimestamp;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const STATUS: &str = r#"{"last_updated": 1705327200, "ttl": 5, "version": "2.3",
        "data": {"stations": [
            {"station_id": "72", "num_bikes_available": 3, "is_renting": 1},
            {"station_id": "79", "num_bikes_available": 0, "is_renting": 0}
        ]}}"#;

    fn ts(stamp: &str) -> SnapshotTimestamp {
        SnapshotTimestamp::parse_stamp(stamp).unwrap()
    }

    async fn lake(files: &[(&str, &str)]) -> (TempDir, Arc<dyn SnapshotSource>) {
        let temp_dir = TempDir::new().unwrap();
        for (name, content) in files {
            let path = temp_dir.path().join("station_status").join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        let storage = StorageProvider::for_url_with_options(
            &temp_dir.path().display().to_string(),
            HashMap::new(),
        )
        .await
        .unwrap();
        let source = LakeSource::new(Arc::new(storage), "station_status", "status_");
        (temp_dir, Arc::new(source))
    }

    #[test]
    fn test_table_name() {
        assert_eq!(
            table_name("gs://bikes/warehouse/raw_station_status"),
            "raw_station_status"
        );
        assert_eq!(table_name("/tmp/raw_station_info/"), "raw_station_info");
    }

    #[tokio::test]
    async fn test_run_loads_delta() {
        let (_dir, source) = lake(&[
            ("date=2024-01-15/status_20240115_140000.json", STATUS),
            ("date=2024-01-15/status_20240115_141500.json", STATUS),
        ])
        .await;
        let table = Arc::new(MemoryTable::new("raw_station_status"));
        table.seed(ts("20240115_140000")).await;

        let coordinator = Coordinator::new(
            "station_status",
            FeedKind::Status,
            source,
            table.clone(),
            chrono_tz::UTC,
        );
        let summary = coordinator.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(summary.considered, 2);
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.skipped_duplicate, 1);
        assert_eq!(summary.rows_loaded, 2);
        assert!(!summary.cancelled);
        assert_eq!(table.snapshots().await.len(), 2);
    }

    #[tokio::test]
    async fn test_plan_writes_nothing() {
        let (_dir, source) = lake(&[
            ("status_20240115_140000.json", STATUS),
            ("status_latest.json", STATUS),
        ])
        .await;
        let table = Arc::new(MemoryTable::new("raw_station_status"));

        let coordinator = Coordinator::new(
            "station_status",
            FeedKind::Status,
            source,
            table.clone(),
            chrono_tz::UTC,
        );
        let plan = coordinator.plan().await.unwrap();

        assert_eq!(plan.pending.len(), 1);
        assert_eq!(plan.unparseable, vec!["station_status/status_latest.json"]);
        assert_eq!(table.append_calls().await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_attempts_nothing() {
        let (_dir, source) = lake(&[("status_20240115_140000.json", STATUS)]).await;
        let table = Arc::new(MemoryTable::new("raw_station_status"));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let coordinator = Coordinator::new(
            "station_status",
            FeedKind::Status,
            source,
            table.clone(),
            chrono_tz::UTC,
        );
        let summary = coordinator.run(&shutdown).await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.not_attempted, 1);
        assert_eq!(table.append_calls().await, 0);
    }
}
