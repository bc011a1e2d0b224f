//! Per-file results and the run summary built from them.

use serde::Serialize;
use tracing::{info, warn};

use crate::retry::ErrorClass;
use crate::snapshot::SnapshotTimestamp;
use crate::source::SnapshotObject;

/// Final status of one candidate file in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loaded,
    SkippedDuplicate,
    Failed,
    /// The run was cancelled before this file started.
    NotAttempted,
}

/// Why a file failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadFailure {
    pub class: ErrorClass,
    pub message: String,
}

/// Outcome of one candidate file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub timestamp: SnapshotTimestamp,
    pub location: String,
    pub status: LoadStatus,
    pub rows: usize,
    pub dropped_records: usize,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LoadFailure>,
}

impl LoadResult {
    fn new(object: SnapshotObject, status: LoadStatus, attempts: u32) -> Self {
        Self {
            timestamp: object.timestamp,
            location: object.location,
            status,
            rows: 0,
            dropped_records: 0,
            attempts,
            error: None,
        }
    }

    pub fn loaded(object: SnapshotObject, rows: usize, dropped_records: usize, attempts: u32) -> Self {
        Self {
            rows,
            dropped_records,
            ..Self::new(object, LoadStatus::Loaded, attempts)
        }
    }

    pub fn skipped(object: SnapshotObject, attempts: u32) -> Self {
        Self::new(object, LoadStatus::SkippedDuplicate, attempts)
    }

    pub fn failed(object: SnapshotObject, class: ErrorClass, message: String, attempts: u32) -> Self {
        Self {
            error: Some(LoadFailure { class, message }),
            ..Self::new(object, LoadStatus::Failed, attempts)
        }
    }

    pub fn not_attempted(object: SnapshotObject) -> Self {
        Self::new(object, LoadStatus::NotAttempted, 0)
    }
}

/// Counts and failure details for one run of one feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub feed: String,
    pub considered: usize,
    pub loaded: usize,
    pub skipped_duplicate: usize,
    pub failed: usize,
    pub not_attempted: usize,
    pub rows_loaded: usize,
    pub records_dropped: usize,
    pub unparseable: Vec<String>,
    pub failures: Vec<LoadResult>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn new(feed: impl Into<String>) -> Self {
        Self {
            feed: feed.into(),
            ..Self::default()
        }
    }

    /// Fold one file's result into the counts.
    pub fn record(&mut self, result: LoadResult) {
        match result.status {
            LoadStatus::Loaded => {
                self.loaded += 1;
                self.rows_loaded += result.rows;
                self.records_dropped += result.dropped_records;
            }
            LoadStatus::SkippedDuplicate => self.skipped_duplicate += 1,
            LoadStatus::NotAttempted => self.not_attempted += 1,
            LoadStatus::Failed => {
                self.failed += 1;
                self.failures.push(result);
            }
        }
    }

    pub fn log(&self) {
        info!(
            target = %self.feed,
            "Run {}: {} considered, {} loaded, {} skipped, {} failed, {} not attempted, \
             {} rows, {} records dropped, {} unparseable",
            if self.cancelled { "cancelled" } else { "complete" },
            self.considered,
            self.loaded,
            self.skipped_duplicate,
            self.failed,
            self.not_attempted,
            self.rows_loaded,
            self.records_dropped,
            self.unparseable.len()
        );
        for failure in &self.failures {
            if let Some(error) = &failure.error {
                warn!(
                    target = %self.feed,
                    "  {} [{}] after {} attempt(s): {}",
                    failure.location,
                    error.class.as_str(),
                    failure.attempts,
                    error.message
                );
            }
        }
    }
}
