//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a run. Events
//! implement [`InternalEvent`], which records the matching Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::retry::ErrorClass;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Per-file outcomes
// ============================================================================

/// Outcome of one snapshot file.
#[derive(Debug, Clone, Copy)]
pub enum FileStatus {
    Loaded,
    SkippedDuplicate,
    Failed,
    NotAttempted,
}

impl FileStatus {
    fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Loaded => "loaded",
            FileStatus::SkippedDuplicate => "skipped_duplicate",
            FileStatus::Failed => "failed",
            FileStatus::NotAttempted => "not_attempted",
        }
    }
}

/// Event emitted when a snapshot file reaches a final status.
pub struct SnapshotFileProcessed {
    pub feed: String,
    pub status: FileStatus,
}

impl InternalEvent for SnapshotFileProcessed {
    fn emit(self) {
        trace!(feed = %self.feed, status = self.status.as_str(), "Snapshot file processed");
        counter!(
            "dockside_snapshot_files_total",
            "feed" => self.feed,
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a file load gives up.
pub struct SnapshotFileFailed {
    pub feed: String,
    pub class: ErrorClass,
}

impl InternalEvent for SnapshotFileFailed {
    fn emit(self) {
        trace!(feed = %self.feed, class = self.class.as_str(), "Snapshot file failed");
        counter!(
            "dockside_snapshot_failures_total",
            "feed" => self.feed,
            "class" => self.class.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when rows are committed to a table.
pub struct RowsCommitted {
    pub feed: String,
    pub count: u64,
}

impl InternalEvent for RowsCommitted {
    fn emit(self) {
        trace!(feed = %self.feed, count = self.count, "Rows committed");
        counter!("dockside_rows_committed_total", "feed" => self.feed).increment(self.count);
    }
}

/// Event emitted when station records are dropped for missing identifiers.
pub struct RecordsDropped {
    pub feed: String,
    pub count: u64,
}

impl InternalEvent for RecordsDropped {
    fn emit(self) {
        if self.count == 0 {
            return;
        }
        trace!(feed = %self.feed, count = self.count, "Records dropped");
        counter!("dockside_records_dropped_total", "feed" => self.feed).increment(self.count);
    }
}

/// Event emitted for lake objects whose names carry no capture timestamp.
pub struct UnparseableObjects {
    pub feed: String,
    pub count: u64,
}

impl InternalEvent for UnparseableObjects {
    fn emit(self) {
        trace!(feed = %self.feed, count = self.count, "Unparseable objects");
        counter!("dockside_unparseable_objects_total", "feed" => self.feed)
            .increment(self.count);
    }
}

/// Event emitted before an operation is retried.
pub struct RetryAttempted {
    pub operation: String,
}

impl InternalEvent for RetryAttempted {
    fn emit(self) {
        trace!(operation = %self.operation, "Retry attempted");
        counter!("dockside_retries_total", "operation" => self.operation).increment(1);
    }
}

/// Event emitted when a commit finds its snapshot already present.
pub struct DuplicateCommitAvoided {
    pub table: String,
}

impl InternalEvent for DuplicateCommitAvoided {
    fn emit(self) {
        trace!(table = %self.table, "Duplicate commit avoided");
        counter!("dockside_duplicate_commits_avoided_total", "table" => self.table).increment(1);
    }
}

// ============================================================================
// Timings and gauges
// ============================================================================

/// Event emitted when a table commit completes.
pub struct CommitCompleted {
    pub table: String,
    pub duration: Duration,
}

impl InternalEvent for CommitCompleted {
    fn emit(self) {
        trace!(
            table = %self.table,
            duration_ms = self.duration.as_millis(),
            "Commit completed"
        );
        histogram!("dockside_commit_duration_seconds", "table" => self.table)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when the watermark has been resolved.
pub struct WatermarkResolved {
    pub feed: String,
    pub committed: usize,
    pub pending: usize,
}

impl InternalEvent for WatermarkResolved {
    fn emit(self) {
        trace!(
            feed = %self.feed,
            committed = self.committed,
            pending = self.pending,
            "Watermark resolved"
        );
        gauge!("dockside_committed_snapshots", "feed" => self.feed.clone())
            .set(self.committed as f64);
        gauge!("dockside_pending_snapshots", "feed" => self.feed).set(self.pending as f64);
    }
}

/// Event emitted when a run finishes, cancelled or not.
pub struct RunCompleted {
    pub feed: String,
    pub duration: Duration,
    pub cancelled: bool,
}

impl InternalEvent for RunCompleted {
    fn emit(self) {
        let result = if self.cancelled { "cancelled" } else { "completed" };
        trace!(
            feed = %self.feed,
            result,
            duration_ms = self.duration.as_millis(),
            "Run completed"
        );
        counter!("dockside_runs_total", "feed" => self.feed.clone(), "result" => result)
            .increment(1);
        histogram!("dockside_run_duration_seconds", "feed" => self.feed)
            .record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    List,
    Delete,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::List => "list",
            StorageOperation::Delete => "delete",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "dockside_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        histogram!(
            "dockside_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
