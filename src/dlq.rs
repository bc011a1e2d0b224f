//! Dead Letter Queue for failed snapshot files.
//!
//! Records files that failed a run to a configurable location for later
//! inspection. Each run of each feed writes one NDJSON object.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::info;
use uuid::Uuid;

use crate::config::ErrorHandlingConfig;
use crate::error::{DlqError, DlqSerializeSnafu, DlqStorageSnafu, DlqWriteSnafu};
use crate::pipeline::LoadResult;
use crate::retry::ErrorClass;
use crate::snapshot::SnapshotTimestamp;
use crate::storage::StorageProvider;

/// A record representing a failed file in the DLQ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFile {
    /// Lake location of the snapshot file.
    pub path: String,
    /// Capture timestamp of the snapshot.
    pub timestamp: SnapshotTimestamp,
    pub class: ErrorClass,
    pub error: String,
    pub attempts: u32,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl FailedFile {
    /// Build a record from a failed load result. Returns `None` for any other status.
    pub fn from_result(result: &LoadResult, recorded_at: DateTime<Utc>) -> Option<Self> {
        let error = result.error.as_ref()?;
        Some(Self {
            path: result.location.clone(),
            timestamp: result.timestamp,
            class: error.class,
            error: error.message.clone(),
            attempts: result.attempts,
            recorded_at,
        })
    }
}

/// Dead Letter Queue for recording failed files.
pub struct DeadLetterQueue {
    storage: StorageProvider,
    location: String,
}

impl DeadLetterQueue {
    /// Create a new DLQ from configuration.
    ///
    /// Returns `None` if no DLQ path is configured.
    pub async fn from_config(config: &ErrorHandlingConfig) -> Result<Option<Self>, DlqError> {
        let Some(dlq_path) = &config.dlq_path else {
            return Ok(None);
        };

        let storage =
            StorageProvider::for_url_with_options(dlq_path, config.dlq_storage_options.clone())
                .await
                .context(DlqStorageSnafu)?;

        info!("DLQ enabled: {}", dlq_path);
        Ok(Some(Self {
            storage,
            location: dlq_path.clone(),
        }))
    }

    /// Object name for one feed's run. `run_id` keeps runs started in the
    /// same second apart.
    pub fn file_name(feed: &str, run_started: DateTime<Utc>, run_id: &str) -> String {
        format!(
            "failed_{}_{}-{}.ndjson",
            feed,
            run_started.format("%Y%m%d_%H%M%S"),
            run_id
        )
    }

    /// Write a run's failed files. Writes nothing when there are none.
    ///
    /// Every call writes a new object. Returns its name.
    pub async fn write_run(
        &self,
        feed: &str,
        run_started: DateTime<Utc>,
        records: &[FailedFile],
    ) -> Result<Option<String>, DlqError> {
        if records.is_empty() {
            return Ok(None);
        }

        let mut ndjson = String::new();
        for record in records {
            let line = serde_json::to_string(record).context(DlqSerializeSnafu)?;
            ndjson.push_str(&line);
            ndjson.push('\n');
        }

        let run_id = Uuid::new_v4().simple().to_string();
        let name = Self::file_name(feed, run_started, &run_id);
        self.storage
            .put(&Path::from(name.as_str()), Bytes::from(ndjson))
            .await
            .context(DlqWriteSnafu)?;

        info!(
            target = %feed,
            "Recorded {} failed file(s) to {}/{}",
            records.len(),
            self.location,
            name
        );
        Ok(Some(name))
    }
}
