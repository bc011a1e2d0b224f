//! Snapshot store adapter.
//!
//! Lists the immutable, timestamp-named snapshot objects a capture process
//! leaves in the lake, and fetches their bytes. The lake is never written.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::snapshot::{SOURCE_EXTENSION, SnapshotTimestamp};
use crate::storage::StorageProviderRef;

/// One captured snapshot in the lake.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SnapshotObject {
    pub timestamp: SnapshotTimestamp,
    pub location: String,
}

/// Result of listing a feed's snapshots.
#[derive(Debug, Default)]
pub struct Listing {
    /// Parseable snapshots, ascending by timestamp, one per timestamp.
    pub candidates: Vec<SnapshotObject>,
    /// `.json` objects whose names carry no timestamp.
    pub unparseable: Vec<String>,
}

/// Read-only access to captured snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Human-readable location for logs and errors.
    fn describe(&self) -> String;

    async fn list(&self) -> Result<Listing, StorageError>;

    async fn fetch(&self, object: &SnapshotObject) -> Result<Bytes, StorageError>;
}

/// Snapshots stored under a prefix of an object store.
pub struct LakeSource {
    storage: StorageProviderRef,
    prefix: String,
    file_prefix: String,
}

impl LakeSource {
    pub fn new(
        storage: StorageProviderRef,
        prefix: impl Into<String>,
        file_prefix: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            file_prefix: file_prefix.into(),
        }
    }
}

/// Sort object names into candidates and unparseable names.
///
/// When two objects share a timestamp the lexicographically first wins.
pub fn classify_objects<I>(names: I, file_prefix: &str) -> Listing
where
    I: IntoIterator<Item = String>,
{
    let mut by_timestamp: BTreeMap<SnapshotTimestamp, String> = BTreeMap::new();
    let mut unparseable = Vec::new();
    let mut ignored = 0usize;

    for name in names {
        if !name.ends_with(SOURCE_EXTENSION) {
            ignored += 1;
            continue;
        }
        match SnapshotTimestamp::from_file_name(&name, file_prefix, SOURCE_EXTENSION) {
            Some(timestamp) => match by_timestamp.get_mut(&timestamp) {
                Some(existing) => {
                    warn!(
                        "Snapshot {} appears at both {} and {}, keeping the first",
                        timestamp, existing, name
                    );
                    if name < *existing {
                        *existing = name;
                    }
                }
                None => {
                    by_timestamp.insert(timestamp, name);
                }
            },
            None => unparseable.push(name),
        }
    }

    if ignored > 0 {
        debug!("Ignored {} non-{} objects", ignored, SOURCE_EXTENSION);
    }
    unparseable.sort();

    Listing {
        candidates: by_timestamp
            .into_iter()
            .map(|(timestamp, location)| SnapshotObject {
                timestamp,
                location,
            })
            .collect(),
        unparseable,
    }
}

#[async_trait]
impl SnapshotSource for LakeSource {
    fn describe(&self) -> String {
        if self.prefix.is_empty() {
            self.storage.canonical_url().to_string()
        } else {
            format!("{}/{}", self.storage.canonical_url(), self.prefix)
        }
    }

    async fn list(&self) -> Result<Listing, StorageError> {
        let names: Vec<String> = self
            .storage
            .list_with_prefix(&self.prefix)
            .map_ok(|path| path.to_string())
            .try_collect()
            .await?;

        debug!("Listed {} objects under {}", names.len(), self.describe());
        Ok(classify_objects(names, &self.file_prefix))
    }

    async fn fetch(&self, object: &SnapshotObject) -> Result<Bytes, StorageError> {
        self.storage.get(&Path::from(object.location.as_str())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageProvider;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_classify_orders_and_reports() {
        let listing = classify_objects(
            [
                "date=2024-01-15/status_20240115_143000.json",
                "date=2024-01-15/status_20240115_140000.json",
                "date=2024-01-15/status_latest.json",
                "date=2024-01-15/_SUCCESS",
                "date=2024-01-15/status_20240115_141500.json",
            ]
            .map(String::from),
            "status_",
        );

        let stamps: Vec<_> = listing
            .candidates
            .iter()
            .map(|c| c.timestamp.stamp())
            .collect();
        assert_eq!(
            stamps,
            vec!["20240115_140000", "20240115_141500", "20240115_143000"]
        );
        assert_eq!(
            listing.unparseable,
            vec!["date=2024-01-15/status_latest.json"]
        );
    }

    #[test]
    fn test_classify_deduplicates_timestamps() {
        let listing = classify_objects(
            [
                "date=2024-01-16/status_20240115_140000.json",
                "date=2024-01-15/status_20240115_140000.json",
            ]
            .map(String::from),
            "status_",
        );
        assert_eq!(listing.candidates.len(), 1);
        assert_eq!(
            listing.candidates[0].location,
            "date=2024-01-15/status_20240115_140000.json"
        );
    }

    #[tokio::test]
    async fn test_lake_source_lists_and_fetches() {
        let temp_dir = TempDir::new().unwrap();
        let day = temp_dir.path().join("station_status/date=2024-01-15");
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("status_20240115_140000.json"), b"{\"a\":1}").unwrap();
        std::fs::write(day.join("notes.txt"), b"ignore me").unwrap();

        let storage = StorageProvider::for_url_with_options(
            &temp_dir.path().display().to_string(),
            HashMap::new(),
        )
        .await
        .unwrap();
        let source = LakeSource::new(Arc::new(storage), "station_status", "status_");

        let listing = source.list().await.unwrap();
        assert_eq!(listing.candidates.len(), 1);
        assert!(listing.unparseable.is_empty());

        let bytes = source.fetch(&listing.candidates[0]).await.unwrap();
        assert_eq!(bytes.as_ref(), b"{\"a\":1}");
    }
}
