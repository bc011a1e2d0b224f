//! Delta Lake snapshot table.
//!
//! Each snapshot becomes exactly one Parquet data file, committed in its own
//! Delta transaction, so a snapshot is either fully visible or absent. The
//! data file name carries the capture timestamp, which makes the table's
//! active file list the watermark.
//!
//! Concurrent writers are kept apart in two layers. Inside one process a
//! mutex serializes presence check and commit. Across processes every commit
//! carries a `Txn` action with a per-table app id; Delta's conflict checker
//! rejects a commit when a concurrent winner carried the same app id, and the
//! loser then re-reads the table and finds its snapshot already present.
//!
//! Rewriting data files (OPTIMIZE, compaction) would drop the timestamps
//! from the file list and must not be run against these tables.

use deltalake::DeltaTable;
use deltalake::arrow::datatypes::Schema;
use deltalake::kernel::transaction::CommitBuilder;
use deltalake::kernel::{Action, Add, Transaction};
use deltalake::operations::create::CreateBuilder;
use deltalake::protocol::{DeltaOperation, SaveMode};
use object_store::path::Path;
use snafu::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::parquet::encode_batch;
use super::{CommitOutcome, SnapshotTable};
use crate::emit;
use crate::error::{
    DeltaLakeSnafu, MissingColumnsSnafu, TableStorageSnafu, UploadSnafu, UrlParseSnafu,
    WarehouseError,
};
use crate::feed::{FeedKind, SnapshotRows};
use crate::metrics::events::{CommitCompleted, DuplicateCommitAvoided};
use crate::snapshot::SnapshotTimestamp;
use crate::storage::{StorageProvider, StorageProviderRef};

/// Prefix for the app id of every `Txn` action this loader writes.
pub const TXN_APP_ID_PREFIX: &str = "dockside:";

/// Ensure Delta Lake cloud storage handlers are registered.
///
/// This is idempotent - calling multiple times is safe.
pub fn ensure_handlers_registered() {
    deltalake::aws::register_handlers(None);
    deltalake::gcp::register_handlers(None);
}

/// Convert an Arrow schema to Delta struct fields.
fn arrow_schema_to_delta(schema: &Schema) -> Result<deltalake::kernel::StructType, WarehouseError> {
    use deltalake::kernel::engine::arrow_conversion::TryIntoKernel;
    use deltalake::kernel::{DataType as DeltaType, StructField, StructType};

    let fields: Vec<StructField> = schema
        .fields()
        .iter()
        .map(|field| {
            let delta_type: DeltaType = field
                .data_type()
                .try_into_kernel()
                .map_err(|source| WarehouseError::SchemaConversion { source })?;
            Ok(StructField::new(
                field.name(),
                delta_type,
                field.is_nullable(),
            ))
        })
        .collect::<Result<Vec<_>, WarehouseError>>()?;

    StructType::try_new(fields).map_err(|e| WarehouseError::StructType {
        message: e.to_string(),
    })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Create the Add action for one snapshot's data file.
fn create_add_action(path: &str, size: usize, rows: &SnapshotRows) -> Action {
    Action::Add(Add {
        path: path.to_string(),
        size: size as i64,
        partition_values: rows
            .partition_values
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect(),
        modification_time: now_millis(),
        data_change: true,
        ..Default::default()
    })
}

/// Create the Txn action that makes concurrent writers of one table conflict.
fn create_txn_action(table_name: &str, timestamp: SnapshotTimestamp) -> Action {
    Action::Txn(Transaction {
        app_id: format!("{TXN_APP_ID_PREFIX}{table_name}"),
        version: timestamp.as_datetime().timestamp(),
        last_updated: Some(now_millis()),
    })
}

/// Active data files of a table, split by whether their name carries a
/// snapshot timestamp.
#[derive(Debug, Default)]
struct ActiveFiles {
    snapshots: BTreeSet<SnapshotTimestamp>,
    foreign: Vec<String>,
}

fn active_files(table: &DeltaTable, name: &str) -> Result<ActiveFiles, WarehouseError> {
    let mut active = ActiveFiles::default();
    for uri in table.get_file_uris().context(DeltaLakeSnafu { table: name })? {
        match SnapshotTimestamp::from_data_file(&uri) {
            Some(timestamp) => {
                active.snapshots.insert(timestamp);
            }
            None => active.foreign.push(uri),
        }
    }
    Ok(active)
}

/// A Delta table holding one data file per snapshot.
pub struct DeltaSnapshotTable {
    name: String,
    kind: FeedKind,
    storage: StorageProviderRef,
    table: Mutex<DeltaTable>,
}

impl DeltaSnapshotTable {
    /// Open an existing table and check it has every column the loader writes.
    ///
    /// Never creates or alters the table.
    pub async fn open(
        name: impl Into<String>,
        kind: FeedKind,
        uri: &str,
        storage_options: HashMap<String, String>,
    ) -> Result<Self, WarehouseError> {
        let name = name.into();
        let storage = StorageProvider::for_url_with_options(uri, storage_options)
            .await
            .context(TableStorageSnafu { uri })?;
        let table = try_open_table(&storage, &name).await?;
        validate_columns(&table, &name, kind)?;

        Ok(Self {
            name,
            kind,
            storage: StorageProviderRef::new(storage),
            table: Mutex::new(table),
        })
    }

    /// Open the table, creating it with the feed's schema if it does not exist.
    pub async fn provision(
        name: impl Into<String>,
        kind: FeedKind,
        uri: &str,
        storage_options: HashMap<String, String>,
    ) -> Result<Self, WarehouseError> {
        let name = name.into();
        let storage = StorageProvider::for_url_with_options(uri, storage_options)
            .await
            .context(TableStorageSnafu { uri })?;

        let table = match try_open_table(&storage, &name).await {
            Ok(table) => table,
            Err(e) if e.is_table_not_found() => create_table(&storage, &name, kind).await?,
            Err(e) => return Err(e),
        };
        validate_columns(&table, &name, kind)?;

        Ok(Self {
            name,
            kind,
            storage: StorageProviderRef::new(storage),
            table: Mutex::new(table),
        })
    }

    /// Current table version, -1 when nothing has been committed.
    pub async fn version(&self) -> i64 {
        self.table.lock().await.version().unwrap_or(-1)
    }

    /// Count of active data files per snapshot; every value is 1 when the
    /// table holds each snapshot exactly once.
    pub async fn file_counts(&self) -> Result<HashMap<SnapshotTimestamp, usize>, WarehouseError> {
        let mut table = self.table.lock().await;
        table.load().await.context(DeltaLakeSnafu { table: &self.name })?;

        let mut counts = HashMap::new();
        for uri in table
            .get_file_uris()
            .context(DeltaLakeSnafu { table: &self.name })?
        {
            if let Some(timestamp) = SnapshotTimestamp::from_data_file(&uri) {
                *counts.entry(timestamp).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn discard_upload(&self, path: &Path) {
        if let Err(e) = self.storage.delete(path).await {
            warn!(target = %self.name, "Failed to remove unused data file {}: {}", path, e);
        }
    }

    async fn commit(
        &self,
        table: &mut DeltaTable,
        actions: Vec<Action>,
    ) -> Result<i64, WarehouseError> {
        let partition_by: Vec<String> = self
            .kind
            .partition_columns()
            .iter()
            .map(|c| c.to_string())
            .collect();

        let start = Instant::now();
        let version = CommitBuilder::default()
            .with_actions(actions)
            .build(
                Some(table.snapshot().context(DeltaLakeSnafu { table: &self.name })?),
                table.log_store(),
                DeltaOperation::Write {
                    mode: SaveMode::Append,
                    partition_by: (!partition_by.is_empty()).then_some(partition_by),
                    predicate: None,
                },
            )
            .await
            .context(DeltaLakeSnafu { table: &self.name })?
            .version;

        emit!(CommitCompleted {
            table: self.name.clone(),
            duration: start.elapsed(),
        });
        Ok(version)
    }

    /// Commit an uploaded data file, then settle the outcome against the
    /// reloaded table. The upload is removed unless this commit made it live.
    async fn commit_upload(
        &self,
        table: &mut DeltaTable,
        rows: &SnapshotRows,
        relative: &str,
        size: usize,
    ) -> Result<CommitOutcome, WarehouseError> {
        let path = Path::from(relative);
        let actions = vec![
            create_txn_action(&self.name, rows.timestamp),
            create_add_action(relative, size, rows),
        ];

        let committed = self.commit(table, actions).await;

        // Whatever happened, the table may have moved on.
        let reloaded = table.load().await;

        match committed {
            Ok(version) => {
                if let Err(e) = reloaded {
                    warn!(target = %self.name, "Reload after commit v{} failed: {}", version, e);
                }
                info!(
                    target = %self.name,
                    "Committed snapshot {} ({} rows) at version {}",
                    rows.timestamp,
                    rows.num_rows(),
                    version
                );
                Ok(CommitOutcome::Committed { version })
            }
            Err(commit_err) => {
                reloaded.context(DeltaLakeSnafu { table: &self.name })?;
                let active = active_files(table, &self.name)?;
                if active.snapshots.contains(&rows.timestamp) {
                    info!(
                        target = %self.name,
                        "Snapshot {} was committed by a concurrent writer",
                        rows.timestamp
                    );
                    emit!(DuplicateCommitAvoided {
                        table: self.name.clone(),
                    });
                    self.discard_upload(&path).await;
                    return Ok(CommitOutcome::AlreadyPresent);
                }
                self.discard_upload(&path).await;
                Err(commit_err)
            }
        }
    }
}

#[async_trait::async_trait]
impl SnapshotTable for DeltaSnapshotTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn committed_snapshots(&self) -> Result<BTreeSet<SnapshotTimestamp>, WarehouseError> {
        let mut table = self.table.lock().await;
        table.load().await.context(DeltaLakeSnafu { table: &self.name })?;
        let active = active_files(&table, &self.name)?;
        if let Some(first) = active.foreign.first() {
            warn!(
                target = %self.name,
                "Ignoring {} data file(s) not written by this loader, first {}",
                active.foreign.len(),
                first
            );
        }
        Ok(active.snapshots)
    }

    async fn append_snapshot(&self, rows: &SnapshotRows) -> Result<CommitOutcome, WarehouseError> {
        let bytes = encode_batch(&rows.batch)?;
        let size = bytes.len();

        let file_name = rows
            .timestamp
            .data_file_name(&Uuid::new_v4().simple().to_string());
        let relative = match rows.partition_dir() {
            dir if dir.is_empty() => file_name,
            dir => format!("{dir}/{file_name}"),
        };
        let path = Path::from(relative.as_str());

        let mut table = self.table.lock().await;
        table.load().await.context(DeltaLakeSnafu { table: &self.name })?;
        let active = active_files(&table, &self.name)?;
        if active.snapshots.contains(&rows.timestamp) {
            debug!(target = %self.name, "Snapshot {} already committed", rows.timestamp);
            emit!(DuplicateCommitAvoided {
                table: self.name.clone(),
            });
            return Ok(CommitOutcome::AlreadyPresent);
        }

        self.storage
            .put(&path, bytes)
            .await
            .context(UploadSnafu { path: &relative })?;

        self.commit_upload(&mut table, rows, &relative, size).await
    }
}

/// Try to open an existing Delta Lake table.
pub async fn try_open_table(
    storage: &StorageProvider,
    table_name: &str,
) -> Result<DeltaTable, WarehouseError> {
    ensure_handlers_registered();

    let table_url = storage.config().table_url();
    let parsed_url = Url::parse(&table_url).context(UrlParseSnafu { url: &table_url })?;

    let table =
        deltalake::open_table_with_storage_options(parsed_url, storage.storage_options().clone())
            .await
            .context(DeltaLakeSnafu { table: table_name })?;

    info!(
        target = %table_name,
        "Opened Delta table at version {}",
        table.version().unwrap_or(-1)
    );
    Ok(table)
}

async fn create_table(
    storage: &StorageProvider,
    table_name: &str,
    kind: FeedKind,
) -> Result<DeltaTable, WarehouseError> {
    let table_url = storage.config().table_url();
    info!(target = %table_name, "Creating Delta table at {}", table_url);

    let mut builder = CreateBuilder::new()
        .with_location(&table_url)
        .with_table_name(table_name)
        .with_columns(arrow_schema_to_delta(&kind.table_schema())?.fields().cloned())
        .with_storage_options(storage.storage_options().clone());

    if !kind.partition_columns().is_empty() {
        builder = builder.with_partition_columns(kind.partition_columns().iter().copied());
    }

    builder.await.context(DeltaLakeSnafu { table: table_name })
}

fn validate_columns(table: &DeltaTable, name: &str, kind: FeedKind) -> Result<(), WarehouseError> {
    let snapshot = table.snapshot().context(DeltaLakeSnafu { table: name })?;
    let schema = snapshot.schema();
    let present: BTreeSet<String> = schema.fields().map(|f| f.name().to_string()).collect();

    let missing: Vec<String> = kind
        .table_schema()
        .fields()
        .iter()
        .map(|f| f.name().to_string())
        .filter(|name| !present.contains(name))
        .collect();

    ensure!(
        missing.is_empty(),
        MissingColumnsSnafu {
            table: name,
            columns: missing
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rows(kind: FeedKind, stamp: &str) -> SnapshotRows {
        kind.parse_snapshot(
            SnapshotTimestamp::parse_stamp(stamp).unwrap(),
            br#"{"last_updated": 1, "ttl": 5, "version": "2.3",
                "data": {"stations": [{"station_id": "a"}, {"station_id": "b"}]}}"#,
            &chrono_tz::UTC,
        )
        .unwrap()
    }

    #[test]
    fn test_create_add_action_carries_partition() {
        let rows = rows(FeedKind::Status, "20240115_140000");
        match create_add_action("date_partition=2024-01-15/x.parquet", 1024, &rows) {
            Action::Add(add) => {
                assert_eq!(add.size, 1024);
                assert!(add.data_change);
                assert_eq!(
                    add.partition_values.get("date_partition"),
                    Some(&Some("2024-01-15".to_string()))
                );
            }
            _ => panic!("Expected Add action"),
        }
    }

    #[test]
    fn test_txn_app_id_is_per_table() {
        let ts = SnapshotTimestamp::parse_stamp("20240115_140000").unwrap();
        match create_txn_action("raw_station_status", ts) {
            Action::Txn(txn) => {
                assert_eq!(txn.app_id, "dockside:raw_station_status");
                assert_eq!(txn.version, 1705327200);
            }
            _ => panic!("Expected Txn action"),
        }
    }

    #[tokio::test]
    async fn test_open_missing_table_fails() {
        let temp_dir = TempDir::new().unwrap();
        let uri = temp_dir.path().join("raw_station_status").display().to_string();

        let result =
            DeltaSnapshotTable::open("raw_station_status", FeedKind::Status, &uri, HashMap::new())
                .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_append_and_watermark() {
        let temp_dir = TempDir::new().unwrap();
        let uri = temp_dir.path().join("raw_station_status").display().to_string();
        let table = DeltaSnapshotTable::provision(
            "raw_station_status",
            FeedKind::Status,
            &uri,
            HashMap::new(),
        )
        .await
        .unwrap();

        assert!(table.committed_snapshots().await.unwrap().is_empty());

        let first = rows(FeedKind::Status, "20240115_140000");
        let outcome = table.append_snapshot(&first).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));

        assert_eq!(
            table.append_snapshot(&first).await.unwrap(),
            CommitOutcome::AlreadyPresent
        );

        let watermark = table.committed_snapshots().await.unwrap();
        assert_eq!(watermark.into_iter().collect::<Vec<_>>(), vec![first.timestamp]);

        let partition_dir = temp_dir
            .path()
            .join("raw_station_status/date_partition=2024-01-15");
        let files: Vec<_> = std::fs::read_dir(partition_dir).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_sees_committed_state() {
        let temp_dir = TempDir::new().unwrap();
        let uri = temp_dir.path().join("raw_station_info").display().to_string();
        let table =
            DeltaSnapshotTable::provision("raw_station_info", FeedKind::Info, &uri, HashMap::new())
                .await
                .unwrap();
        table
            .append_snapshot(&rows(FeedKind::Info, "20240115_140000"))
            .await
            .unwrap();
        drop(table);

        let reopened =
            DeltaSnapshotTable::open("raw_station_info", FeedKind::Info, &uri, HashMap::new())
                .await
                .unwrap();
        assert_eq!(reopened.committed_snapshots().await.unwrap().len(), 1);
        assert_eq!(reopened.version().await, 1);
    }

    #[tokio::test]
    async fn test_open_rejects_wrong_schema() {
        let temp_dir = TempDir::new().unwrap();
        let uri = temp_dir.path().join("t").display().to_string();

        // An info-shaped table cannot take status rows
        DeltaSnapshotTable::provision("t", FeedKind::Info, &uri, HashMap::new())
            .await
            .unwrap();
        let err = DeltaSnapshotTable::open("t", FeedKind::Status, &uri, HashMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WarehouseError::MissingColumns { .. }));
    }

    #[tokio::test]
    async fn test_foreign_files_stay_out_of_watermark() {
        let temp_dir = TempDir::new().unwrap();
        let uri = temp_dir.path().join("raw_station_status").display().to_string();
        let table = DeltaSnapshotTable::provision(
            "raw_station_status",
            FeedKind::Status,
            &uri,
            HashMap::new(),
        )
        .await
        .unwrap();

        let first = rows(FeedKind::Status, "20240115_140000");
        table.append_snapshot(&first).await.unwrap();

        {
            let mut inner = table.table.lock().await;
            let foreign = create_add_action(
                "date_partition=2024-01-15/part-00000-c000.snappy.parquet",
                10,
                &first,
            );
            table.commit(&mut inner, vec![foreign]).await.unwrap();
            inner.load().await.unwrap();
            let active = active_files(&inner, "raw_station_status").unwrap();
            assert_eq!(active.foreign.len(), 1);
            assert_eq!(active.snapshots.len(), 1);
        }

        assert_eq!(
            table.committed_snapshots().await.unwrap(),
            BTreeSet::from([first.timestamp])
        );
        let second = rows(FeedKind::Status, "20240115_141500");
        assert!(matches!(
            table.append_snapshot(&second).await.unwrap(),
            CommitOutcome::Committed { .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_commit_removes_upload() {
        use crate::retry::{Classify, ErrorClass};

        let temp_dir = TempDir::new().unwrap();
        let uri = temp_dir.path().join("raw_station_status").display().to_string();
        let table = DeltaSnapshotTable::provision(
            "raw_station_status",
            FeedKind::Status,
            &uri,
            HashMap::new(),
        )
        .await
        .unwrap();
        let mut stale = try_open_table(&table.storage, "raw_station_status")
            .await
            .unwrap();

        // Another writer takes the next version with the same app id
        table
            .append_snapshot(&rows(FeedKind::Status, "20240115_140000"))
            .await
            .unwrap();

        let late = rows(FeedKind::Status, "20240115_141500");
        let relative = format!(
            "{}/{}",
            late.partition_dir(),
            late.timestamp.data_file_name("late")
        );
        let bytes = encode_batch(&late.batch).unwrap();
        let size = bytes.len();
        table
            .storage
            .put(&Path::from(relative.as_str()), bytes)
            .await
            .unwrap();
        let uploaded = temp_dir.path().join("raw_station_status").join(&relative);
        assert!(uploaded.exists());

        let err = table
            .commit_upload(&mut stale, &late, &relative, size)
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(!uploaded.exists());
        assert_eq!(
            table.committed_snapshots().await.unwrap().into_iter().collect::<Vec<_>>(),
            vec![SnapshotTimestamp::parse_stamp("20240115_140000").unwrap()]
        );
    }
}
