//! Snapshot feeds and their row shapes.
//!
//! A feed kind fixes three things: the table schema, the partition columns,
//! and how a station record maps to a row. Parsing produces a
//! [`SnapshotRows`]: one Arrow batch holding every row of one snapshot,
//! ready for a single atomic append.

pub mod document;

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use chrono_tz::Tz;
use deltalake::arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use deltalake::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::error::{BatchBuildSnafu, FeedError};
use crate::snapshot::SnapshotTimestamp;
use document::{Envelope, boolean, float, int, station_id, string};

pub const DATA_FETCHED_AT: &str = "data_fetched_at";
pub const DATE_PARTITION: &str = "date_partition";

/// Which feed a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    /// Per-station availability, partitioned by capture date.
    Status,
    /// Station reference data, unpartitioned.
    Info,
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

fn metadata_fields() -> [Field; 4] {
    [
        Field::new("last_updated", DataType::Int64, true),
        Field::new("ttl", DataType::Int64, true),
        Field::new("version", DataType::Utf8, true),
        Field::new(DATA_FETCHED_AT, timestamp_type(), false),
    ]
}

static STATUS_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    let mut fields = vec![
        Field::new("station_id", DataType::Utf8, false),
        Field::new("num_bikes_available", DataType::Int64, true),
        Field::new("num_ebikes_available", DataType::Int64, true),
        Field::new("num_bikes_disabled", DataType::Int64, true),
        Field::new("num_docks_available", DataType::Int64, true),
        Field::new("num_docks_disabled", DataType::Int64, true),
        Field::new("is_installed", DataType::Boolean, true),
        Field::new("is_renting", DataType::Boolean, true),
        Field::new("is_returning", DataType::Boolean, true),
        Field::new("last_reported", DataType::Int64, true),
    ];
    fields.extend(metadata_fields());
    fields.push(Field::new(DATE_PARTITION, DataType::Utf8, false));
    Arc::new(Schema::new(fields))
});

static INFO_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    let mut fields = vec![
        Field::new("station_id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("short_name", DataType::Utf8, true),
        Field::new("region_id", DataType::Utf8, true),
        Field::new("lat", DataType::Float64, true),
        Field::new("lon", DataType::Float64, true),
        Field::new("capacity", DataType::Int64, true),
    ];
    fields.extend(metadata_fields());
    Arc::new(Schema::new(fields))
});

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Status => "status",
            FeedKind::Info => "info",
        }
    }

    pub fn default_file_prefix(&self) -> &'static str {
        match self {
            FeedKind::Status => "status_",
            FeedKind::Info => "info_",
        }
    }

    /// Full table schema, partition columns included.
    pub fn table_schema(&self) -> SchemaRef {
        match self {
            FeedKind::Status => STATUS_SCHEMA.clone(),
            FeedKind::Info => INFO_SCHEMA.clone(),
        }
    }

    pub fn partition_columns(&self) -> &'static [&'static str] {
        match self {
            FeedKind::Status => &[DATE_PARTITION],
            FeedKind::Info => &[],
        }
    }

    /// Schema of the data files: the table schema minus partition columns,
    /// whose values live in the commit instead.
    pub fn file_schema(&self) -> SchemaRef {
        let table = self.table_schema();
        let partitions = self.partition_columns();
        let fields: Vec<Field> = table
            .fields()
            .iter()
            .filter(|f| !partitions.contains(&f.name().as_str()))
            .map(|f| f.as_ref().clone())
            .collect();
        Arc::new(Schema::new(fields))
    }

    /// Parse one snapshot payload into rows.
    ///
    /// Records without a `station_id` are dropped and counted. A payload that
    /// is not a JSON object with a `data.stations` array is rejected.
    pub fn parse_snapshot(
        &self,
        timestamp: SnapshotTimestamp,
        payload: &[u8],
        tz: &Tz,
    ) -> Result<SnapshotRows, FeedError> {
        let envelope = Envelope::parse(payload)?;

        let mut dropped_records = 0;
        let records: Vec<&Map<String, Value>> = envelope
            .stations
            .iter()
            .filter_map(|value| match value.as_object() {
                Some(record) if station_id(record).is_some() => Some(record),
                _ => {
                    dropped_records += 1;
                    None
                }
            })
            .collect();

        let mut columns = match self {
            FeedKind::Status => status_columns(&records),
            FeedKind::Info => info_columns(&records),
        };
        columns.extend(metadata_columns(&envelope, timestamp, records.len()));

        let batch = RecordBatch::try_new(self.file_schema(), columns).context(BatchBuildSnafu)?;

        let mut partition_values = BTreeMap::new();
        if self.partition_columns().contains(&DATE_PARTITION) {
            partition_values.insert(
                DATE_PARTITION.to_string(),
                timestamp.local_date(tz).format("%Y-%m-%d").to_string(),
            );
        }

        Ok(SnapshotRows {
            timestamp,
            batch,
            partition_values,
            dropped_records,
        })
    }
}

/// Every row of one snapshot, plus where it lands.
#[derive(Debug, Clone)]
pub struct SnapshotRows {
    pub timestamp: SnapshotTimestamp,
    pub batch: RecordBatch,
    pub partition_values: BTreeMap<String, String>,
    pub dropped_records: usize,
}

impl SnapshotRows {
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Hive-style directory for the data file, empty when unpartitioned.
    pub fn partition_dir(&self) -> String {
        self.partition_values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("/")
    }
}

fn ids(records: &[&Map<String, Value>]) -> ArrayRef {
    Arc::new(StringArray::from_iter(
        records.iter().map(|r| station_id(r)),
    ))
}

fn ints(records: &[&Map<String, Value>], key: &str) -> ArrayRef {
    Arc::new(Int64Array::from_iter(records.iter().map(|r| int(r, key))))
}

fn bools(records: &[&Map<String, Value>], key: &str) -> ArrayRef {
    Arc::new(BooleanArray::from_iter(
        records.iter().map(|r| boolean(r, key)),
    ))
}

fn floats(records: &[&Map<String, Value>], key: &str) -> ArrayRef {
    Arc::new(Float64Array::from_iter(
        records.iter().map(|r| float(r, key)),
    ))
}

fn strings(records: &[&Map<String, Value>], key: &str) -> ArrayRef {
    Arc::new(StringArray::from_iter(
        records.iter().map(|r| string(r, key)),
    ))
}

fn status_columns(records: &[&Map<String, Value>]) -> Vec<ArrayRef> {
    vec![
        ids(records),
        ints(records, "num_bikes_available"),
        ints(records, "num_ebikes_available"),
        ints(records, "num_bikes_disabled"),
        ints(records, "num_docks_available"),
        ints(records, "num_docks_disabled"),
        bools(records, "is_installed"),
        bools(records, "is_renting"),
        bools(records, "is_returning"),
        ints(records, "last_reported"),
    ]
}

fn info_columns(records: &[&Map<String, Value>]) -> Vec<ArrayRef> {
    vec![
        ids(records),
        strings(records, "name"),
        strings(records, "short_name"),
        strings(records, "region_id"),
        floats(records, "lat"),
        floats(records, "lon"),
        ints(records, "capacity"),
    ]
}

fn metadata_columns(
    envelope: &Envelope,
    timestamp: SnapshotTimestamp,
    rows: usize,
) -> Vec<ArrayRef> {
    vec![
        Arc::new(Int64Array::from(vec![envelope.last_updated; rows])),
        Arc::new(Int64Array::from(vec![envelope.ttl; rows])),
        Arc::new(StringArray::from(vec![envelope.version.clone(); rows])),
        Arc::new(
            TimestampMicrosecondArray::from(vec![timestamp.timestamp_micros(); rows])
                .with_timezone("UTC"),
        ),
    ]
}
