//! Capture timestamps and the file names that encode them.
//!
//! A capture timestamp is the identity of a snapshot everywhere in the
//! system: in lake object names (`status_20240115_143000.json`), in the data
//! files committed to the warehouse
//! (`snapshot_20240115_143000-<attempt>.parquet`), and in the watermark.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `YYYYMMDD_HHMMSS`, always UTC.
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const STAMP_LEN: usize = 15;

/// Prefix of data files committed to a target table.
pub const DATA_FILE_PREFIX: &str = "snapshot_";
pub const DATA_FILE_EXTENSION: &str = ".parquet";
pub const SOURCE_EXTENSION: &str = ".json";

/// Identity of one captured snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotTimestamp(DateTime<Utc>);

impl SnapshotTimestamp {
    /// Parse a bare `YYYYMMDD_HHMMSS` stamp.
    pub fn parse_stamp(stamp: &str) -> Option<Self> {
        if stamp.len() != STAMP_LEN {
            return None;
        }
        NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
            .ok()
            .map(|naive| Self(Utc.from_utc_datetime(&naive)))
    }

    /// Parse `<prefix><stamp><extension>`. Directory components are ignored.
    pub fn from_file_name(name: &str, prefix: &str, extension: &str) -> Option<Self> {
        let base = name.rsplit('/').next().unwrap_or(name);
        let stamp = base.strip_prefix(prefix)?.strip_suffix(extension)?;
        Self::parse_stamp(stamp)
    }

    /// Parse the name of a committed data file, with or without an attempt suffix.
    pub fn from_data_file(name: &str) -> Option<Self> {
        let base = name.rsplit('/').next().unwrap_or(name);
        let rest = base
            .strip_prefix(DATA_FILE_PREFIX)?
            .strip_suffix(DATA_FILE_EXTENSION)?;
        match rest.split_at_checked(STAMP_LEN)? {
            (stamp, "") => Self::parse_stamp(stamp),
            (stamp, suffix) if suffix.starts_with('-') => Self::parse_stamp(stamp),
            _ => None,
        }
    }

    pub fn stamp(&self) -> String {
        self.0.format(STAMP_FORMAT).to_string()
    }

    /// Data file name for one write attempt. Attempts never share a name, so
    /// an upload can never replace a file another writer already committed.
    pub fn data_file_name(&self, attempt: &str) -> String {
        format!(
            "{DATA_FILE_PREFIX}{}-{attempt}{DATA_FILE_EXTENSION}",
            self.stamp()
        )
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn timestamp_micros(&self) -> i64 {
        self.0.timestamp_micros()
    }

    /// Calendar date of the capture in `tz`.
    pub fn local_date(&self, tz: &Tz) -> NaiveDate {
        self.0.with_timezone(tz).date_naive()
    }
}

impl fmt::Display for SnapshotTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M:%SZ"))
    }
}

impl From<DateTime<Utc>> for SnapshotTimestamp {
    fn from(at: DateTime<Utc>) -> Self {
        Self(at)
    }
}
