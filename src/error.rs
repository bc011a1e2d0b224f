//! Error types for dockside using snafu.
//!
//! Each layer gets its own enum with context selectors. Per-file errors
//! (`LoadError`) carry an [`ErrorClass`] so the retry executor can tell a
//! flaky network from a broken payload.

use snafu::prelude::*;

use crate::retry::{Classify, ErrorClass};

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

impl Classify for StorageError {
    fn class(&self) -> ErrorClass {
        match self {
            StorageError::ObjectStore { source } => classify_object_store(source),
            StorageError::Io { .. } => ErrorClass::Transient,
            StorageError::InvalidUrl { .. }
            | StorageError::S3Config { .. }
            | StorageError::GcsConfig { .. } => ErrorClass::Permanent,
        }
    }
}

/// Missing objects, bad paths and auth failures will not heal on retry.
/// Everything else from the store (HTTP 5xx, timeouts, throttling) might.
pub(crate) fn classify_object_store(err: &object_store::Error) -> ErrorClass {
    use object_store::Error;

    match err {
        Error::NotFound { .. }
        | Error::InvalidPath { .. }
        | Error::NotSupported { .. }
        | Error::NotImplemented
        | Error::PermissionDenied { .. }
        | Error::Unauthenticated { .. }
        | Error::UnknownConfigurationKey { .. } => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No feeds configured.
    #[snafu(display("At least one feed must be configured"))]
    NoFeeds,

    /// Lake URL is empty.
    #[snafu(display("Lake URL cannot be empty"))]
    EmptyLakeUrl,

    /// Feed has no target table.
    #[snafu(display("Feed '{feed}' has an empty table_uri"))]
    EmptyTableUri { feed: String },

    /// Feed has no filename prefix.
    #[snafu(display("Feed '{feed}' has an empty file_prefix"))]
    EmptyFilePrefix { feed: String },

    /// Retry settings are out of range.
    #[snafu(display("Invalid retry settings: {message}"))]
    InvalidRetry { message: String },

    /// Concurrency must be at least one.
    #[snafu(display("max_concurrent_files must be at least 1"))]
    InvalidConcurrency,

    /// Partition time zone is not a known IANA name.
    #[snafu(display("Unknown partition time zone: {name}"))]
    UnknownTimezone { name: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Feed Errors ============

/// Errors raised while turning a snapshot document into rows.
///
/// All of these are properties of the payload, so they are never retried.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FeedError {
    /// Payload is not valid JSON.
    #[snafu(display("Snapshot is not valid JSON: {source}"))]
    JsonParse { source: serde_json::Error },

    /// Top-level value is not an object.
    #[snafu(display("Snapshot document is not a JSON object"))]
    NotAnObject,

    /// The `data.stations` array is absent or not an array.
    #[snafu(display("Snapshot document has no data.stations array"))]
    MissingStations,

    /// Arrow rejected the assembled columns.
    #[snafu(display("Failed to build record batch: {source}"))]
    BatchBuild {
        source: deltalake::arrow::error::ArrowError,
    },
}

// ============ Warehouse Errors ============

/// Errors that can occur while reading from or committing to a target table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// Delta Lake operation failed.
    #[snafu(display("Delta Lake operation failed on {table}: {source}"))]
    DeltaLake {
        table: String,
        source: deltalake::DeltaTableError,
    },

    /// Storage for the table location could not be set up.
    #[snafu(display("Failed to open storage for table {uri}: {source}"))]
    TableStorage { uri: String, source: StorageError },

    /// Failed to parse the table URL.
    #[snafu(display("Failed to parse table URL {url}: {source}"))]
    UrlParse {
        url: String,
        source: url::ParseError,
    },

    /// Target table does not carry every column the loader writes.
    #[snafu(display("Table {table} is missing columns: {}", columns.join(", ")))]
    MissingColumns { table: String, columns: Vec<String> },

    /// Failed to create struct type.
    #[snafu(display("Failed to create struct type: {message}"))]
    StructType { message: String },

    /// Arrow to Delta schema conversion error.
    #[snafu(display("Schema conversion failed: {source}"))]
    SchemaConversion {
        source: deltalake::arrow::error::ArrowError,
    },

    /// Parquet encoding failed.
    #[snafu(display("Parquet write error: {source}"))]
    ParquetWrite {
        source: deltalake::parquet::errors::ParquetError,
    },

    /// Data file upload failed.
    #[snafu(display("Failed to upload data file {path}: {source}"))]
    Upload { path: String, source: StorageError },

    /// Table could not be reached (used by in-memory tables to simulate outages).
    #[snafu(display("Table {table} unavailable: {message}"))]
    Unavailable { table: String, message: String },
}

impl WarehouseError {
    /// Check if this error means the table has not been provisioned.
    pub fn is_table_not_found(&self) -> bool {
        matches!(
            self,
            WarehouseError::DeltaLake {
                source: deltalake::DeltaTableError::NotATable(_)
                    | deltalake::DeltaTableError::InvalidTableLocation(_),
                ..
            }
        )
    }
}

impl Classify for WarehouseError {
    fn class(&self) -> ErrorClass {
        use deltalake::DeltaTableError;
        use deltalake::kernel::transaction::TransactionError;

        match self {
            WarehouseError::DeltaLake { source, .. } => match source {
                DeltaTableError::ObjectStore { source } => classify_object_store(source),
                DeltaTableError::Transaction { source } => match source {
                    TransactionError::ObjectStore { source } => classify_object_store(source),
                    // Another writer won the version; a reload and retry may succeed.
                    TransactionError::CommitConflict(_)
                    | TransactionError::MaxCommitAttempts(_)
                    | TransactionError::VersionAlreadyExists(_) => ErrorClass::Transient,
                    _ => ErrorClass::Permanent,
                },
                DeltaTableError::Io { .. } | DeltaTableError::VersionAlreadyExists(_) => {
                    ErrorClass::Transient
                }
                _ => ErrorClass::Permanent,
            },
            WarehouseError::Upload { source, .. } | WarehouseError::TableStorage { source, .. } => {
                source.class()
            }
            WarehouseError::Unavailable { .. } => ErrorClass::Transient,
            WarehouseError::UrlParse { .. }
            | WarehouseError::MissingColumns { .. }
            | WarehouseError::StructType { .. }
            | WarehouseError::SchemaConversion { .. }
            | WarehouseError::ParquetWrite { .. } => ErrorClass::Permanent,
        }
    }
}

// ============ Load Errors ============

/// Failure of a single snapshot file's load attempt.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoadError {
    /// Reading the snapshot from the lake failed.
    #[snafu(display("Failed to fetch {location}: {source}"))]
    Fetch {
        location: String,
        source: StorageError,
    },

    /// Snapshot payload is malformed.
    #[snafu(display("Failed to parse {location}: {source}"))]
    Parse { location: String, source: FeedError },

    /// The parse task panicked or was cancelled.
    #[snafu(display("Parse task for {location} did not complete: {source}"))]
    TaskJoin {
        location: String,
        source: tokio::task::JoinError,
    },

    /// Commit to the target table failed.
    #[snafu(display("Failed to commit {location}: {source}"))]
    Commit {
        location: String,
        source: WarehouseError,
    },
}

impl Classify for LoadError {
    fn class(&self) -> ErrorClass {
        match self {
            LoadError::Fetch { source, .. } => source.class(),
            LoadError::Parse { .. } | LoadError::TaskJoin { .. } => ErrorClass::Permanent,
            LoadError::Commit { source, .. } => source.class(),
        }
    }
}

// ============ Run Errors ============

/// Errors that abort a whole run before any file is loaded.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RunError {
    /// The set of committed snapshots could not be determined.
    #[snafu(display("Failed to resolve watermark for {table} after {attempts} attempt(s): {source}"))]
    Watermark {
        table: String,
        attempts: u32,
        source: WarehouseError,
    },

    /// The lake could not be listed.
    #[snafu(display("Failed to list snapshots under {prefix} after {attempts} attempt(s): {source}"))]
    Listing {
        prefix: String,
        attempts: u32,
        source: StorageError,
    },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },
}

// ============ DLQ Errors ============

/// Errors that can occur during Dead Letter Queue operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
// Prefix avoids snafu selector conflicts (e.g., WriteSnafu)
#[allow(clippy::enum_variant_names)]
pub enum DlqError {
    /// Failed to write to DLQ.
    #[snafu(display("Failed to write to DLQ"))]
    DlqWrite { source: StorageError },

    /// Failed to serialize failed file record.
    #[snafu(display("Failed to serialize DLQ record"))]
    DlqSerialize { source: serde_json::Error },

    /// Failed to create DLQ storage provider.
    #[snafu(display("Failed to create DLQ storage"))]
    DlqStorage { source: StorageError },
}

// ============ Pipeline Error (top-level) ============

/// Top-level errors surfaced by the binary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Storage error.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Target table error.
    #[snafu(display("Warehouse error"))]
    Warehouse { source: WarehouseError },

    /// A run aborted before loading.
    #[snafu(display("Run aborted for feed {feed}"))]
    Run { feed: String, source: RunError },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// DLQ error.
    #[snafu(display("DLQ error"))]
    Dlq { source: DlqError },

    /// Summary serialization failed.
    #[snafu(display("Failed to serialize run summary"))]
    SummaryJson { source: serde_json::Error },

    /// One or more files failed to load.
    #[snafu(display("{count} snapshot file(s) failed to load"))]
    FilesFailed { count: usize },
}
