//! Multi-cloud storage abstraction.
//!
//! Provides a unified interface over S3, GCS and the local filesystem. All
//! paths handed in and out are relative to the URL the provider was built
//! from.

mod gcs;
mod local;
mod s3;
mod url;

pub use gcs::GcsConfig;
pub use local::LocalConfig;
pub use s3::S3Config;
pub use url::BackendConfig;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::emit;
use crate::error::{ObjectStoreSnafu, StorageError};
use crate::metrics::events::{
    RequestStatus, StorageOperation, StorageRequest, StorageRequestDuration,
};

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over different cloud storage backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
    pub(crate) storage_options: HashMap<String, String>,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

fn record(operation: StorageOperation, ok: bool, start: Instant) {
    emit!(StorageRequest {
        operation,
        status: if ok {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        },
    });
    emit!(StorageRequestDuration {
        operation,
        duration: start.elapsed(),
    });
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        match BackendConfig::parse_url(url)? {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Gcs(config) => Self::construct_gcs(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Stream every object under `prefix` (relative to the configured base).
    ///
    /// Yielded paths are relative to the configured base, so they can be
    /// passed straight back to [`get`](Self::get).
    pub fn list_with_prefix(
        &self,
        prefix: &str,
    ) -> impl Stream<Item = Result<Path, StorageError>> + '_ {
        let full_prefix: Path = match self.config.key() {
            Some(key) => key.parts().chain(Path::from(prefix).parts()).collect(),
            None => Path::from(prefix),
        };
        let key_part_count = self
            .config
            .key()
            .map(|key| key.parts().count())
            .unwrap_or_default();

        emit!(StorageRequest {
            operation: StorageOperation::List,
            status: RequestStatus::Success,
        });

        self.object_store
            .list(Some(&full_prefix))
            .map(move |meta| {
                meta.map(|metadata| metadata.location.parts().skip(key_part_count).collect())
                    .context(ObjectStoreSnafu)
            })
    }

    /// Get the contents of a file.
    pub async fn get(&self, path: &Path) -> Result<Bytes, StorageError> {
        let start = Instant::now();
        let result = async {
            self.object_store
                .get(&self.qualify_path(path))
                .await?
                .bytes()
                .await
        }
        .await;

        record(StorageOperation::Get, result.is_ok(), start);
        result.context(ObjectStoreSnafu)
    }

    /// Put a payload to a path.
    pub async fn put_payload(&self, path: &Path, payload: PutPayload) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = self
            .object_store
            .put(&self.qualify_path(path), payload)
            .await;

        record(StorageOperation::Put, result.is_ok(), start);
        result.context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Put raw bytes to a path.
    pub async fn put(&self, path: &Path, bytes: impl Into<Bytes>) -> Result<(), StorageError> {
        self.put_payload(path, PutPayload::from(bytes.into())).await
    }

    /// Delete an object. Missing objects are not an error.
    pub async fn delete(&self, path: &Path) -> Result<(), StorageError> {
        let start = Instant::now();
        let result = match self.object_store.delete(&self.qualify_path(path)).await {
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            other => other,
        };

        record(StorageOperation::Delete, result.is_ok(), start);
        result.context(ObjectStoreSnafu)
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get storage options for external integrations (e.g., Delta Lake).
    pub fn storage_options(&self) -> &HashMap<String, String> {
        &self.storage_options
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }
}
