//! URL parsing for storage backends.

use object_store::path::Path;
use regex::{Captures, Regex};
use std::sync::LazyLock;

use crate::error::{InvalidUrlSnafu, StorageError};

use super::{GcsConfig, LocalConfig, S3Config};

const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const GCS_PATH: &str =
    r"^https://storage\.googleapis\.com/(?P<bucket>[a-z0-9\-_\.]+)(/(?P<key>.+))?$";
const GCS_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-_\.]+)\.storage\.googleapis\.com(/(?P<key>.+))?$";
const GCS_URL: &str = r"^[gG][sS]://(?P<bucket>[a-z0-9\-\._]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Gcs,
    Local,
}

/// Patterns in match order. More specific forms come first within a backend.
static MATCHERS: LazyLock<Vec<(Backend, Regex)>> = LazyLock::new(|| {
    [
        (Backend::S3, S3_PATH),
        (Backend::S3, S3_VIRTUAL),
        (Backend::S3, S3_ENDPOINT_URL),
        (Backend::S3, S3_URL),
        (Backend::Gcs, GCS_PATH),
        (Backend::Gcs, GCS_VIRTUAL),
        (Backend::Gcs, GCS_URL),
        (Backend::Local, FILE_URI),
        (Backend::Local, FILE_URL),
        (Backend::Local, FILE_PATH),
    ]
    .into_iter()
    .map(|(backend, pattern)| {
        (
            backend,
            Regex::new(pattern).expect("storage URL patterns are valid"),
        )
    })
    .collect()
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Gcs(GcsConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let url = url.trim_end_matches('/');
        for (backend, regex) in MATCHERS.iter() {
            if let Some(caps) = regex.captures(url) {
                return Ok(match backend {
                    Backend::S3 => Self::parse_s3(&caps),
                    Backend::Gcs => Self::parse_gcs(&caps),
                    Backend::Local => Self::parse_local(&caps),
                });
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(caps: &Captures) -> Self {
        let bucket = group(caps, "bucket");

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| caps.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            caps.name("endpoint").map(|endpoint| {
                let port = caps
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = caps.name("protocol").map(|p| p.as_str()).unwrap_or("https");
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key: key(caps),
        })
    }

    fn parse_gcs(caps: &Captures) -> Self {
        BackendConfig::Gcs(GcsConfig {
            bucket: group(caps, "bucket"),
            key: key(caps),
        })
    }

    fn parse_local(caps: &Captures) -> Self {
        let path = group(caps, "path");
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        BackendConfig::Local(LocalConfig { path })
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Gcs(gcs) => gcs.key.as_ref(),
            BackendConfig::Local(_) => None,
        }
    }

    /// URL form understood by Delta Lake's storage handlers.
    pub fn table_url(&self) -> String {
        let with_key = |scheme: &str, bucket: &str, key: Option<&Path>| match key {
            Some(key) => format!("{scheme}://{bucket}/{key}"),
            None => format!("{scheme}://{bucket}"),
        };
        match self {
            BackendConfig::S3(s3) => with_key("s3", &s3.bucket, s3.key.as_ref()),
            BackendConfig::Gcs(gcs) => with_key("gs", &gcs.bucket, gcs.key.as_ref()),
            BackendConfig::Local(local) => format!("file://{}", local.path),
        }
    }
}

fn group(caps: &Captures, name: &str) -> String {
    caps.name(name)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn key(caps: &Captures) -> Option<Path> {
    caps.name("key").map(|m| Path::from(m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_url_parsing() {
        let config = BackendConfig::parse_url("s3://mybucket/warehouse/status").unwrap();
        match &config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.key, Some(Path::from("warehouse/status")));
            }
            _ => panic!("Expected S3 config"),
        }
        assert_eq!(config.table_url(), "s3://mybucket/warehouse/status");
    }

    #[test]
    fn test_gcs_url_parsing() {
        let config = BackendConfig::parse_url("gs://nyc-bikes/raw/").unwrap();
        match &config {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "nyc-bikes");
                assert_eq!(gcs.key, Some(Path::from("raw")));
            }
            _ => panic!("Expected Gcs config"),
        }
        assert_eq!(config.table_url(), "gs://nyc-bikes/raw");

        let https = BackendConfig::parse_url("https://storage.googleapis.com/nyc-bikes").unwrap();
        assert_eq!(https.table_url(), "gs://nyc-bikes");
    }

    #[test]
    fn test_local_url_parsing() {
        for url in ["/data/lake", "file:///data/lake", "file:/data/lake"] {
            let config = BackendConfig::parse_url(url).unwrap();
            assert_eq!(
                config,
                BackendConfig::Local(LocalConfig {
                    path: "/data/lake".to_string()
                }),
                "{url}"
            );
            assert_eq!(config.table_url(), "file:///data/lake");
        }
    }

    #[test]
    fn test_invalid_url() {
        let err = BackendConfig::parse_url("relative/path").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }
}
