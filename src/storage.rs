//! Get-object boundary for post cover images.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use thiserror::Error;

/// Errors from a single get-object call. Always recoverable per post.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Object does not exist.
    #[error("object {locator} not found")]
    NotFound {
        /// `{bucket}:{key}` locator.
        locator: String,
    },
    /// Object exists but has no bytes.
    #[error("object {locator} is empty")]
    Empty {
        /// `{bucket}:{key}` locator.
        locator: String,
    },
    /// Storage answered with a non-success status.
    #[error("object {locator} returned status {status}")]
    Status {
        /// `{bucket}:{key}` locator.
        locator: String,
        /// HTTP status code.
        status: u16,
    },
    /// Request never produced a response.
    #[error("object {locator} transport failure: {message}")]
    Transport {
        /// `{bucket}:{key}` locator.
        locator: String,
        /// Underlying error text.
        message: String,
    },
    /// Local filesystem read failure.
    #[error("object {locator} read failed: {source}")]
    Io {
        /// `{bucket}:{key}` locator.
        locator: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Storage key of a post's cover image.
pub fn cover_key(post_id: &str) -> String {
    format!("downloads/{post_id}/cover.jpg")
}

/// Read-only object storage.
pub trait ObjectStore {
    /// Bucket the store reads from.
    fn bucket(&self) -> &str;

    /// Fetches the full object body for `key`.
    fn get_object(&self, key: &str) -> Result<Vec<u8>, FetchError>;

    /// `{bucket}:{key}`, used for cache keys and diagnostics.
    fn locator(&self, key: &str) -> String {
        format!("{}:{}", self.bucket(), key)
    }
}

/// Path-style S3-compatible HTTP store (`GET {endpoint}/{bucket}/{key}`).
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    bucket: String,
}

impl HttpObjectStore {
    /// Builds a store client; `token` is sent as a bearer credential when present.
    pub fn new(
        endpoint: String,
        bucket: String,
        token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            endpoint.starts_with("http://") || endpoint.starts_with("https://"),
            "storage endpoint must be an http(s) URL"
        );
        anyhow::ensure!(!bucket.trim().is_empty(), "missing storage bucket");
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            let auth = format!("Bearer {}", token.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid storage token")?,
            );
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build storage HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket,
        })
    }
}

impl ObjectStore for HttpObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}/{}/{}", self.endpoint, self.bucket, key);
        let locator = self.locator(key);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|err| FetchError::Transport {
                locator: locator.clone(),
                message: err.to_string(),
            })?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound { locator });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                locator,
                status: status.as_u16(),
            });
        }
        let bytes = resp.bytes().map_err(|err| FetchError::Transport {
            locator: locator.clone(),
            message: err.to_string(),
        })?;
        if bytes.is_empty() {
            return Err(FetchError::Empty { locator });
        }
        Ok(bytes.to_vec())
    }
}

/// Store backed by a local directory mirroring the bucket layout (`{root}/{key}`).
pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
}

impl LocalObjectStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }
}

impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, FetchError> {
        let locator = self.locator(key);
        let bytes = fs::read(self.root.join(key)).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                FetchError::NotFound {
                    locator: locator.clone(),
                }
            } else {
                FetchError::Io {
                    locator: locator.clone(),
                    source,
                }
            }
        })?;
        if bytes.is_empty() {
            return Err(FetchError::Empty { locator });
        }
        Ok(bytes)
    }
}
