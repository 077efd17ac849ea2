//! Integrity-checked charm archive downloads.
//!
//! Archives are streamed to a temporary file in the target directory while a
//! SHA-256 digest is computed incrementally. The file is renamed into place
//! only after the digest matches; every other exit path removes it.
//!
//! No retries happen here. Retry cadence belongs to the reconciler.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{unique_suffix, ContentDigest, InvalidDigest};
use crate::cancel::CancelSignal;

/// Errors from charm downloads.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    InvalidDigest(#[from] InvalidDigest),

    #[error("invalid charm locator {locator:?}: {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("charm store returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Archive too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("download timed out after {0:?}")]
    Timeout(Duration),

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A single archive fetch.
#[derive(Debug, Clone, Copy)]
pub struct DownloadRequest<'a> {
    /// Charm locator as handed out by the control plane.
    pub locator: &'a str,
    /// Expected SHA-256 of the archive.
    pub expected_digest: &'a str,
    /// Directory that receives the verified archive.
    pub target_dir: &'a Path,
}

/// Fetches charm archives to local disk.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download and verify an archive, returning the local path.
    ///
    /// On any error, including cancellation, nothing is left in
    /// `request.target_dir`.
    async fn fetch(
        &self,
        request: DownloadRequest<'_>,
        cancel: &CancelSignal,
    ) -> Result<PathBuf, DownloadError>;
}

/// Configuration for [`HttpDownloader`].
#[derive(Debug, Clone)]
pub struct HttpDownloaderConfig {
    /// Base URL used to resolve locators that are not URLs themselves.
    pub archive_base_url: String,
    /// Upper bound for one complete transfer.
    pub timeout: Duration,
    /// Largest archive accepted.
    pub max_archive_bytes: u64,
}

impl Default for HttpDownloaderConfig {
    fn default() -> Self {
        Self {
            archive_base_url: "http://127.0.0.1:8080".to_string(),
            timeout: Duration::from_secs(600),
            max_archive_bytes: 1024 * 1024 * 1024, // 1 GiB
        }
    }
}

/// Streaming HTTP downloader.
pub struct HttpDownloader {
    client: Client,
    config: HttpDownloaderConfig,
}

impl HttpDownloader {
    pub fn new(config: HttpDownloaderConfig) -> Result<Self, DownloadError> {
        let client = Client::builder().build()?;
        Ok(Self { client, config })
    }

    /// Map a locator to the URL the archive is served from.
    ///
    /// `http(s)://` locators are used as-is; anything else is looked up in the
    /// control plane's charm archive endpoint.
    pub fn resolve_url(&self, locator: &str) -> Result<Url, DownloadError> {
        let invalid = |reason: String| DownloadError::InvalidLocator {
            locator: locator.to_string(),
            reason,
        };

        if locator.trim().is_empty() {
            return Err(invalid("locator is empty".to_string()));
        }

        if locator.starts_with("http://") || locator.starts_with("https://") {
            return Url::parse(locator).map_err(|e| invalid(e.to_string()));
        }

        let base = self.config.archive_base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/v1/charms/archive"))
            .map_err(|e| invalid(format!("bad archive base url: {e}")))?;
        url.query_pairs_mut().append_pair("url", locator);
        Ok(url)
    }

    async fn stream_to_file(
        &self,
        url: &Url,
        file: &mut File,
        expected: &ContentDigest,
    ) -> Result<u64, DownloadError> {
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let limit = self.config.max_archive_bytes;
        if let Some(size) = response.content_length() {
            if size > limit {
                return Err(DownloadError::TooLarge { size, limit });
            }
        }

        let mut hasher = Sha256::new();
        let mut total_bytes = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            total_bytes += chunk.len() as u64;
            if total_bytes > limit {
                return Err(DownloadError::TooLarge {
                    size: total_bytes,
                    limit,
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        let actual = ContentDigest::from_hasher(hasher);
        if &actual != expected {
            return Err(DownloadError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(total_bytes)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(
        &self,
        request: DownloadRequest<'_>,
        cancel: &CancelSignal,
    ) -> Result<PathBuf, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let expected = ContentDigest::parse(request.expected_digest)?;
        let url = self.resolve_url(request.locator)?;

        tokio::fs::create_dir_all(request.target_dir).await?;
        let suffix = unique_suffix();
        let temp_path = request.target_dir.join(format!("download-{suffix}.partial"));
        let dest = request
            .target_dir
            .join(format!("{}-{suffix}.charm", expected.short()));

        debug!(
            locator = %request.locator,
            url = %url,
            temp = %temp_path.display(),
            "Downloading charm archive"
        );

        // Created outside the cancellable section so cleanup below always
        // sees the file.
        let mut file = File::create(&temp_path).await?;

        let timeout = self.config.timeout;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            outcome = tokio::time::timeout(
                timeout,
                self.stream_to_file(&url, &mut file, &expected),
            ) => outcome.unwrap_or(Err(DownloadError::Timeout(timeout))),
        };
        drop(file);

        let result = match result {
            Ok(size) => tokio::fs::rename(&temp_path, &dest)
                .await
                .map(|()| size)
                .map_err(DownloadError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(size) => {
                info!(
                    locator = %request.locator,
                    digest = %expected,
                    size,
                    "Charm archive downloaded"
                );
                Ok(dest)
            }
            Err(e) => {
                remove_partial(&temp_path).await;
                Err(e)
            }
        }
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}
