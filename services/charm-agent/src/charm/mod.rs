//! Charm fetching, staging and deployment.
//!
//! This module handles:
//! - Downloading charm archives with SHA-256 verification
//! - Unpacking verified archives into staged candidates
//! - Committing candidates by atomically swapping the `current` link
//! - Detecting concurrent deploys of the same workload

mod archive;
mod deployer;
mod download;
mod lock;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use archive::{unpack_charm, ArchiveError};
pub use deployer::{
    ActiveDeployment, CharmDeployer, ConflictReason, DeployError, DeployerConfig,
    DeploymentOutcome, StagingHandle,
};
pub use download::{
    DownloadError, DownloadRequest, Downloader, HttpDownloader, HttpDownloaderConfig,
};
pub use lock::{DeployLock, LockRecord};

/// Identifier of the managed workload instance this agent serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(String);

impl WorkloadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Desired charm as declared by the control plane for one tick.
///
/// A newer spec replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSpec {
    /// Opaque charm locator (e.g. `cs:mysql-7` or an archive URL).
    pub locator: String,
    /// Expected SHA-256 of the charm archive.
    pub content_digest: String,
    /// Counter bumped by the control plane on configuration changes.
    pub modification_generation: i64,
}

impl DesiredSpec {
    /// The part of the spec the deployer needs.
    pub fn descriptor(&self) -> CharmDescriptor {
        CharmDescriptor {
            locator: self.locator.clone(),
            digest: self.content_digest.clone(),
        }
    }
}

/// Location plus expected digest of a charm archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharmDescriptor {
    pub locator: String,
    pub digest: String,
}

/// The declared digest is not a SHA-256 hex string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid content digest {0:?}: expected 64 hex characters")]
pub struct InvalidDigest(pub String);

/// Normalized SHA-256 content digest (lowercase hex, no algorithm prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Parse a digest, accepting an optional `sha256:` prefix and any case.
    pub fn parse(s: &str) -> Result<Self, InvalidDigest> {
        let hex_part = s.trim().strip_prefix("sha256:").unwrap_or(s.trim());
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidDigest(s.to_string()));
        }
        Ok(Self(hex_part.to_ascii_lowercase()))
    }

    /// Finish an incremental hash.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Digest of an in-memory payload.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for directory names and logs.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl FromStr for ContentDigest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Suffix that keeps scratch paths unique across processes and calls.
pub(crate) fn unique_suffix() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = chrono::Utc::now().timestamp_subsec_nanos();
    format!(
        "{}-{}-{}",
        std::process::id(),
        nanos,
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
