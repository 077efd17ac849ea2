//! Two-phase charm deployment.
//!
//! A deploy cycle moves through explicit states:
//!
//! ```text
//! stage()  ──► StagingHandle      candidate unpacked under staging/
//! deploy() ──► DeploymentOutcome  Deployed | Conflict | Cancelled | Failed
//! ```
//!
//! `deploy` consumes the handle, so a staged candidate is committed at most
//! once; dropping the handle removes whatever it still owns on disk.
//!
//! Layout under the deployer root:
//!
//! ```text
//! staging/          downloads and unpacked candidates
//! versions/<id>/    committed charm trees
//! current           symlink to versions/<id>, replaced by rename(2)
//! deploy.lock       held while a commit is in progress
//! ```
//!
//! A crash at any point leaves `current` pointing at either the previous or
//! the new version; leftovers are cleaned by [`CharmDeployer::recover`].

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::archive::{unpack_charm, ArchiveError};
use super::download::{DownloadError, DownloadRequest, Downloader};
use super::lock::{DeployLock, ASIDE_MARKER};
use super::{unique_suffix, CharmDescriptor, ContentDigest};
use crate::cancel::CancelSignal;

const STAGING_DIR: &str = "staging";
const VERSIONS_DIR: &str = "versions";
const CURRENT_LINK: &str = "current";
const CURRENT_TMP_PREFIX: &str = "current.tmp-";
const LOCK_FILE: &str = "deploy.lock";
const META_FILE: &str = ".charm-deployment.json";

/// Errors from staging or committing a charm.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("deploy cancelled")]
    Cancelled,
}

impl DeployError {
    /// Returns true if this error is a cooperative abort rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Download(DownloadError::Cancelled)
                | Self::Archive(ArchiveError::Cancelled)
        )
    }

    /// Expected and actual digests, if the archive failed verification.
    pub fn digest_mismatch(&self) -> Option<(&str, &str)> {
        match self {
            Self::Download(DownloadError::DigestMismatch { expected, actual }) => {
                Some((expected.as_str(), actual.as_str()))
            }
            _ => None,
        }
    }
}

/// Why a deploy was rejected as conflicting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// Another deployer holds the deploy lock.
    LockHeld { holder: Option<String> },

    /// The active version moved between stage and deploy.
    ActiveChanged {
        staged_against: Option<String>,
        found: Option<String>,
    },
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockHeld { holder: Some(holder) } => {
                write!(f, "deploy already in progress by {holder}")
            }
            Self::LockHeld { holder: None } => f.write_str("deploy already in progress"),
            Self::ActiveChanged {
                staged_against,
                found,
            } => write!(
                f,
                "active charm changed from {} to {} while staging",
                staged_against.as_deref().unwrap_or("<none>"),
                found.as_deref().unwrap_or("<none>")
            ),
        }
    }
}

/// Terminal result of a stage/deploy cycle.
#[derive(Debug)]
pub enum DeploymentOutcome {
    Deployed,
    Conflict(ConflictReason),
    Cancelled,
    Failed(DeployError),
}

impl DeploymentOutcome {
    pub fn is_deployed(&self) -> bool {
        matches!(self, Self::Deployed)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Metadata written next to every committed charm tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeploymentMeta {
    locator: String,
    digest: String,
    staged_at: DateTime<Utc>,
}

/// The charm `current` points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDeployment {
    pub locator: String,
    pub digest: String,
    /// Directory name under `versions/`.
    pub version: String,
    pub path: PathBuf,
    pub staged_at: DateTime<Utc>,
}

/// A staged, not yet committed charm candidate.
#[derive(Debug)]
pub struct StagingHandle {
    descriptor: CharmDescriptor,
    digest: ContentDigest,
    archive_path: PathBuf,
    candidate_dir: PathBuf,
    staged_against: Option<String>,
    committed: bool,
}

impl StagingHandle {
    pub fn descriptor(&self) -> &CharmDescriptor {
        &self.descriptor
    }

    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    /// Verified archive on local disk.
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Unpacked candidate tree.
    pub fn candidate_dir(&self) -> &Path {
        &self.candidate_dir
    }

    /// Active version observed when the candidate was staged.
    pub fn staged_against(&self) -> Option<&str> {
        self.staged_against.as_deref()
    }
}

impl Drop for StagingHandle {
    fn drop(&mut self) {
        remove_quietly(&self.archive_path);
        if !self.committed {
            remove_quietly(&self.candidate_dir);
        }
    }
}

/// Configuration for [`CharmDeployer`].
#[derive(Debug, Clone)]
pub struct DeployerConfig {
    /// Root of the deploy layout.
    pub root: PathBuf,
    /// Age after which a deploy lock is considered abandoned.
    pub lock_stale_after: Duration,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/plfm-charm-agent/charm"),
            lock_stale_after: Duration::from_secs(15 * 60),
        }
    }
}

/// Stages and deploys charms for one workload.
#[derive(Clone)]
pub struct CharmDeployer {
    config: DeployerConfig,
    downloader: Arc<dyn Downloader>,
    owner: String,
}

impl CharmDeployer {
    /// Create a deployer. `owner` identifies this worker in the deploy lock.
    pub fn new(
        config: DeployerConfig,
        downloader: Arc<dyn Downloader>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            config,
            downloader,
            owner: owner.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.config.root.join(STAGING_DIR)
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.config.root.join(VERSIONS_DIR)
    }

    pub fn current_path(&self) -> PathBuf {
        self.config.root.join(CURRENT_LINK)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.config.root.join(LOCK_FILE)
    }

    /// Download, verify and unpack a candidate without touching the active
    /// deployment.
    pub async fn stage(
        &self,
        descriptor: &CharmDescriptor,
        cancel: &CancelSignal,
    ) -> Result<StagingHandle, DeployError> {
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        let digest = ContentDigest::parse(&descriptor.digest).map_err(DownloadError::from)?;
        let staging = self.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;
        let staged_against = self.active_version()?;

        info!(
            locator = %descriptor.locator,
            digest = %digest,
            staged_against = ?staged_against,
            "Staging charm"
        );

        let archive_path = self
            .downloader
            .fetch(
                DownloadRequest {
                    locator: &descriptor.locator,
                    expected_digest: &descriptor.digest,
                    target_dir: &staging,
                },
                cancel,
            )
            .await?;

        // From here on the handle owns the scratch files.
        let handle = StagingHandle {
            descriptor: descriptor.clone(),
            digest,
            archive_path,
            candidate_dir: staging.join(format!("candidate-{}", unique_suffix())),
            staged_against,
            committed: false,
        };

        let archive = handle.archive_path.clone();
        let dest = handle.candidate_dir.clone();
        let signal = cancel.clone();
        tokio::task::spawn_blocking(move || unpack_charm(&archive, &dest, &signal)).await??;

        let meta = DeploymentMeta {
            locator: descriptor.locator.clone(),
            digest: handle.digest.to_string(),
            staged_at: Utc::now(),
        };
        tokio::fs::write(
            handle.candidate_dir.join(META_FILE),
            serde_json::to_vec_pretty(&meta)?,
        )
        .await?;

        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }

        debug!(
            locator = %descriptor.locator,
            candidate = %handle.candidate_dir.display(),
            "Charm staged"
        );
        Ok(handle)
    }

    /// Commit a staged candidate.
    pub async fn deploy(
        &self,
        mut handle: StagingHandle,
        cancel: &CancelSignal,
    ) -> DeploymentOutcome {
        if cancel.is_cancelled() {
            debug!(locator = %handle.descriptor.locator, "Deploy cancelled before commit");
            return DeploymentOutcome::Cancelled;
        }

        let deployer = self.clone();
        let result = tokio::task::spawn_blocking(move || deployer.commit(&mut handle)).await;
        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => DeploymentOutcome::Failed(e),
            Err(e) => DeploymentOutcome::Failed(DeployError::Join(e)),
        }
    }

    /// Stage then deploy, folding staging errors into the outcome.
    pub async fn run_cycle(
        &self,
        descriptor: &CharmDescriptor,
        cancel: &CancelSignal,
    ) -> DeploymentOutcome {
        let handle = match self.stage(descriptor, cancel).await {
            Ok(handle) => handle,
            Err(e) if e.is_cancelled() => return DeploymentOutcome::Cancelled,
            Err(e) => return DeploymentOutcome::Failed(e),
        };
        self.deploy(handle, cancel).await
    }

    /// The currently active charm, if any.
    pub fn active(&self) -> Result<Option<ActiveDeployment>, DeployError> {
        let Some(version) = self.active_version()? else {
            return Ok(None);
        };
        let path = self.versions_dir().join(&version);
        let meta: DeploymentMeta = serde_json::from_slice(&fs::read(path.join(META_FILE))?)?;

        Ok(Some(ActiveDeployment {
            locator: meta.locator,
            digest: meta.digest,
            version,
            path,
            staged_at: meta.staged_at,
        }))
    }

    /// Remove leftovers of interrupted cycles. Never touches the active version.
    ///
    /// Returns the number of entries removed. Skipped while another deployer
    /// holds the lock.
    pub fn recover(&self) -> Result<usize, DeployError> {
        fs::create_dir_all(&self.config.root)?;

        let Some(lock) =
            DeployLock::try_acquire(&self.lock_path(), &self.owner, self.config.lock_stale_after)?
        else {
            debug!(root = %self.config.root.display(), "Deploy in progress, skipping recovery");
            return Ok(0);
        };

        let mut removed = 0;

        let staging = self.staging_dir();
        if staging.exists() {
            for entry in fs::read_dir(&staging)? {
                remove_path(&entry?.path())?;
                removed += 1;
            }
        }

        let lock_aside = format!("{LOCK_FILE}{ASIDE_MARKER}");
        for entry in fs::read_dir(&self.config.root)? {
            let entry = entry?;
            if entry.file_name().to_str().is_some_and(|name| {
                name.starts_with(CURRENT_TMP_PREFIX) || name.starts_with(&lock_aside)
            }) {
                remove_path(&entry.path())?;
                removed += 1;
            }
        }

        let active = self.active_version()?;
        let versions = self.versions_dir();
        if versions.exists() {
            for entry in fs::read_dir(&versions)? {
                let entry = entry?;
                let name = entry.file_name();
                if active.as_deref() != name.to_str() {
                    remove_path(&entry.path())?;
                    removed += 1;
                }
            }
        }

        if let Err(e) = lock.release() {
            warn!(error = %e, "Failed to release deploy lock after recovery");
        }

        if removed > 0 {
            info!(
                root = %self.config.root.display(),
                removed,
                "Removed leftovers of interrupted deploys"
            );
        }
        Ok(removed)
    }

    fn commit(&self, handle: &mut StagingHandle) -> Result<DeploymentOutcome, DeployError> {
        let lock_path = self.lock_path();
        let Some(lock) =
            DeployLock::try_acquire(&lock_path, &self.owner, self.config.lock_stale_after)?
        else {
            let holder = DeployLock::holder(&lock_path).map(|record| record.owner);
            return Ok(DeploymentOutcome::Conflict(ConflictReason::LockHeld {
                holder,
            }));
        };

        let active = self.active_version()?;
        if active != handle.staged_against {
            return Ok(DeploymentOutcome::Conflict(ConflictReason::ActiveChanged {
                staged_against: handle.staged_against.clone(),
                found: active,
            }));
        }

        let versions = self.versions_dir();
        fs::create_dir_all(&versions)?;
        let version = format!("{}-{}", handle.digest.short(), unique_suffix());
        let version_dir = versions.join(&version);

        fs::rename(&handle.candidate_dir, &version_dir)?;
        handle.candidate_dir = version_dir;

        self.swap_current(&version)?;
        // `current` names the new version now; the handle must not remove it.
        handle.committed = true;

        if let Err(e) = File::open(&self.config.root).and_then(|dir| dir.sync_all()) {
            warn!(root = %self.config.root.display(), error = %e, "Failed to sync deploy root");
        }

        if let Some(previous) = active {
            if let Err(e) = fs::remove_dir_all(versions.join(&previous)) {
                warn!(version = %previous, error = %e, "Failed to remove previous charm version");
            }
        }

        if let Err(e) = lock.release() {
            warn!(error = %e, "Failed to release deploy lock");
        }

        info!(
            locator = %handle.descriptor.locator,
            digest = %handle.digest,
            version = %version,
            "Charm deployed"
        );
        Ok(DeploymentOutcome::Deployed)
    }

    /// Point `current` at `versions/<version>` with a single rename.
    fn swap_current(&self, version: &str) -> io::Result<()> {
        let target = Path::new(VERSIONS_DIR).join(version);
        let tmp_link = self
            .config
            .root
            .join(format!("{CURRENT_TMP_PREFIX}{}", unique_suffix()));

        std::os::unix::fs::symlink(&target, &tmp_link)?;
        if let Err(e) = fs::rename(&tmp_link, self.current_path()) {
            remove_quietly(&tmp_link);
            return Err(e);
        }
        Ok(())
    }

    fn active_version(&self) -> io::Result<Option<String>> {
        match fs::read_link(self.current_path()) {
            Ok(target) => Ok(target
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = remove_path(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove staging leftover");
    }
}
