//! Cross-process deploy lock.
//!
//! The lock is a file created with `O_CREAT | O_EXCL` next to the active
//! deployment. Any deployer (this process or a peer sharing the directory)
//! that finds it present treats the deploy as conflicting. A lock older than
//! the configured staleness window is assumed to belong to a crashed peer and
//! is taken over. Takeover moves the file aside first and only discards it if
//! the moved file is still stale, so a fresh lock written by a faster peer is
//! never deleted.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::unique_suffix;

/// Prefix of lock files moved aside during a stale takeover.
pub(crate) const ASIDE_MARKER: &str = ".stale-";

/// Contents of the lock file, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// A held deploy lock. Released on drop.
#[derive(Debug)]
pub struct DeployLock {
    path: PathBuf,
    released: bool,
}

impl DeployLock {
    /// Try to take the lock at `path`.
    ///
    /// Returns `Ok(None)` if a fresh lock is held by someone else.
    pub fn try_acquire(
        path: &Path,
        owner: &str,
        stale_after: Duration,
    ) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        owner: owner.to_string(),
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    let body = serde_json::to_vec(&record).map_err(io::Error::other)?;
                    file.write_all(&body)?;
                    file.sync_all()?;
                    debug!(path = %path.display(), owner = %owner, "Deploy lock acquired");
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                        released: false,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && is_stale(path, stale_after)? {
                        warn!(
                            path = %path.display(),
                            holder = ?Self::holder(path),
                            "Taking over stale deploy lock"
                        );
                        if take_over_stale(path, stale_after)? {
                            continue;
                        }
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Read the current holder, if the lock exists and is readable.
    pub fn holder(path: &Path) -> Option<LockRecord> {
        let body = fs::read(path).ok()?;
        serde_json::from_slice(&body).ok()
    }

    /// Release the lock explicitly.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to release deploy lock");
                }
            }
        }
    }
}

/// Move a stale lock out of the way.
///
/// Returns false if the file moved aside turns out to be a fresh lock that a
/// peer created after the staleness check; that file is put back.
fn take_over_stale(path: &Path, stale_after: Duration) -> io::Result<bool> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(format!("{ASIDE_MARKER}{}", unique_suffix()));
    let aside = PathBuf::from(aside);

    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    }

    if is_stale(&aside, stale_after)? {
        return remove_if_present(&aside).map(|()| true);
    }

    debug!(path = %path.display(), "Deploy lock was renewed by a peer, restoring it");
    // hard_link never replaces an existing lock.
    match fs::hard_link(&aside, path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            remove_if_present(&aside)?;
            return Err(e);
        }
    }
    remove_if_present(&aside).map(|()| false)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> io::Result<bool> {
    let modified = match fs::metadata(path) {
        Ok(meta) => meta.modified()?,
        // Released between our create attempt and now.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    Ok(age > stale_after)
}
