//! Charm archive extraction.
//!
//! Charm archives are tarballs, usually gzip-compressed. Extraction runs on
//! the blocking pool and checks the cancellation signal on every read.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cancel::{CancelReader, CancelSignal};

/// Errors from archive extraction.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid charm archive: {0}")]
    Invalid(String),

    #[error("extraction cancelled")]
    Cancelled,
}

/// Unpack `archive_path` into `dest`, returning the number of entries written.
///
/// Entries that would escape `dest` are skipped. An archive without any
/// usable entry is rejected.
pub fn unpack_charm(
    archive_path: &Path,
    dest: &Path,
    cancel: &CancelSignal,
) -> Result<usize, ArchiveError> {
    fs::create_dir_all(dest)?;

    let gzip = is_gzip(archive_path)?;
    let reader = BufReader::new(File::open(archive_path)?);

    let result = if gzip {
        extract(
            Archive::new(CancelReader::new(GzDecoder::new(reader), cancel.clone())),
            dest,
        )
    } else {
        extract(
            Archive::new(CancelReader::new(reader, cancel.clone())),
            dest,
        )
    };

    match result {
        // tar wraps reader errors, so classify by the signal itself.
        Err(_) if cancel.is_cancelled() => Err(ArchiveError::Cancelled),
        Err(e) => Err(e),
        Ok(0) => Err(ArchiveError::Invalid("archive has no entries".to_string())),
        Ok(count) => {
            debug!(dest = %dest.display(), entries = count, "Charm archive unpacked");
            Ok(count)
        }
    }
}

fn extract<R: Read>(mut archive: Archive<R>, dest: &Path) -> Result<usize, ArchiveError> {
    archive.set_preserve_permissions(true);

    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            warn!(path = %path.display(), "Skipping archive entry outside charm directory");
            continue;
        }

        if entry.unpack_in(dest)? {
            count += 1;
        }
    }

    Ok(count)
}

/// Check if a file is gzip compressed.
fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_ok() {
        Ok(magic == [0x1f, 0x8b])
    } else {
        Ok(false)
    }
}
