//! JSON-file state store.
//!
//! Writes go to a sibling temp file which is fsynced and renamed over the
//! canonical path, so a crash during `save` leaves either the old or the new
//! record readable.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Persisted state file format version.
const STATE_VERSION: u32 = 1;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// What this worker last deployed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalState {
    /// Locator of the deployed charm; `None` before the first deploy.
    pub deployed_locator: Option<String>,
    /// Modification generation recorded with the deployed charm.
    pub deployed_modification_generation: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(default)]
    deployed_locator: Option<String>,
    #[serde(default)]
    deployed_modification_generation: i64,
}

/// Crash-safe store for [`LocalState`].
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    path: PathBuf,
}

impl LocalStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file used while writing.
    pub fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    /// Load state. Returns the empty state if nothing was saved yet.
    pub fn load(&self) -> Result<LocalState, StateStoreError> {
        let content = match fs::read(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting fresh");
                return Ok(LocalState::default());
            }
            Err(source) => {
                return Err(StateStoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let persisted: PersistedState = serde_json::from_slice(&content)?;
        if persisted.version != STATE_VERSION {
            warn!(
                file_version = persisted.version,
                current_version = STATE_VERSION,
                "State file version mismatch, starting fresh"
            );
            return Ok(LocalState::default());
        }

        let deployed_locator = persisted.deployed_locator.filter(|l| !l.is_empty());
        if deployed_locator.is_none() && persisted.deployed_modification_generation != 0 {
            return Err(StateStoreError::Invalid(format!(
                "generation {} recorded without a deployed charm",
                persisted.deployed_modification_generation
            )));
        }

        Ok(LocalState {
            deployed_locator,
            deployed_modification_generation: persisted.deployed_modification_generation,
        })
    }

    /// Replace the stored state atomically.
    pub fn save(&self, state: &LocalState) -> Result<(), StateStoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let body = encode(state)?;
        let tmp_path = self.temp_path();
        write_synced(&tmp_path, &body).map_err(io_err(&tmp_path))?;
        fs::rename(&tmp_path, &self.path).map_err(io_err(&self.path))?;

        if let Some(parent) = self.path.parent() {
            sync_dir(parent).map_err(io_err(parent))?;
        }

        debug!(
            path = %self.path.display(),
            locator = ?state.deployed_locator,
            generation = state.deployed_modification_generation,
            "Saved local state"
        );
        Ok(())
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StateStoreError {
    let path = path.to_path_buf();
    move |source| StateStoreError::Io { path, source }
}

/// Serialized form of a state, exactly as `save` writes it.
pub(crate) fn encode(state: &LocalState) -> Result<Vec<u8>, StateStoreError> {
    let persisted = PersistedState {
        version: STATE_VERSION,
        deployed_locator: state.deployed_locator.clone(),
        deployed_modification_generation: state.deployed_modification_generation,
    };
    Ok(serde_json::to_vec_pretty(&persisted)?)
}

fn write_synced(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(body)?;
    file.sync_all()
}

fn sync_dir(path: &Path) -> io::Result<()> {
    // An empty parent means the current directory.
    let dir = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };
    File::open(dir)?.sync_all()
}
