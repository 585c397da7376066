//! Filesystem-backed persistence sink for spilled models.
//!
//! Models are serialized as JSON and written through a named temporary file
//! in the destination directory, then persisted into place, so a crash
//! mid-write never leaves a truncated spill at the destination.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::cache::{PersistenceSink, SpillError};

/// Errors raised while loading a previously spilled model back into memory.
#[derive(Debug, Error)]
pub enum SpillReadError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to decode spilled model from `{path}`: {message}")]
    Decode { path: PathBuf, message: String },
}

/// Filesystem-backed spill storage.
///
/// Each persistable cache entry carries its own destination path; this
/// storage has no root directory of its own.
#[derive(Debug, Default)]
pub struct JsonSpillStorage;

impl JsonSpillStorage {
    pub fn new() -> Self {
        Self
    }

    /// Load a spilled model back into memory from `path`.
    pub fn load<V: DeserializeOwned>(&self, path: &Path) -> Result<V, SpillReadError> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|err| SpillReadError::Decode {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

impl<V: Serialize> PersistenceSink<V> for JsonSpillStorage {
    fn persist(&self, handle: &V, destination: &Path) -> Result<(), SpillError> {
        let bytes = serde_json::to_vec(handle).map_err(|err| SpillError::Encode {
            destination: destination.to_path_buf(),
            message: err.to_string(),
        })?;

        let write_err = |source| SpillError::Write {
            destination: destination.to_path_buf(),
            source,
        };

        // The temp file must live on the same filesystem as the
        // destination for the final rename to hold.
        let parent = match destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent).map_err(write_err)?;

        let mut file = NamedTempFile::new_in(parent).map_err(write_err)?;
        file.write_all(&bytes).map_err(write_err)?;
        file.flush().map_err(write_err)?;
        file.persist(destination)
            .map_err(|err| write_err(err.error))?;

        debug!(
            destination = %destination.display(),
            bytes = bytes.len(),
            "Spilled model written"
        );
        Ok(())
    }
}
