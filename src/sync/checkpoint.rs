//! Durable record of in-progress embedding work.
//!
//! A checkpoint belongs to one working set (the ordered `to_embed` ids of a
//! run) and holds every vector computed for it so far, keyed by offset into
//! that working set. It is written atomically (temp file + rename) and
//! removed once the vectors are safely in the local snapshot.

use crate::error::CheckpointError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Partial progress of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identifies the working set this checkpoint was taken against.
    pub fingerprint: String,
    /// Highest offset processed (embedded or failed) so far.
    pub last_processed_index: Option<usize>,
    /// Offset into the working set → computed vector.
    pub embeddings: BTreeMap<usize, Vec<f32>>,
}

impl Checkpoint {
    pub fn new(fingerprint: String) -> Self {
        Self {
            fingerprint,
            ..Default::default()
        }
    }

    /// Fingerprint of an ordered working set.
    pub fn fingerprint<'a>(ids: impl IntoIterator<Item = &'a str>) -> String {
        let mut hasher = Sha256::new();
        for id in ids {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// File-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current checkpoint, or `None` when there is none.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let checkpoint = serde_json::from_slice(&raw).map_err(|source| CheckpointError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(checkpoint))
    }

    /// Persist the full checkpoint, replacing any previous one atomically.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let write_error = |source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_error)?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(write_error)?;
        serde_json::to_writer(&mut temp, checkpoint)
            .map_err(|error| write_error(std::io::Error::other(error)))?;
        temp.flush().map_err(write_error)?;
        temp.as_file().sync_all().map_err(write_error)?;
        temp.persist(&self.path)
            .map_err(|error| write_error(error.error))?;

        tracing::debug!(
            path = %self.path.display(),
            embeddings = checkpoint.embeddings.len(),
            last_processed_index = ?checkpoint.last_processed_index,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Remove the checkpoint. Missing file is fine.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "checkpoint cleared");
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
