//! Error types shared across the crate.

use std::path::PathBuf;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Local snapshot database errors. Always fatal to a run.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("corrupt snapshot row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}

/// Embedding call outcome classification.
///
/// Transient failures are retried with backoff by the caller. Fatal failures
/// mark the row failed for the rest of the run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbedError {
    #[error("transient embedding failure: {0}")]
    Transient(String),

    #[error("fatal embedding failure: {0}")]
    Fatal(String),
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::Transient(_))
    }
}

/// Remote vector index errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndexError {
    #[error("transient index failure: {0}")]
    Transient(String),

    #[error("index failure: {0}")]
    Fatal(String),
}

impl IndexError {
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Transient(_))
    }
}

/// Checkpoint file errors. Always fatal to a run: continuing would risk
/// re-embedding work that was already paid for.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse checkpoint {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to remove checkpoint {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Dataset input errors.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read dataset {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid entity at line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}
