use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CovtrendError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record at {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid snapshot: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CovtrendError {
    /// Wrap an I/O error with the path it happened on.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CovtrendError::Storage {
            path: path.into(),
            source,
        }
    }

    /// True for the "nothing recorded yet" case, which reporting paths treat
    /// as a missing baseline rather than a failure.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, CovtrendError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CovtrendError>;
