use std::path::PathBuf;

use thiserror::Error;

use crate::http::NetworkError;

/// Errors surfaced by the offline engine.
///
/// Lookup misses are not errors: stores return `Option::None` for them.
#[derive(Error, Debug)]
pub enum OfflineError {
    /// A record or argument was rejected before any I/O happened.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Network(#[from] NetworkError),

    /// The manifest could not be fetched or parsed; no delta can be computed.
    #[error("Manifest unavailable: {0}")]
    Manifest(String),

    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid stored data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OfflineError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OfflineError::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn missing(field: &str) -> Self {
        OfflineError::Validation(format!("Missing {} prop", field))
    }
}

pub type Result<T> = std::result::Result<T, OfflineError>;
