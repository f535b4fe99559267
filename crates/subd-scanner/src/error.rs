//! Error types for filesystem scanning.

use std::path::PathBuf;

use subd_core::domain::DomainError;
use thiserror::Error;

/// Errors that abort a scan.
///
/// Files that vanish while the scan runs are not errors; they are skipped.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scan root is not a directory: {}", .0.display())]
    RootNotDirectory(PathBuf),

    #[error("hardlinked directory: {0}")]
    HardlinkedDirectory(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Cache(#[from] subd_cache::ObjectCacheError),

    /// The background scan task is gone.
    #[error("scanner task has stopped")]
    Stopped,
}

impl ScanError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ScanError::Io {
            path: path.into(),
            source,
        }
    }
}
