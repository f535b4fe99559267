//! Error types for the object cache.

use std::path::PathBuf;

use subd_core::domain::Digest;
use thiserror::Error;

/// Errors that can occur in object cache operations.
#[derive(Error, Debug)]
pub enum ObjectCacheError {
    #[error("object not in cache: {0}")]
    NotFound(Digest),

    #[error("content of object {expected} hashes to {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("object {digest} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        digest: Digest,
        expected: u64,
        actual: u64,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ObjectCacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ObjectCacheError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the object was absent
    pub fn is_not_found(&self) -> bool {
        match self {
            ObjectCacheError::NotFound(_) => true,
            ObjectCacheError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
