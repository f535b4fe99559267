//! Error types for update application.

use std::path::PathBuf;

use subd_cache::ObjectCacheError;
use subd_core::domain::{DomainError, InodeKind};
use thiserror::Error;

/// A failure applying one change set entry.
///
/// Entry failures are recorded and the update moves on to the next entry.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Cache(#[from] ObjectCacheError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// The entry list holds an inode type it cannot create.
    #[error("cannot create {kind} inode at {path} from this list")]
    WrongInodeKind { path: String, kind: InodeKind },

    /// Replacing the entry would remove the private working directory.
    #[error("{0} contains the working directory and cannot be replaced")]
    EnclosesWorkDir(String),

    #[error("update task failed: {0}")]
    Task(String),
}

impl ApplyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ApplyError::Io {
            path: path.into(),
            source,
        }
    }
}
