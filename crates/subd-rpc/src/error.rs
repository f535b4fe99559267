//! Error types for the reconciliation protocol.

use subd_cache::ObjectCacheError;
use subd_core::domain::{DomainError, Phase};
use thiserror::Error;

/// Reasons a protocol request is rejected or fails.
///
/// Per-object and per-entry failures of a detached Fetch or Update are not
/// reported here; they surface through Poll.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Another Fetch or Update owns the Sub
    #[error("{0} already in progress")]
    Busy(Phase),

    #[error("sub is read-only")]
    ReadOnly,

    #[error("updates are disabled")]
    UpdatesDisabled,

    #[error("no filesystem scan has completed yet")]
    NoScanYet,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A Fetch or Update run with `wait` finished with errors
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Domain(DomainError),

    #[error(transparent)]
    Cache(#[from] ObjectCacheError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DomainError> for RpcError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::AlreadyInProgress(phase) => RpcError::Busy(phase),
            other => RpcError::Domain(other),
        }
    }
}

impl RpcError {
    pub fn is_busy(&self) -> bool {
        matches!(self, RpcError::Busy(_))
    }
}
