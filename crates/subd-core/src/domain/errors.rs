//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including digest and path validation, pattern compilation, malformed
//! trees and rejected state transitions.

use thiserror::Error;

use super::reconciliation::Phase;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Digest text or bytes are not a valid SHA-512 digest
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid pathname format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Pathname resolves outside the managed root
    #[error("Path escapes managed root: {0}")]
    PathEscapesRoot(String),

    /// A filter or trigger pattern failed to compile
    #[error("Invalid pattern {pattern}: {reason}")]
    InvalidPattern {
        /// The offending pattern text
        pattern: String,
        /// Compiler diagnostic
        reason: String,
    },

    /// The tree references missing inodes or has no directory at its root
    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    /// Another Fetch or Update currently owns the reconciliation state
    #[error("{0} already in progress")]
    AlreadyInProgress(Phase),

    /// A completion was reported for a phase that is not running
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current phase
        from: Phase,
        /// The attempted target phase
        to: Phase,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl DomainError {
    /// Returns true for the "busy" class of errors
    pub fn is_busy(&self) -> bool {
        matches!(self, DomainError::AlreadyInProgress(_))
    }
}
