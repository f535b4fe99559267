//! ReconciliationState domain entity
//!
//! Tracks which long operation (if any) currently owns the Sub, together
//! with the outcome of the most recent Fetch and Update. Exactly one phase is
//! active at a time; the protocol layer keeps this value behind one mutex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Long-running operation currently owning the Sub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing in flight
    #[default]
    Idle,
    /// Objects are being downloaded into the cache
    Fetching,
    /// A change set is being applied
    Updating,
}

impl Phase {
    /// Returns true if no operation is running
    pub fn is_idle(&self) -> bool {
        matches!(self, Phase::Idle)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Fetching => write!(f, "fetch"),
            Phase::Updating => write!(f, "update"),
        }
    }
}

/// In-memory reconciliation state reported by Poll
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReconciliationState {
    phase: Phase,
    started_at: Option<DateTime<Utc>>,
    last_fetch_error: Option<String>,
    last_update_error: Option<String>,
    last_update_had_trigger_failures: bool,
    last_successful_image_name: Option<String>,
}

impl ReconciliationState {
    /// Creates an idle state with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the state for a Fetch
    ///
    /// Clears the previous fetch error on success.
    pub fn begin_fetch(&mut self) -> Result<(), DomainError> {
        self.ensure_idle()?;
        self.phase = Phase::Fetching;
        self.started_at = Some(Utc::now());
        self.last_fetch_error = None;
        Ok(())
    }

    /// Releases a Fetch, recording its outcome
    pub fn finish_fetch(&mut self, error: Option<String>) -> Result<(), DomainError> {
        if self.phase != Phase::Fetching {
            return Err(DomainError::InvalidState {
                from: self.phase,
                to: Phase::Idle,
            });
        }
        self.phase = Phase::Idle;
        self.last_fetch_error = error;
        Ok(())
    }

    /// Claims the state for an Update
    pub fn begin_update(&mut self) -> Result<(), DomainError> {
        self.ensure_idle()?;
        self.phase = Phase::Updating;
        self.started_at = Some(Utc::now());
        self.last_update_error = None;
        self.last_update_had_trigger_failures = false;
        Ok(())
    }

    /// Releases an Update
    ///
    /// `image_name` becomes the last successful image only when the update
    /// finished without error.
    pub fn finish_update(
        &mut self,
        image_name: &str,
        error: Option<String>,
        had_trigger_failures: bool,
    ) -> Result<(), DomainError> {
        if self.phase != Phase::Updating {
            return Err(DomainError::InvalidState {
                from: self.phase,
                to: Phase::Idle,
            });
        }
        self.phase = Phase::Idle;
        self.last_update_had_trigger_failures = had_trigger_failures;
        if error.is_none() && !image_name.is_empty() {
            self.last_successful_image_name = Some(image_name.to_string());
        }
        self.last_update_error = error;
        Ok(())
    }

    /// Fails with [`DomainError::AlreadyInProgress`] unless idle
    pub fn ensure_idle(&self) -> Result<(), DomainError> {
        if self.phase.is_idle() {
            Ok(())
        } else {
            Err(DomainError::AlreadyInProgress(self.phase))
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn fetch_in_progress(&self) -> bool {
        self.phase == Phase::Fetching
    }

    pub fn update_in_progress(&self) -> bool {
        self.phase == Phase::Updating
    }

    /// When the current (or most recent) operation started
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn last_fetch_error(&self) -> Option<&str> {
        self.last_fetch_error.as_deref()
    }

    pub fn last_update_error(&self) -> Option<&str> {
        self.last_update_error.as_deref()
    }

    pub fn last_update_had_trigger_failures(&self) -> bool {
        self.last_update_had_trigger_failures
    }

    pub fn last_successful_image_name(&self) -> Option<&str> {
        self.last_successful_image_name.as_deref()
    }
}
