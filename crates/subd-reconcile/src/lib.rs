//! subd Reconcile - Converging the local filesystem onto a target image
//!
//! Provides:
//! - The diff engine: missing objects and ordered change sets
//! - The update applier with trigger bracketing
//! - A service runner driving the init system for matched triggers
//!
//! ## Modules
//!
//! - [`diff`] - [`compute_missing`] and [`compute_change_set`]
//! - [`apply`] - [`UpdateApplier`] executing a [`ChangeSet`](subd_core::domain::ChangeSet)
//! - [`restart`] - [`ServiceCommandRunner`]

pub mod apply;
pub mod diff;
pub mod error;
mod fsops;
pub mod restart;

pub use apply::{ApplyOutcome, UpdateApplier};
pub use diff::{compute_change_set, compute_missing};
pub use error::ApplyError;
pub use restart::ServiceCommandRunner;
