//! Service runner port
//!
//! Executes the stop and start actions for triggers matched by an update.
//! Implementations decide how services are controlled (an init-system
//! command, a log line when triggers are disabled, a recorder in tests).

use async_trait::async_trait;

use crate::domain::triggers::{Trigger, TriggerAction};

#[async_trait]
pub trait IServiceRunner: Send + Sync {
    /// Runs `action` for each trigger
    ///
    /// Returns true if any trigger failed. Failures are never fatal to the
    /// update that caused them.
    async fn run(&self, triggers: &[Trigger], action: TriggerAction) -> bool;
}
