//! Service trigger runner
//!
//! Turns matched triggers into init-system commands
//! (`<command...> <service> <action>`).
//!
//! - On `start`, a reboot trigger supersedes every other trigger
//! - Reboot triggers are skipped on `stop`
//! - The agent's own service is never stopped; on `start` it is restarted
//!   after every other service
//! - With triggers disabled every action is logged and nothing runs

use async_trait::async_trait;
use subd_core::domain::{Trigger, TriggerAction, REBOOT_SERVICE, SELF_SERVICE};
use subd_core::ports::IServiceRunner;
use tokio::process::Command;
use tracing::{info, warn};

/// [`IServiceRunner`] that shells out to a service manager.
#[derive(Debug, Clone)]
pub struct ServiceCommandRunner {
    /// Program and leading arguments, e.g. `["service"]`
    command: Vec<String>,
    disabled: bool,
}

impl ServiceCommandRunner {
    pub fn new(command: Vec<String>, disabled: bool) -> Self {
        Self { command, disabled }
    }

    fn is_reboot(trigger: &Trigger) -> bool {
        trigger.service == REBOOT_SERVICE || trigger.do_reboot
    }

    /// Runs the service command with `args` appended. Returns false on failure.
    async fn service_command(&self, args: &[&str]) -> bool {
        let Some((program, leading)) = self.command.split_first() else {
            warn!("No service command configured");
            return false;
        };
        run_command(program, leading.iter().map(String::as_str).chain(args.iter().copied())).await
    }
}

async fn run_command<'a>(program: &str, args: impl Iterator<Item = &'a str>) -> bool {
    let args: Vec<&str> = args.collect();
    match Command::new(program).args(&args).output().await {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            warn!(
                program,
                args = ?args,
                status = %output.status,
                output = %String::from_utf8_lossy(&output.stderr).trim(),
                "Command failed"
            );
            false
        }
        Err(e) => {
            warn!(program, args = ?args, error = %e, "Failed to run command");
            false
        }
    }
}

#[async_trait]
impl IServiceRunner for ServiceCommandRunner {
    async fn run(&self, triggers: &[Trigger], action: TriggerAction) -> bool {
        let disabled = self.disabled;
        let action_name = action.to_string();

        if action == TriggerAction::Start && triggers.iter().any(Self::is_reboot) {
            if disabled {
                info!("Disabled: Rebooting");
                return false;
            }
            info!("Rebooting");
            return !run_command("reboot", std::iter::empty::<&str>()).await;
        }

        let mut had_failures = false;
        let mut restart_self = false;
        for trigger in triggers {
            if Self::is_reboot(trigger) {
                continue;
            }
            if trigger.service == SELF_SERVICE {
                restart_self |= action == TriggerAction::Start;
                continue;
            }
            if disabled {
                info!(service = %trigger.service, action = %action, "Disabled: service action");
                continue;
            }
            info!(service = %trigger.service, action = %action, "Service action");
            if !self.service_command(&[trigger.service.as_str(), action_name.as_str()]).await {
                had_failures = true;
            }
        }
        if restart_self {
            if disabled {
                info!(service = SELF_SERVICE, "Disabled: service restart");
            } else {
                info!(service = SELF_SERVICE, "Service restart");
                if !self.service_command(&[SELF_SERVICE, "restart"]).await {
                    had_failures = true;
                }
            }
        }
        had_failures
    }
}
