//! Virtualization host command channel.
//!
//! Power transitions are delegated to the host's own tooling through a
//! templated command line; `{server}` and `{state}` are substituted before
//! execution. Commands are idempotent on the controller side: powering on an
//! already-running server is a no-op at the host.

use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{ControlError, Result};

#[derive(Debug, Clone)]
pub struct PowerController {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    restart_gap: Duration,
}

impl PowerController {
    pub fn new(
        command: String,
        args: Vec<String>,
        timeout: Duration,
        restart_gap: Duration,
    ) -> Self {
        Self {
            command,
            args,
            timeout,
            restart_gap,
        }
    }

    async fn run(&self, server: &str, state: &str) -> Result<()> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{server}", server).replace("{state}", state))
            .collect();

        info!(server, state, command = %self.command, "Issuing power command");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.command).args(&args).output(),
        )
        .await
        .map_err(|_| {
            ControlError::Timeout(format!("power command for {server} ({state})"))
        })?
        .map_err(|e| ControlError::Power(format!("failed to spawn {}: {e}", self.command)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(server, state, stderr = %stderr.trim(), "Power command failed");
            Err(ControlError::Power(format!(
                "{server} ({state}): {}",
                stderr.trim()
            )))
        }
    }

    pub async fn power_on(&self, server: &str) -> Result<()> {
        self.run(server, "on").await
    }

    pub async fn power_off(&self, server: &str) -> Result<()> {
        self.run(server, "off").await
    }

    /// Hard reboot: off, fixed gap, on.
    pub async fn restart(&self, server: &str) -> Result<()> {
        self.run(server, "off").await?;
        tokio::time::sleep(self.restart_gap).await;
        self.run(server, "on").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(command: &str, args: &[&str]) -> PowerController {
        PowerController::new(
            command.to_string(),
            args.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_successful_command() {
        let power = controller("true", &["{server}", "{state}"]);
        assert!(power.power_on("apache-vm-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_command() {
        let power = controller("false", &["{server}", "{state}"]);
        assert!(matches!(
            power.power_off("apache-vm-1").await,
            Err(ControlError::Power(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let power = controller("definitely-not-a-real-binary-xyz", &[]);
        assert!(matches!(
            power.power_on("apache-vm-1").await,
            Err(ControlError::Power(_))
        ));
    }

    #[tokio::test]
    async fn test_placeholder_substitution() {
        // `test` exits 0 only when both operands are equal; passing the
        // substituted server name twice proves the template was applied.
        let power = controller("test", &["{server}", "=", "{server}"]);
        assert!(power.power_on("apache-vm-1").await.is_ok());
    }
}
