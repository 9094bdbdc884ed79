//! Shell-invoked file delivery to collaborator hosts.
//!
//! The front node and the SDN host consume artefacts at well-known paths; how
//! the file gets there is an operational choice, so the transfer command line
//! is configuration. `{local}` and `{remote}` are substituted before
//! execution.

use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::RemoteCopyConfig;
use crate::error::{ControlError, Result};

#[derive(Debug, Clone)]
pub struct RemoteCopier {
    command: String,
    args: Vec<String>,
    destination: String,
    timeout: Duration,
}

impl RemoteCopier {
    /// Returns `None` when delivery is disabled (local-only operation).
    pub fn from_config(config: &RemoteCopyConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            command: config.command.clone(),
            args: config.args.clone(),
            destination: config.destination.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn copy(&self, local: &Path) -> Result<()> {
        let local_str = local.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace("{local}", &local_str)
                    .replace("{remote}", &self.destination)
            })
            .collect();

        debug!(local = %local_str, remote = %self.destination, "Copying artefact");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.command).args(&args).output(),
        )
        .await
        .map_err(|_| ControlError::Timeout(format!("remote copy of {local_str}")))?
        .map_err(|e| ControlError::Publish(format!("failed to spawn {}: {e}", self.command)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ControlError::Publish(format!(
                "copy to {} failed: {}",
                self.destination,
                stderr.trim()
            )))
        }
    }
}
