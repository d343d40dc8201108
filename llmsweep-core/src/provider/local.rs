//! Local machine provider.

use super::{CommandOutput, ProbeOutcome, ProviderKind, ResourceHandle, ResourceProvider};
use crate::error::{AcquireFailure, Result, SweepError};
use crate::shell::redact_secrets;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Runs everything on the current host.
pub struct LocalProvider {
    client: reqwest::Client,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn acquire(
        &self,
        _cancel: &CancellationToken,
    ) -> std::result::Result<ResourceHandle, AcquireFailure> {
        Ok(ResourceHandle::local())
    }

    async fn execute(&self, _handle: &ResourceHandle, command: &str) -> Result<CommandOutput> {
        tracing::debug!(command = %redact_secrets(command), "Executing locally");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SweepError::trial(format!("failed to spawn sh: {e}")))?;
        Ok(CommandOutput::from_output(output))
    }

    async fn probe(&self, _handle: &ResourceHandle, url: &str, timeout: Duration) -> ProbeOutcome {
        http_probe(&self.client, url, timeout).await
    }

    async fn release(&self, handle: &ResourceHandle) {
        if handle.claim_release() {
            tracing::debug!("Released local target");
        }
    }
}

/// GET `url` and report whether it answered with a 2xx status in time.
pub async fn http_probe(client: &reqwest::Client, url: &str, timeout: Duration) -> ProbeOutcome {
    match client.get(url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() => ProbeOutcome::Healthy,
        Ok(resp) => ProbeOutcome::NotReady(format!("HTTP {}", resp.status().as_u16())),
        Err(e) if e.is_connect() => ProbeOutcome::NotReady("connection refused".to_string()),
        Err(e) if e.is_timeout() => ProbeOutcome::NotReady("request timed out".to_string()),
        Err(e) => ProbeOutcome::NotReady(e.to_string()),
    }
}
