//! Compute targets the sweep runs on.
//!
//! A [`ResourceProvider`] hands out [`ResourceHandle`]s, runs shell commands
//! on them and releases them. Three variants exist:
//! - [`LocalProvider`]: this machine, commands run through `sh -c`
//! - [`SshProvider`]: an existing host reached over SSH
//! - [`EphemeralCloudProvider`]: an instance created for the sweep through a
//!   [`CloudApi`] backend (RunPod or SkyPilot) and destroyed afterwards
//!
//! Use [`build_provider`] to pick the variant from configuration.

pub mod cloud;
pub mod local;
pub mod retry;
pub mod runpod;
pub mod skypilot;
pub mod ssh;

use crate::config::{CloudProviderKind, SweepConfig, VenvConfig};
use crate::error::{AcquireFailure, Result};
use crate::shell::quote;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use cloud::{CloudApi, EphemeralCloudProvider, Endpoint, InstanceStatus};
pub use local::LocalProvider;
pub use runpod::RunPodApi;
pub use skypilot::SkyPilotApi;
pub use ssh::{SshAuth, SshProvider, SshTarget};

/// Which provider variant a sweep uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Local,
    Remote,
    Cloud,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

/// Captured result of a command on a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `lines` lines of stderr, for error messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }

    pub(crate) fn from_output(output: std::process::Output) -> Self {
        Self {
            // Killed by a signal.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    /// Not ready yet; the string says why (refused, status code, timeout).
    NotReady(String),
}

/// Where a handle points.
#[derive(Debug, Clone)]
pub enum Target {
    Local,
    Ssh(SshTarget),
    Instance {
        instance_id: String,
        ssh: Option<SshTarget>,
    },
}

#[derive(Debug)]
struct HandleInner {
    id: Uuid,
    target: Target,
    released: AtomicBool,
}

/// Reference to an acquired compute target.
///
/// Clones share one release flag, so however many copies exist the target is
/// released at most once.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    inner: Arc<HandleInner>,
}

impl ResourceHandle {
    fn new(target: Target) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                target,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn local() -> Self {
        Self::new(Target::Local)
    }

    pub fn ssh(target: SshTarget) -> Self {
        Self::new(Target::Ssh(target))
    }

    pub fn instance(instance_id: impl Into<String>, ssh: Option<SshTarget>) -> Self {
        Self::new(Target::Instance {
            instance_id: instance_id.into(),
            ssh,
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// Mark the handle released. Returns `true` only for the first caller,
    /// which is then responsible for the actual teardown.
    pub fn claim_release(&self) -> bool {
        !self.inner.released.swap(true, Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Human-readable description for logs.
    pub fn describe(&self) -> String {
        match &self.inner.target {
            Target::Local => "local".to_string(),
            Target::Ssh(ssh) => format!("ssh://{}", ssh.destination()),
            Target::Instance { instance_id, ssh } => match ssh {
                Some(ssh) => format!("instance {instance_id} ({})", ssh.destination()),
                None => format!("instance {instance_id}"),
            },
        }
    }
}

/// A source of compute targets.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Obtain a target ready to run servers on.
    ///
    /// `cancel` lets long acquisitions (instance provisioning) stop early;
    /// anything already created is then returned in
    /// [`AcquireFailure::partial`].
    async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<ResourceHandle, AcquireFailure>;

    /// Run a shell command on the target with stdin closed.
    ///
    /// A non-zero exit status is part of the returned [`CommandOutput`];
    /// `Err` means the command could not be dispatched at all.
    async fn execute(&self, handle: &ResourceHandle, command: &str) -> Result<CommandOutput>;

    /// Probe an HTTP endpoint as seen from the target. The default runs
    /// `curl` on the target, so the server port does not need to be exposed.
    async fn probe(&self, handle: &ResourceHandle, url: &str, timeout: Duration) -> ProbeOutcome {
        let command = format!(
            "curl -s -o /dev/null -w '%{{http_code}}' --max-time {} {}",
            timeout.as_secs().max(1),
            quote(url)
        );
        match self.execute(handle, &command).await {
            Ok(output) => curl_outcome(&output),
            Err(e) => ProbeOutcome::NotReady(e.to_string()),
        }
    }

    /// Give the target back. Idempotent and infallible: failures are logged.
    async fn release(&self, handle: &ResourceHandle);
}

/// Interpret the output of the curl probe command.
pub(crate) fn curl_outcome(output: &CommandOutput) -> ProbeOutcome {
    let code = output.stdout.trim();
    match output.exit_code {
        0 if code.starts_with('2') => ProbeOutcome::Healthy,
        0 => ProbeOutcome::NotReady(format!("HTTP {code}")),
        7 => ProbeOutcome::NotReady("connection refused".to_string()),
        28 => ProbeOutcome::NotReady("request timed out".to_string()),
        other => ProbeOutcome::NotReady(format!("curl exited with {other}")),
    }
}

/// Python environment prepared on remote targets before servers start.
#[derive(Debug, Clone, Default)]
pub struct RemoteEnv {
    pub venv: VenvConfig,
    pub dependencies: Vec<String>,
}

impl RemoteEnv {
    pub fn new(venv: VenvConfig, dependencies: Vec<String>) -> Self {
        Self { venv, dependencies }
    }

    fn enabled(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// One script that installs `uv`, creates the venv if missing and
    /// installs the dependency list. `None` when nothing is to be installed.
    pub fn bootstrap_script(&self) -> Option<String> {
        if !self.enabled() {
            return None;
        }
        let venv = quote(&self.venv.path);
        let deps: Vec<String> = self.dependencies.iter().map(|d| quote(d)).collect();
        Some(format!(
            "export PATH=\"$HOME/.local/bin:$HOME/.cargo/bin:$PATH\" && \
             (command -v uv >/dev/null 2>&1 || curl -LsSf https://astral.sh/uv/install.sh | sh) && \
             ([ -x {venv}/bin/python ] || uv venv {venv} --python {python}) && \
             uv pip install --python {venv}/bin/python {deps}",
            python = quote(&self.venv.python_version),
            deps = deps.join(" "),
        ))
    }

    /// Run `command` inside the venv when one was bootstrapped.
    pub fn wrap(&self, command: &str) -> String {
        if self.enabled() {
            format!(". {}/bin/activate && {command}", quote(&self.venv.path))
        } else {
            command.to_string()
        }
    }
}

/// Build the provider for `kind` from the sweep configuration.
pub fn build_provider(config: &SweepConfig, kind: ProviderKind) -> Result<Arc<dyn ResourceProvider>> {
    match kind {
        ProviderKind::Local => Ok(Arc::new(LocalProvider::new())),
        ProviderKind::Remote => {
            let remote = config.require_remote()?;
            Ok(Arc::new(SshProvider::from_config(remote)?))
        }
        ProviderKind::Cloud => {
            let cloud = config.require_cloud()?;
            let api: Arc<dyn CloudApi> = match cloud.provider {
                CloudProviderKind::Runpod => Arc::new(RunPodApi::from_config(cloud)?),
                CloudProviderKind::Skypilot => Arc::new(SkyPilotApi::new(cloud.skypilot.clone())),
            };
            Ok(Arc::new(EphemeralCloudProvider::from_config(api, cloud)))
        }
    }
}
