//! SSH transport and the remote-host provider.
//!
//! Commands go through the system `ssh` client (wrapped in `sshpass -e` for
//! password logins). Each acquired handle gets its own ControlMaster socket
//! so every command after the first reuses one authenticated connection, and
//! releasing the handle closes it.

use super::{CommandOutput, ProviderKind, RemoteEnv, ResourceHandle, ResourceProvider, Target};
use crate::config::{RemoteConfig, Secret};
use crate::error::{AcquireFailure, Result, SweepError};
use crate::shell::redact_secrets;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How to authenticate to a host.
#[derive(Debug, Clone, PartialEq)]
pub enum SshAuth {
    /// Whatever the local ssh client is configured with (agent, ssh config).
    Default,
    Key(PathBuf),
    Password(Secret),
}

/// Connection descriptor for one host.
#[derive(Debug, Clone, PartialEq)]
pub struct SshTarget {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub auth: SshAuth,
    pub control_path: Option<PathBuf>,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: None,
            user: None,
            auth,
            control_path: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Copy of this target with a fresh ControlMaster socket path.
    pub fn with_fresh_control_path(&self) -> Self {
        let mut target = self.clone();
        let tag = Uuid::new_v4().simple().to_string();
        target.control_path = Some(std::env::temp_dir().join(format!("llmsweep-{}.sock", &tag[..12])));
        target
    }

    /// `user@host` or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    /// Options shared by every ssh invocation against this target.
    pub fn options(&self) -> Vec<String> {
        let mut opts: Vec<String> = [
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=10",
            "-o",
            "ServerAliveInterval=30",
            "-o",
            "LogLevel=ERROR",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        match &self.auth {
            SshAuth::Password(_) => {
                opts.extend(["-o".into(), "PubkeyAuthentication=no".into()]);
            }
            SshAuth::Key(key) => {
                opts.extend(["-o".into(), "BatchMode=yes".into()]);
                opts.extend(["-i".into(), key.display().to_string()]);
            }
            SshAuth::Default => {
                opts.extend(["-o".into(), "BatchMode=yes".into()]);
            }
        }
        if let Some(control) = &self.control_path {
            opts.extend([
                "-o".into(),
                "ControlMaster=auto".into(),
                "-o".into(),
                format!("ControlPath={}", control.display()),
                "-o".into(),
                "ControlPersist=600".into(),
            ]);
        }
        if let Some(port) = self.port {
            opts.extend(["-p".into(), port.to_string()]);
        }
        opts
    }

    fn command(&self) -> Command {
        match &self.auth {
            SshAuth::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password.expose());
                cmd
            }
            _ => Command::new("ssh"),
        }
    }

    /// Run `command` on the host through the remote login shell.
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(
            host = %self.destination(),
            command = %redact_secrets(command),
            "Executing over SSH"
        );
        let output = self
            .command()
            .args(self.options())
            .arg(self.destination())
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SweepError::connection(format!("failed to spawn ssh: {e}")))?;
        Ok(CommandOutput::from_output(output))
    }

    /// Confirm the host accepts our credentials.
    pub async fn check(&self) -> Result<()> {
        let out = self.run("true").await?;
        if out.success() {
            Ok(())
        } else {
            Err(SweepError::connection(format!(
                "ssh {} failed (exit {}): {}",
                self.destination(),
                out.exit_code,
                out.stderr_tail(5)
            )))
        }
    }

    /// Close the ControlMaster connection, if any.
    pub async fn close(&self) {
        let Some(control) = &self.control_path else {
            return;
        };
        let result = Command::new("ssh")
            .arg("-O")
            .arg("exit")
            .arg("-o")
            .arg(format!("ControlPath={}", control.display()))
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!(host = %self.destination(), error = %e, "Failed to close SSH control connection");
        }
        let _ = tokio::fs::remove_file(control).await;
    }
}

/// Expand a leading `~/` using `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

/// Provider for a pre-existing host.
pub struct SshProvider {
    target: SshTarget,
    env: RemoteEnv,
}

impl SshProvider {
    pub fn new(target: SshTarget, env: RemoteEnv) -> Self {
        Self { target, env }
    }

    pub fn from_config(remote: &RemoteConfig) -> Result<Self> {
        let host = remote
            .host
            .clone()
            .ok_or_else(|| SweepError::config("remote.host is required"))?;
        let auth = match (&remote.password, &remote.key_file) {
            (Some(password), _) => SshAuth::Password(password.clone()),
            (None, Some(key)) => SshAuth::Key(expand_home(key)),
            (None, None) => SshAuth::Default,
        };
        let target = SshTarget::new(host, auth)
            .with_port(remote.port)
            .with_user(remote.username.clone());
        Ok(Self::new(
            target,
            RemoteEnv::new(remote.venv.clone(), remote.dependencies.clone()),
        ))
    }
}

#[async_trait]
impl ResourceProvider for SshProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    async fn acquire(
        &self,
        _cancel: &CancellationToken,
    ) -> std::result::Result<ResourceHandle, AcquireFailure> {
        let target = self.target.with_fresh_control_path();
        if let Err(e) = target.check().await {
            // The master may have come up before the failure.
            target.close().await;
            return Err(e.into());
        }
        tracing::info!(host = %target.destination(), "SSH connection established");
        let handle = ResourceHandle::ssh(target.clone());
        if let Err(e) = bootstrap(&target, &self.env).await {
            return Err(AcquireFailure::with_partial(e, handle));
        }
        Ok(handle)
    }

    async fn execute(&self, handle: &ResourceHandle, command: &str) -> Result<CommandOutput> {
        match handle.target() {
            Target::Ssh(target) => target.run(&self.env.wrap(command)).await,
            _ => Err(SweepError::connection(format!(
                "handle {} is not an SSH target",
                handle.describe()
            ))),
        }
    }

    async fn release(&self, handle: &ResourceHandle) {
        if !handle.claim_release() {
            return;
        }
        if let Target::Ssh(target) = handle.target() {
            target.close().await;
            tracing::info!(host = %target.destination(), "SSH session closed");
        }
    }
}

/// Prepare the Python environment on a freshly reached host.
pub(crate) async fn bootstrap(target: &SshTarget, env: &RemoteEnv) -> Result<()> {
    let Some(script) = env.bootstrap_script() else {
        return Ok(());
    };
    tracing::info!(
        host = %target.destination(),
        venv = %env.venv.path,
        dependencies = env.dependencies.len(),
        "Installing remote dependencies"
    );
    let out = target.run(&script).await?;
    if out.success() {
        Ok(())
    } else {
        Err(SweepError::provision(format!(
            "dependency installation failed on {} (exit {}): {}",
            target.destination(),
            out.exit_code,
            out.stderr_tail(10)
        )))
    }
}
