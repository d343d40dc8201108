//! Inference server lifecycle.
//!
//! A server is started in the background on a target, polled over HTTP until
//! it reports healthy, and stopped with SIGINT followed by SIGKILL after a
//! grace period. Its state follows an explicit machine:
//!
//! ```text
//! Starting --healthy--> Healthy --stop--> Stopped
//! Starting --deadline--> Failed
//! Starting --stop--> Stopped          (interrupted before ready)
//! ```

use crate::config::SweepConfig;
use crate::error::{Result, SweepError};
use crate::provider::{ProbeOutcome, ResourceHandle, ResourceProvider};
use crate::shell::quote;
use crate::sweep::ServerConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Liveness state of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Starting,
    Healthy,
    Stopped,
    Failed,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Starting => write!(f, "starting"),
            ServerState::Healthy => write!(f, "healthy"),
            ServerState::Stopped => write!(f, "stopped"),
            ServerState::Failed => write!(f, "failed"),
        }
    }
}

/// Inputs that move a server between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// A health probe succeeded.
    HealthPassed,
    /// The readiness deadline elapsed or the process died while starting.
    DeadlineExceeded,
    /// An explicit stop.
    Stop,
}

impl std::fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerEvent::HealthPassed => write!(f, "health_passed"),
            ServerEvent::DeadlineExceeded => write!(f, "deadline_exceeded"),
            ServerEvent::Stop => write!(f, "stop"),
        }
    }
}

impl ServerState {
    /// Apply `event`, rejecting moves the lifecycle does not allow.
    pub fn transition(self, event: ServerEvent) -> Result<ServerState> {
        match (self, event) {
            (ServerState::Starting, ServerEvent::HealthPassed) => Ok(ServerState::Healthy),
            (ServerState::Starting, ServerEvent::DeadlineExceeded) => Ok(ServerState::Failed),
            (ServerState::Starting, ServerEvent::Stop) => Ok(ServerState::Stopped),
            (ServerState::Healthy, ServerEvent::Stop) => Ok(ServerState::Stopped),
            (from, event) => Err(SweepError::IllegalTransition { from, event }),
        }
    }

    /// Whether a process may still be running.
    pub fn is_live(self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Healthy)
    }
}

/// A server process started on a target.
#[derive(Debug)]
pub struct ServerHandle {
    resource: ResourceHandle,
    config: Arc<ServerConfig>,
    state: ServerState,
    pid: u32,
    log_path: String,
    started_at: DateTime<Utc>,
    healthy_at: Option<DateTime<Utc>>,
}

impl ServerHandle {
    pub fn resource(&self) -> &ResourceHandle {
        &self.resource
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_path(&self) -> &str {
        &self.log_path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn healthy_at(&self) -> Option<DateTime<Utc>> {
        self.healthy_at
    }

    /// Base URL of the server as seen from its own target.
    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.config.port)
    }

    fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.config.engine.health_path())
    }

    fn apply(&mut self, event: ServerEvent) -> Result<()> {
        self.state = self.state.transition(event)?;
        if self.state == ServerState::Healthy {
            self.healthy_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Timing and placement settings of the lifecycle manager.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Scratch directory on the target for server logs.
    pub workdir: String,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub ready_timeout: Duration,
    pub stop_grace: Duration,
}

impl ServerSettings {
    pub fn from_config(config: &SweepConfig) -> Self {
        Self {
            workdir: config.workdir.clone(),
            poll_interval: config.health.interval(),
            request_timeout: config.health.request_timeout(),
            ready_timeout: config.health.timeout(),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
        }
    }
}

/// Starts, health-checks and stops servers through a provider.
pub struct ServerManager {
    provider: Arc<dyn ResourceProvider>,
    settings: ServerSettings,
    /// Resources that currently host a live server.
    occupied: Mutex<HashSet<Uuid>>,
}

impl ServerManager {
    pub fn new(provider: Arc<dyn ResourceProvider>, settings: ServerSettings) -> Self {
        Self {
            provider,
            settings,
            occupied: Mutex::new(HashSet::new()),
        }
    }

    /// Launch the server in the background and record its process id.
    /// Does not wait for readiness.
    pub async fn start(
        &self,
        resource: &ResourceHandle,
        config: Arc<ServerConfig>,
    ) -> Result<ServerHandle> {
        if !self.occupy(resource) {
            return Err(SweepError::server_start(format!(
                "{} already hosts a running server",
                resource.describe()
            )));
        }
        match self.launch(resource, &config).await {
            Ok((pid, log_path)) => {
                tracing::info!(
                    server = %config.label(),
                    pid,
                    log = %log_path,
                    target = %resource.describe(),
                    "Server starting"
                );
                Ok(ServerHandle {
                    resource: resource.clone(),
                    config,
                    state: ServerState::Starting,
                    pid,
                    log_path,
                    started_at: Utc::now(),
                    healthy_at: None,
                })
            }
            Err(e) => {
                self.vacate(resource);
                Err(e)
            }
        }
    }

    async fn launch(&self, resource: &ResourceHandle, config: &ServerConfig) -> Result<(u32, String)> {
        let workdir = quote(&self.settings.workdir);
        let log_path = format!(
            "{}/server-{}-{}.log",
            self.settings.workdir, config.port, config.layout
        );
        let serve = config.engine.serve_command(config);
        tracing::debug!(command = %serve, "Launching server");
        // `setsid` makes the server a process group leader so stop() can
        // signal its worker processes too.
        let script = format!(
            "mkdir -p {workdir}; nohup setsid {} > {} 2>&1 < /dev/null & echo $!",
            serve.to_shell(),
            quote(&log_path),
        );
        let out = self.provider.execute(resource, &script).await?;
        if !out.success() {
            return Err(SweepError::server_start(format!(
                "launch command exited with {}: {}",
                out.exit_code,
                out.stderr_tail(5)
            )));
        }
        let pid = out
            .stdout
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                SweepError::server_start(format!("no process id in launch output: {:?}", out.stdout))
            })?;
        Ok((pid, log_path))
    }

    /// Poll the health endpoint until it answers 2xx or `timeout` elapses.
    ///
    /// Refused connections and error statuses count as "not yet". On timeout,
    /// or if the process exits while starting, the server is killed and moves
    /// to `Failed`.
    pub async fn wait_ready(&self, server: &mut ServerHandle, timeout: Duration) -> Result<()> {
        if server.state != ServerState::Starting {
            return Err(SweepError::IllegalTransition {
                from: server.state,
                event: ServerEvent::HealthPassed,
            });
        }
        let deadline = Instant::now() + timeout;
        let url = server.health_url();
        let mut last = String::from("no probe completed");
        let mut polls = 0u32;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let budget = self.settings.request_timeout.min(deadline - now);
            polls += 1;
            match tokio::time::timeout(budget, self.provider.probe(&server.resource, &url, budget)).await {
                Ok(ProbeOutcome::Healthy) => {
                    server.apply(ServerEvent::HealthPassed)?;
                    let waited = Utc::now() - server.started_at;
                    tracing::info!(
                        server = %server.config.label(),
                        polls,
                        waited_secs = waited.num_seconds(),
                        "Server healthy"
                    );
                    return Ok(());
                }
                Ok(ProbeOutcome::NotReady(reason)) => last = reason,
                Err(_) => last = "probe timed out".to_string(),
            }
            if !self.is_alive(server).await {
                let detail = format!("server process exited while starting ({last})");
                return Err(self.fail(server, timeout, detail).await);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tracing::debug!(url = %url, status = %last, "Server not ready");
            tokio::time::sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
        Err(self.fail(server, timeout, last).await)
    }

    /// Stop a live server: SIGINT, wait up to the grace period, then SIGKILL.
    /// Stopping a stopped or failed server does nothing. Failures to deliver
    /// the signals are logged, never returned.
    pub async fn stop(&self, server: &mut ServerHandle) {
        if !server.state.is_live() {
            return;
        }
        let grace = self.settings.stop_grace.as_secs();
        let script = stop_script(server.pid, grace);
        match self.provider.execute(&server.resource, &script).await {
            Ok(out) if out.success() => {}
            Ok(out) => tracing::warn!(
                pid = server.pid,
                exit_code = out.exit_code,
                stderr = %out.stderr_tail(3),
                "Stop command reported an error"
            ),
            Err(e) => tracing::warn!(
                pid = server.pid,
                error = %SweepError::cleanup(e.to_string()),
                "Could not stop server"
            ),
        }
        if let Err(e) = server.apply(ServerEvent::Stop) {
            tracing::warn!(error = %e, "Unexpected server state during stop");
        }
        self.vacate(&server.resource);
        tracing::info!(server = %server.config.label(), "Server stopped");
    }

    async fn is_alive(&self, server: &ServerHandle) -> bool {
        let check = format!("kill -0 {} 2>/dev/null", server.pid);
        match self.provider.execute(&server.resource, &check).await {
            Ok(out) => out.success(),
            // Unknown is treated as alive; the deadline still bounds the wait.
            Err(_) => true,
        }
    }

    async fn fail(&self, server: &mut ServerHandle, timeout: Duration, reason: String) -> SweepError {
        let log_tail = self.log_tail(server).await;
        let kill = format!(
            "kill -s KILL -- -{pid} 2>/dev/null || kill -s KILL {pid} 2>/dev/null; true",
            pid = server.pid
        );
        if let Err(e) = self.provider.execute(&server.resource, &kill).await {
            tracing::warn!(pid = server.pid, error = %e, "Could not kill failed server");
        }
        if let Err(e) = server.apply(ServerEvent::DeadlineExceeded) {
            tracing::warn!(error = %e, "Unexpected server state on failure");
        }
        self.vacate(&server.resource);
        tracing::error!(
            server = %server.config.label(),
            reason = %reason,
            "Server failed to become healthy"
        );
        let detail = if log_tail.is_empty() {
            reason
        } else {
            format!("{reason}; log tail:\n{log_tail}")
        };
        SweepError::HealthTimeout {
            timeout_secs: timeout.as_secs(),
            detail,
        }
    }

    async fn log_tail(&self, server: &ServerHandle) -> String {
        let cmd = format!("tail -n 20 {} 2>/dev/null", quote(&server.log_path));
        match self.provider.execute(&server.resource, &cmd).await {
            Ok(out) if out.success() => out.stdout.trim_end().to_string(),
            _ => String::new(),
        }
    }

    fn occupy(&self, resource: &ResourceHandle) -> bool {
        match self.occupied.lock() {
            Ok(mut set) => set.insert(resource.id()),
            Err(poisoned) => poisoned.into_inner().insert(resource.id()),
        }
    }

    fn vacate(&self, resource: &ResourceHandle) {
        match self.occupied.lock() {
            Ok(mut set) => set.remove(&resource.id()),
            Err(poisoned) => poisoned.into_inner().remove(&resource.id()),
        };
    }
}

/// Shell script delivering SIGINT to the server's process group, waiting up
/// to `grace_secs`, then SIGKILL.
fn stop_script(pid: u32, grace_secs: u64) -> String {
    format!(
        "P={pid}; kill -s INT -- -$P 2>/dev/null || kill -s INT $P 2>/dev/null; \
         i=0; while kill -0 $P 2>/dev/null && [ $i -lt {grace_secs} ]; do sleep 1; i=$((i+1)); done; \
         if kill -0 $P 2>/dev/null; then kill -s KILL -- -$P 2>/dev/null || kill -s KILL $P 2>/dev/null; fi; true"
    )
}
