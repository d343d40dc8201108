//! Ephemeral cloud instances.
//!
//! [`EphemeralCloudProvider`] creates one instance per acquisition through a
//! [`CloudApi`] backend, waits until it is reachable over SSH, and destroys it
//! on release. API calls that fail transiently are retried with bounded
//! exponential backoff (see [`super::retry`]).
//!
//! Every instance gets a fresh name before it is requested. Creation is not
//! idempotent, so a failed create is followed by a lookup under that name: an
//! instance that exists anyway is adopted instead of requested twice, or
//! handed back as a partial resource to be destroyed.

use super::retry::with_retry;
use super::ssh::{SshAuth, SshTarget, bootstrap, expand_home};
use super::{CommandOutput, ProviderKind, RemoteEnv, ResourceHandle, ResourceProvider, Target};
use crate::config::{CloudConfig, RetryConfig};
use crate::error::{AcquireFailure, Result, SweepError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Network address of a ready instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
}

/// Lifecycle state reported by a cloud backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Pending(String),
    Ready(Endpoint),
    Terminated,
    Failed(String),
}

/// Minimal lifecycle contract of a cloud backend.
#[async_trait]
pub trait CloudApi: Send + Sync {
    fn name(&self) -> &str;

    /// Prefix of the instance names handed to [`CloudApi::create_instance`].
    fn name_prefix(&self) -> &str;

    /// Request a new instance called `name` and return its identifier.
    async fn create_instance(&self, name: &str) -> Result<String>;

    /// Identifier of a live instance called `name`, if there is one.
    async fn find_instance(&self, name: &str) -> Result<Option<String>>;

    async fn instance_status(&self, instance_id: &str) -> Result<InstanceStatus>;

    /// Ask for the instance to be destroyed. Does not wait.
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;
}

/// Timing knobs of the ephemeral provider.
#[derive(Debug, Clone)]
pub struct CloudTimings {
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub terminate_timeout: Duration,
}

impl CloudTimings {
    pub fn from_config(cloud: &CloudConfig) -> Self {
        Self {
            ready_timeout: Duration::from_secs(cloud.ready_timeout_secs),
            poll_interval: Duration::from_secs(cloud.poll_interval_secs.max(1)),
            terminate_timeout: Duration::from_secs(cloud.terminate_timeout_secs),
        }
    }
}

pub struct EphemeralCloudProvider {
    api: Arc<dyn CloudApi>,
    timings: CloudTimings,
    retry: RetryConfig,
    auth: SshAuth,
    env: RemoteEnv,
}

impl EphemeralCloudProvider {
    pub fn new(
        api: Arc<dyn CloudApi>,
        timings: CloudTimings,
        retry: RetryConfig,
        auth: SshAuth,
        env: RemoteEnv,
    ) -> Self {
        Self {
            api,
            timings,
            retry,
            auth,
            env,
        }
    }

    pub fn from_config(api: Arc<dyn CloudApi>, cloud: &CloudConfig) -> Self {
        let auth = match &cloud.ssh_key_file {
            Some(key) => SshAuth::Key(expand_home(key)),
            None => SshAuth::Default,
        };
        Self::new(
            api,
            CloudTimings::from_config(cloud),
            cloud.retry.clone(),
            auth,
            RemoteEnv::new(cloud.venv.clone(), cloud.dependencies.clone()),
        )
    }

    fn ssh_target(&self, endpoint: &Endpoint) -> SshTarget {
        let mut target = SshTarget::new(endpoint.host.clone(), self.auth.clone());
        target.port = endpoint.port;
        target.user = endpoint.user.clone();
        target.with_fresh_control_path()
    }

    /// Poll until the instance is reachable over SSH, the deadline passes, or
    /// `cancel` fires.
    async fn wait_reachable(&self, instance_id: &str, cancel: &CancellationToken) -> Result<SshTarget> {
        let deadline = Instant::now() + self.timings.ready_timeout;
        let mut last = String::from("no status yet");
        loop {
            match self.api.instance_status(instance_id).await {
                Ok(InstanceStatus::Ready(endpoint)) => {
                    let target = self.ssh_target(&endpoint);
                    match target.check().await {
                        Ok(()) => return Ok(target),
                        Err(e) => {
                            target.close().await;
                            last = format!("ssh not ready: {e}");
                        }
                    }
                }
                Ok(InstanceStatus::Pending(detail)) => last = detail,
                Ok(InstanceStatus::Failed(reason)) => {
                    return Err(SweepError::provision(format!(
                        "instance {instance_id} failed: {reason}"
                    )));
                }
                Ok(InstanceStatus::Terminated) => {
                    return Err(SweepError::provision(format!(
                        "instance {instance_id} terminated before becoming ready"
                    )));
                }
                Err(e) if e.is_transient() => last = e.to_string(),
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SweepError::provision(format!(
                    "instance {instance_id} not ready after {}s ({last})",
                    self.timings.ready_timeout.as_secs()
                )));
            }
            tracing::debug!(instance_id, status = %last, "Waiting for instance");
            let pause = self.timings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SweepError::provision(format!(
                        "interrupted while waiting for instance {instance_id}"
                    )));
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Request the instance `name`, retrying transient failures.
    async fn create(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, AcquireFailure> {
        let result = with_retry(&self.retry, "create instance", cancel, move || async move {
            match self.api.create_instance(name).await {
                Err(e) if e.is_transient() => match self.lookup(name).await {
                    Some(instance_id) => {
                        tracing::warn!(instance_id = %instance_id, error = %e, "Create failed but the instance exists");
                        Ok(instance_id)
                    }
                    None => Err(e),
                },
                other => other,
            }
        })
        .await;

        let error = match result {
            Ok(instance_id) => return Ok(instance_id),
            Err(SweepError::Api { message, .. }) => SweepError::provision(message),
            Err(other) => other,
        };
        match self.lookup(name).await {
            Some(instance_id) => {
                tracing::warn!(instance_id = %instance_id, "Instance left behind by a failed create");
                Err(AcquireFailure::with_partial(
                    error,
                    ResourceHandle::instance(instance_id, None),
                ))
            }
            None => Err(error.into()),
        }
    }

    async fn lookup(&self, name: &str) -> Option<String> {
        match self.api.find_instance(name).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(name, error = %e, "Could not look up instance by name");
                None
            }
        }
    }

    async fn destroy(&self, instance_id: &str) -> Result<()> {
        // Teardown also runs after an interrupt and must not be cut short by it.
        let never = CancellationToken::new();
        with_retry(&self.retry, "terminate instance", &never, || {
            self.api.terminate_instance(instance_id)
        })
        .await?;

        let deadline = Instant::now() + self.timings.terminate_timeout;
        loop {
            match self.api.instance_status(instance_id).await {
                Ok(InstanceStatus::Terminated) => return Ok(()),
                Ok(other) => tracing::debug!(instance_id, status = ?other, "Waiting for termination"),
                Err(e) => tracing::debug!(instance_id, error = %e, "Status check failed during termination"),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SweepError::cleanup(format!(
                    "instance {instance_id} still not terminated after {}s",
                    self.timings.terminate_timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl ResourceProvider for EphemeralCloudProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<ResourceHandle, AcquireFailure> {
        let name = format!(
            "{}-{}",
            self.api.name_prefix(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let instance_id = self.create(&name, cancel).await?;
        tracing::info!(backend = self.api.name(), name = %name, instance_id = %instance_id, "Instance requested");

        let target = match self.wait_reachable(&instance_id, cancel).await {
            Ok(target) => target,
            Err(e) => {
                return Err(AcquireFailure::with_partial(
                    e,
                    ResourceHandle::instance(instance_id, None),
                ));
            }
        };
        tracing::info!(instance_id = %instance_id, host = %target.destination(), "Instance reachable");

        let handle = ResourceHandle::instance(instance_id, Some(target.clone()));
        if let Err(e) = bootstrap(&target, &self.env).await {
            return Err(AcquireFailure::with_partial(e, handle));
        }
        Ok(handle)
    }

    async fn execute(&self, handle: &ResourceHandle, command: &str) -> Result<CommandOutput> {
        match handle.target() {
            Target::Instance {
                ssh: Some(target), ..
            } => target.run(&self.env.wrap(command)).await,
            _ => Err(SweepError::connection(format!(
                "{} has no reachable address",
                handle.describe()
            ))),
        }
    }

    async fn release(&self, handle: &ResourceHandle) {
        if !handle.claim_release() {
            return;
        }
        let Target::Instance { instance_id, ssh } = handle.target() else {
            return;
        };
        if let Some(target) = ssh {
            target.close().await;
        }
        tracing::info!(backend = self.api.name(), instance_id = %instance_id, "Destroying instance");
        match self.destroy(instance_id).await {
            Ok(()) => tracing::info!(instance_id = %instance_id, "Instance destroyed"),
            Err(e) => tracing::error!(
                instance_id = %instance_id,
                error = %e,
                "Failed to destroy instance; delete it manually to stop billing"
            ),
        }
    }
}
