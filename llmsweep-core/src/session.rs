//! The active session: one acquired resource and the server running on it.
//!
//! [`ActiveSession`] is the only place that holds live handles. Cleanup goes
//! through [`ActiveSession::teardown`], which stops the server and then
//! releases the resource. Each handle is taken out of the session before it
//! is cleaned up, so a second teardown (a repeated signal, an error path
//! after an interrupt) finds nothing left to do.
//!
//! If a session is dropped without teardown, the drop spawns the same
//! cleanup on the current runtime as a last resort.

use crate::provider::{ResourceHandle, ResourceProvider};
use crate::server::{ServerHandle, ServerManager};
use std::sync::Arc;

pub struct ActiveSession {
    provider: Arc<dyn ResourceProvider>,
    servers: Arc<ServerManager>,
    resource: Option<ResourceHandle>,
    server: Option<ServerHandle>,
}

impl ActiveSession {
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        servers: Arc<ServerManager>,
        resource: ResourceHandle,
    ) -> Self {
        Self {
            provider,
            servers,
            resource: Some(resource),
            server: None,
        }
    }

    pub fn resource(&self) -> Option<&ResourceHandle> {
        self.resource.as_ref()
    }

    pub fn server(&self) -> Option<&ServerHandle> {
        self.server.as_ref()
    }

    pub fn server_mut(&mut self) -> Option<&mut ServerHandle> {
        self.server.as_mut()
    }

    /// Put a started server under the session's care.
    pub fn attach_server(&mut self, server: ServerHandle) {
        if let Some(previous) = self.server.replace(server) {
            tracing::warn!(pid = previous.pid(), "Replacing a server that was never stopped");
        }
    }

    /// Whether anything still needs cleaning up.
    pub fn is_active(&self) -> bool {
        self.resource.is_some() || self.server.is_some()
    }

    /// Stop the server, then release the resource. Runs at most once; never
    /// fails.
    pub async fn teardown(&mut self) {
        if let Some(mut server) = self.server.take() {
            self.servers.stop(&mut server).await;
        }
        if let Some(resource) = self.resource.take() {
            tracing::info!(resource = %resource.describe(), "Releasing resource");
            self.provider.release(&resource).await;
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if !self.is_active() {
            return;
        }
        let server = self.server.take();
        let resource = self.resource.take();
        let provider = Arc::clone(&self.provider);
        let servers = Arc::clone(&self.servers);
        tracing::warn!("Session dropped without teardown, cleaning up in the background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(mut server) = server {
                        servers.stop(&mut server).await;
                    }
                    if let Some(resource) = resource {
                        provider.release(&resource).await;
                    }
                });
            }
            Err(_) => tracing::error!(
                resource = ?resource.as_ref().map(ResourceHandle::describe),
                "No runtime to clean up on; resource may be leaked"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::error::{AcquireFailure, Result};
    use crate::provider::{CommandOutput, ProbeOutcome, ProviderKind};
    use crate::server::{ServerSettings, ServerState};
    use crate::sweep::expand;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct CountingProvider {
        releases: AtomicU32,
        stops: AtomicU32,
    }

    #[async_trait]
    impl ResourceProvider for CountingProvider {
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
            if command.contains("kill -s INT") {
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
            let stdout = if command.contains("nohup") { "7\n".to_string() } else { String::new() };
            Ok(CommandOutput { exit_code: 0, stdout, stderr: String::new() })
        }

        async fn probe(&self, _h: &ResourceHandle, _url: &str, _t: Duration) -> ProbeOutcome {
            ProbeOutcome::Healthy
        }

        async fn release(&self, handle: &ResourceHandle) {
            if handle.claim_release() {
                self.releases.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn manager(provider: Arc<CountingProvider>) -> Arc<ServerManager> {
        Arc::new(ServerManager::new(
            provider,
            ServerSettings {
                workdir: "/tmp/llmsweep".into(),
                poll_interval: Duration::from_secs(1),
                request_timeout: Duration::from_secs(1),
                ready_timeout: Duration::from_secs(10),
                stop_grace: Duration::from_secs(1),
            },
        ))
    }

    async fn session_with_server(provider: Arc<CountingProvider>) -> ActiveSession {
        let run: RunConfig = serde_json::from_value(serde_json::json!({
            "name": "s",
            "model": { "repo_id": "org/model" },
            "serve": { "parallelism": [{ "tensor": 1 }] },
            "benchmark": {
                "context_sizes": [1], "concurrency": [1],
                "num_prompts": [1], "output_lengths": [1]
            }
        }))
        .unwrap();
        let config = expand(&run).unwrap()[0].server.clone();
        let servers = manager(provider.clone());
        let resource = ResourceHandle::local();
        let mut session = ActiveSession::new(provider, servers.clone(), resource.clone());
        let server = servers.start(&resource, config).await.unwrap();
        session.attach_server(server);
        session
    }

    #[tokio::test]
    async fn test_teardown_runs_once() {
        let provider = Arc::new(CountingProvider::default());
        let mut session = session_with_server(provider.clone()).await;
        assert!(session.is_active());

        session.teardown().await;
        session.teardown().await;
        assert!(!session.is_active());
        assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
        assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_stops_before_release() {
        let provider = Arc::new(CountingProvider::default());
        let mut session = session_with_server(provider.clone()).await;
        assert_eq!(session.server().map(ServerHandle::state), Some(ServerState::Starting));
        session.teardown().await;
        assert!(session.server().is_none());
        assert!(session.resource().is_none());
    }

    #[tokio::test]
    async fn test_drop_without_teardown_still_releases() {
        let provider = Arc::new(CountingProvider::default());
        let session = session_with_server(provider.clone()).await;
        drop(session);
        for _ in 0..50 {
            if provider.releases.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.stops.load(Ordering::SeqCst), 1);
        assert_eq!(provider.releases.load(Ordering::SeqCst), 1);
    }
}
