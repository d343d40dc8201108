//! Run orchestration.
//!
//! For each server group, in sweep order:
//!
//! 1. skip it outright if every trial already has a result
//! 2. acquire a resource (releasing any partial one on failure)
//! 3. start the server and wait for it to become healthy
//! 4. run the pending trials one by one
//! 5. stop the server and release the resource
//!
//! Steps 3 to 5 happen inside an [`ActiveSession`], so the server is stopped
//! and the resource released on every path out of the group, including
//! cancellation. A group that cannot be provisioned or served has its trials
//! marked skipped and the run moves on to the next group.

use crate::artifacts::ArtifactStore;
use crate::config::SweepConfig;
use crate::error::Result;
use crate::executor::TrialExecutor;
use crate::provider::ResourceProvider;
use crate::result::TrialResult;
use crate::server::{ServerManager, ServerSettings};
use crate::session::ActiveSession;
use crate::summary::{GroupOutcome, GroupRecord, RunSummary};
use crate::sweep::{ServerGroup, Trial, expand_all, group_trials};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INTERRUPTED_BEFORE_START: &str = "run interrupted before this trial started";

/// How a whole run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every trial reached a terminal state.
    Completed,
    Interrupted,
    /// Every group that was attempted failed to provision or start.
    NothingStarted,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub summary: RunSummary,
    /// Where the summary was written, if writing succeeded.
    pub summary_path: Option<PathBuf>,
}

/// Expand and group a sweep without touching any resource.
pub fn plan(config: &SweepConfig) -> Result<Vec<ServerGroup>> {
    Ok(group_trials(expand_all(config)?))
}

struct GroupRun {
    outcome: GroupOutcome,
    error: Option<String>,
    results: Vec<TrialResult>,
}

impl GroupRun {
    fn skipped(outcome: GroupOutcome, error: Option<String>, trials: &[&Trial], reason: &str) -> Self {
        Self {
            outcome,
            error,
            results: trials.iter().map(|t| TrialResult::skipped(t, reason)).collect(),
        }
    }
}

/// Drives a sweep through one provider.
pub struct RunOrchestrator {
    provider: Arc<dyn ResourceProvider>,
    servers: Arc<ServerManager>,
    executor: TrialExecutor,
    ready_timeout: Duration,
    cooldown: Duration,
    output_dir: PathBuf,
}

impl RunOrchestrator {
    pub fn new(provider: Arc<dyn ResourceProvider>, config: &SweepConfig) -> Self {
        let settings = ServerSettings::from_config(config);
        let ready_timeout = settings.ready_timeout;
        let executor = TrialExecutor::new(
            Arc::clone(&provider),
            ArtifactStore::new(config.on_existing),
            &config.workdir,
            config.trial_timeout_secs.map(Duration::from_secs),
        );
        Self {
            servers: Arc::new(ServerManager::new(Arc::clone(&provider), settings)),
            provider,
            executor,
            ready_timeout,
            cooldown: Duration::from_secs(config.cooldown_secs),
            output_dir: config.output_dir.clone(),
        }
    }

    /// Expand `config` and run every trial. Configuration errors are
    /// returned before any resource is touched; everything after that is
    /// recorded in the summary.
    pub async fn run_sweep(&self, config: &SweepConfig, cancel: &CancellationToken) -> Result<RunReport> {
        let groups = plan(config)?;
        Ok(self.run_groups(groups, cancel).await)
    }

    pub async fn run_groups(&self, groups: Vec<ServerGroup>, cancel: &CancellationToken) -> RunReport {
        let mut summary = RunSummary::new(self.provider.kind().to_string());
        let total: usize = groups.iter().map(|g| g.trials.len()).sum();
        tracing::info!(
            sweep = %summary.sweep_id,
            provider = %self.provider.kind(),
            groups = groups.len(),
            trials = total,
            "Starting sweep"
        );

        let last = groups.len().saturating_sub(1);
        for group in &groups {
            let mut resumed = Vec::new();
            let mut pending = Vec::new();
            for trial in &group.trials {
                match self.executor.artifacts().completed(trial).await {
                    Some(done) => resumed.push(done),
                    None => pending.push(trial),
                }
            }
            if !resumed.is_empty() {
                tracing::info!(
                    server = %group.server.label(),
                    resumed = resumed.len(),
                    pending = pending.len(),
                    "Skipping trials with existing results"
                );
            }
            if pending.is_empty() {
                let run = GroupRun {
                    outcome: GroupOutcome::AlreadyComplete,
                    error: None,
                    results: resumed,
                };
                self.record(&mut summary, group, run);
                continue;
            }

            if cancel.is_cancelled() {
                let mut run =
                    GroupRun::skipped(GroupOutcome::NotAttempted, None, &pending, INTERRUPTED_BEFORE_START);
                run.results.extend(resumed);
                self.record(&mut summary, group, run);
                continue;
            }

            let mut run = self.run_group(group, &pending, cancel).await;
            run.results.extend(resumed);
            let touched_server = matches!(run.outcome, GroupOutcome::Completed | GroupOutcome::ServerFailed);
            self.record(&mut summary, group, run);

            if touched_server && group.index < last && !self.cooldown.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.cooldown) => {}
                }
            }
        }

        let interrupted = cancel.is_cancelled();
        summary.finish(interrupted);
        let summary_path = match summary.persist(&self.output_dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(dir = %self.output_dir.display(), error = %e, "Could not write sweep summary");
                None
            }
        };
        let outcome = if interrupted {
            RunOutcome::Interrupted
        } else if summary.nothing_started() {
            RunOutcome::NothingStarted
        } else {
            RunOutcome::Completed
        };
        tracing::info!(
            outcome = ?outcome,
            success = summary.counts.success,
            failed = summary.counts.failed,
            skipped = summary.counts.skipped,
            "Sweep finished"
        );
        RunReport {
            outcome,
            summary,
            summary_path,
        }
    }

    async fn run_group(&self, group: &ServerGroup, pending: &[&Trial], cancel: &CancellationToken) -> GroupRun {
        tracing::info!(
            group = group.index,
            server = %group.server.label(),
            trials = pending.len(),
            "Acquiring resource"
        );
        let resource = match self.provider.acquire(cancel).await {
            Ok(resource) => resource,
            Err(failure) => {
                if let Some(partial) = &failure.partial {
                    tracing::warn!(resource = %partial.describe(), "Releasing partially acquired resource");
                    self.provider.release(partial).await;
                }
                if cancel.is_cancelled() {
                    return GroupRun::skipped(GroupOutcome::Interrupted, None, pending, INTERRUPTED_BEFORE_START);
                }
                tracing::error!(group = group.index, error = %failure.error, "Provisioning failed");
                let reason = format!("provisioning failed: {}", failure.error);
                return GroupRun::skipped(GroupOutcome::ProvisionFailed, Some(failure.error.to_string()), pending, &reason);
            }
        };

        let mut session = ActiveSession::new(Arc::clone(&self.provider), Arc::clone(&self.servers), resource);
        let run = self.serve_group(&mut session, group, pending, cancel).await;
        session.teardown().await;
        run
    }

    async fn serve_group(
        &self,
        session: &mut ActiveSession,
        group: &ServerGroup,
        pending: &[&Trial],
        cancel: &CancellationToken,
    ) -> GroupRun {
        if cancel.is_cancelled() {
            return GroupRun::skipped(GroupOutcome::Interrupted, None, pending, INTERRUPTED_BEFORE_START);
        }
        let Some(resource) = session.resource().cloned() else {
            return GroupRun::skipped(GroupOutcome::ProvisionFailed, None, pending, "no resource");
        };
        match self.servers.start(&resource, Arc::clone(&group.server)).await {
            Ok(server) => session.attach_server(server),
            Err(e) => {
                tracing::error!(group = group.index, error = %e, "Server failed to start");
                let reason = format!("server failed to start: {e}");
                return GroupRun::skipped(GroupOutcome::ServerFailed, Some(e.to_string()), pending, &reason);
            }
        }

        let ready = match session.server_mut() {
            Some(server) => tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                ready = self.servers.wait_ready(server, self.ready_timeout) => Some(ready),
            },
            None => None,
        };
        match ready {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                let reason = format!("server never became healthy: {e}");
                return GroupRun::skipped(GroupOutcome::ServerFailed, Some(e.to_string()), pending, &reason);
            }
            None => return GroupRun::skipped(GroupOutcome::Interrupted, None, pending, INTERRUPTED_BEFORE_START),
        }

        let mut results = Vec::with_capacity(pending.len());
        for trial in pending {
            if cancel.is_cancelled() {
                break;
            }
            let Some(server) = session.server() else { break };
            results.push(self.executor.run(trial, server, cancel).await);
        }
        // Trials after an interruption never started.
        results.extend(
            pending[results.len()..]
                .iter()
                .map(|t| TrialResult::skipped(t, INTERRUPTED_BEFORE_START)),
        );
        let outcome = if cancel.is_cancelled() {
            GroupOutcome::Interrupted
        } else {
            GroupOutcome::Completed
        };
        GroupRun {
            outcome,
            error: None,
            results,
        }
    }

    /// Add a group's results to the summary in sweep order.
    fn record(&self, summary: &mut RunSummary, group: &ServerGroup, run: GroupRun) {
        let mut by_id: HashMap<String, TrialResult> = run
            .results
            .into_iter()
            .map(|r| (r.trial_id.clone(), r))
            .collect();
        for trial in &group.trials {
            if let Some(result) = by_id.remove(&trial.id) {
                summary.record_trial(result);
            }
        }
        summary.record_group(GroupRecord {
            index: group.index,
            server: group.server.label(),
            trials: group.trials.len(),
            outcome: run.outcome,
            error: run.error,
        });
    }
}
