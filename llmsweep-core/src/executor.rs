//! Trial execution.
//!
//! Runs the engine's load generator against a healthy server, collects the
//! JSON result it leaves on the target and records the outcome as an
//! artifact. Nothing here aborts the sweep: every failure becomes a
//! [`TrialStatus::Failed`] result.

use crate::artifacts::ArtifactStore;
use crate::error::{Result, SweepError};
use crate::provider::{CommandOutput, ResourceProvider};
use crate::result::{INTERRUPTED, TrialResult, TrialStatus};
use crate::server::ServerHandle;
use crate::shell::quote;
use crate::sweep::Trial;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STDERR_TAIL_LINES: usize = 20;

/// Runs trials one at a time on a provider.
pub struct TrialExecutor {
    provider: Arc<dyn ResourceProvider>,
    artifacts: ArtifactStore,
    /// Directory on the target where the tool writes raw results.
    result_dir: String,
    timeout: Option<Duration>,
}

impl TrialExecutor {
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        artifacts: ArtifactStore,
        workdir: &str,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            provider,
            artifacts,
            result_dir: format!("{}/results", workdir.trim_end_matches('/')),
            timeout,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Run `trial` against `server` and persist the outcome.
    ///
    /// If `cancel` fires while the tool runs, the invocation is dropped and
    /// the trial is recorded as failed with reason `interrupted`.
    pub async fn run(&self, trial: &Trial, server: &ServerHandle, cancel: &CancellationToken) -> TrialResult {
        let started_at = Utc::now();
        tracing::info!(
            trial = %trial.id,
            context = trial.params.context_size,
            concurrency = trial.params.concurrency,
            prompts = trial.params.num_prompts,
            output_len = trial.params.output_len,
            "Running trial"
        );
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!(trial = %trial.id, "Trial interrupted");
                TrialResult::failed(trial, started_at, INTERRUPTED)
            }
            result = self.invoke(trial, server, started_at) => result,
        };
        let result = self.persist(trial, result).await;
        match result.status {
            TrialStatus::Success => tracing::info!(
                trial = %trial.id,
                duration_secs = result.duration_secs,
                "Trial succeeded"
            ),
            _ => tracing::warn!(
                trial = %trial.id,
                reason = result.reason.as_deref().unwrap_or_default(),
                "Trial failed"
            ),
        }
        result
    }

    async fn invoke(&self, trial: &Trial, server: &ServerHandle, started_at: DateTime<Utc>) -> TrialResult {
        let result_file = format!("{}.json", trial.id);
        let remote_path = format!("{}/{}", self.result_dir, result_file);
        let bench = server.config().engine.bench_command(
            trial,
            &server.base_url(),
            &self.result_dir,
            &result_file,
        );
        tracing::debug!(command = %bench, "Benchmark command");
        let script = format!(
            "mkdir -p {dir} && rm -f {path} && {bench} 2>&1",
            dir = quote(&self.result_dir),
            path = quote(&remote_path),
            bench = bench.to_shell(),
        );

        let out = match self.execute(server, &script).await {
            Ok(out) => out,
            Err(e) => return TrialResult::failed(trial, started_at, e.to_string()),
        };
        if let Err(e) = self.artifacts.write_log(trial, &out.stdout).await {
            tracing::warn!(trial = %trial.id, error = %e, "Could not write benchmark log");
        }
        if !out.success() {
            return TrialResult::failed(
                trial,
                started_at,
                format!("benchmark exited with status {}", out.exit_code),
            )
            .with_exit(out.exit_code, output_tail(&out));
        }

        match self.fetch_metrics(server, &remote_path).await {
            Ok(metrics) => TrialResult::success(trial, started_at, metrics),
            Err(e) => TrialResult::failed(trial, started_at, e.to_string()).with_exit(0, String::new()),
        }
    }

    async fn execute(&self, server: &ServerHandle, script: &str) -> Result<CommandOutput> {
        let exec = self.provider.execute(server.resource(), script);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exec).await.map_err(|_| {
                SweepError::Timeout(format!("benchmark did not finish within {}s", limit.as_secs()))
            })?,
            None => exec.await,
        }
    }

    async fn fetch_metrics(&self, server: &ServerHandle, path: &str) -> Result<serde_json::Value> {
        let out = self
            .provider
            .execute(server.resource(), &format!("cat {}", quote(path)))
            .await?;
        if !out.success() {
            return Err(SweepError::trial(format!("benchmark wrote no result file at {path}")));
        }
        parse_result(&out.stdout)
    }

    async fn persist(&self, trial: &Trial, result: TrialResult) -> TrialResult {
        let fallback = result.clone();
        match self.artifacts.record(trial, result).await {
            Ok(recorded) => recorded,
            Err(e) => {
                tracing::error!(trial = %trial.id, error = %e, "Could not write trial artifact");
                // Without its artifact a success would not survive a resume.
                let mut failed = fallback;
                failed.status = TrialStatus::Failed;
                failed.reason = Some(format!("could not write artifact: {e}"));
                failed
            }
        }
    }
}

/// Parse the tool's result file: one JSON document, or JSON lines of which
/// the last is the run just made.
pub fn parse_result(raw: &str) -> Result<serde_json::Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SweepError::trial("benchmark result file is empty"));
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Ok(value);
    }
    trimmed
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str(l).ok())
        .ok_or_else(|| SweepError::trial("benchmark result file is not valid JSON"))
}

fn output_tail(out: &CommandOutput) -> String {
    let source = if out.stderr.trim().is_empty() { &out.stdout } else { &out.stderr };
    let lines: Vec<&str> = source.lines().collect();
    lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OnExisting, RunConfig};
    use crate::error::AcquireFailure;
    use crate::provider::{ProbeOutcome, ProviderKind, ResourceHandle};
    use crate::server::{ServerManager, ServerSettings};
    use crate::sweep::expand;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::Mutex;

    /// Provider answering the benchmark script and the `cat` of its result.
    struct ScriptedProvider {
        bench_exit: i32,
        bench_output: String,
        result_file: Option<String>,
        bench_delay: Duration,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(bench_exit: i32, result_file: Option<&str>) -> Self {
            Self {
                bench_exit,
                bench_output: "Successful requests: 16\n(APIServer) GET /v1/completions\n".into(),
                result_file: result_file.map(str::to_string),
                bench_delay: Duration::ZERO,
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResourceProvider for ScriptedProvider {
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
            self.commands.lock().unwrap().push(command.to_string());
            if command.contains("nohup") {
                return Ok(CommandOutput { exit_code: 0, stdout: "99\n".into(), stderr: String::new() });
            }
            if command.contains("bench serve") {
                tokio::time::sleep(self.bench_delay).await;
                return Ok(CommandOutput {
                    exit_code: self.bench_exit,
                    stdout: self.bench_output.clone(),
                    stderr: if self.bench_exit == 0 { String::new() } else { "CUDA out of memory".into() },
                });
            }
            if command.starts_with("cat ") {
                return Ok(match &self.result_file {
                    Some(body) => CommandOutput { exit_code: 0, stdout: body.clone(), stderr: String::new() },
                    None => CommandOutput { exit_code: 1, stdout: String::new(), stderr: "No such file".into() },
                });
            }
            Ok(CommandOutput::default())
        }

        async fn probe(&self, _h: &ResourceHandle, _url: &str, _t: Duration) -> ProbeOutcome {
            ProbeOutcome::Healthy
        }

        async fn release(&self, handle: &ResourceHandle) {
            handle.claim_release();
        }
    }

    fn trial(dir: &Path) -> Trial {
        let run: RunConfig = serde_json::from_value(serde_json::json!({
            "name": "exec",
            "model": { "repo_id": "org/model" },
            "serve": { "parallelism": [{ "tensor": 1 }] },
            "benchmark": {
                "context_sizes": [1024], "concurrency": [4],
                "num_prompts": [16], "output_lengths": [64],
                "output_dir": dir
            }
        }))
        .unwrap();
        expand(&run).unwrap().remove(0)
    }

    async fn setup(
        provider: ScriptedProvider,
        dir: &Path,
        timeout: Option<Duration>,
    ) -> (Arc<ScriptedProvider>, TrialExecutor, ServerHandle, Trial) {
        let provider = Arc::new(provider);
        let t = trial(dir);
        let settings = ServerSettings {
            workdir: "/tmp/llmsweep".into(),
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(1),
        };
        let manager = ServerManager::new(provider.clone(), settings);
        let mut server = manager.start(&ResourceHandle::local(), t.server.clone()).await.unwrap();
        manager.wait_ready(&mut server, Duration::from_secs(5)).await.unwrap();
        let executor = TrialExecutor::new(
            provider.clone(),
            ArtifactStore::new(OnExisting::Skip),
            "/tmp/llmsweep",
            timeout,
        );
        (provider, executor, server, t)
    }

    #[tokio::test]
    async fn test_successful_trial_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let scripted = ScriptedProvider::new(0, Some(r#"{"mean_ttft_ms": 41.5, "output_throughput": 1200.0}"#));
        let (provider, executor, server, t) = setup(scripted, dir.path(), None).await;

        let result = executor.run(&t, &server, &CancellationToken::new()).await;
        assert_eq!(result.status, TrialStatus::Success);
        assert_eq!(result.metrics.as_ref().unwrap()["mean_ttft_ms"], 41.5);
        assert!(executor.artifacts().result_path(&t).exists());

        let log = std::fs::read_to_string(executor.artifacts().log_path(&t)).unwrap();
        assert!(log.starts_with(&format!("BENCHMARK: {}\n", t.id)));
        assert!(!log.contains("APIServer"));

        let bench = provider
            .commands
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.contains("bench serve"))
            .cloned()
            .unwrap();
        assert!(bench.starts_with(&format!(
            "mkdir -p /tmp/llmsweep/results && rm -f /tmp/llmsweep/results/{}.json && vllm bench serve",
            t.id
        )));
        assert!(bench.contains("--base-url http://localhost:8000"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_recorded_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_, executor, server, t) = setup(ScriptedProvider::new(1, None), dir.path(), None).await;

        let result = executor.run(&t, &server, &CancellationToken::new()).await;
        assert_eq!(result.status, TrialStatus::Failed);
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.stderr_tail.as_deref(), Some("CUDA out of memory"));
        assert!(executor.artifacts().failure_path(&t).exists());
        assert!(!executor.artifacts().result_path(&t).exists());
    }

    #[tokio::test]
    async fn test_malformed_result_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_, executor, server, t) =
            setup(ScriptedProvider::new(0, Some("not json at all")), dir.path(), None).await;

        let result = executor.run(&t, &server, &CancellationToken::new()).await;
        assert_eq!(result.status, TrialStatus::Failed);
        assert!(result.reason.unwrap().contains("not valid JSON"));
    }

    #[tokio::test]
    async fn test_missing_result_file_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_, executor, server, t) = setup(ScriptedProvider::new(0, None), dir.path(), None).await;

        let result = executor.run(&t, &server, &CancellationToken::new()).await;
        assert_eq!(result.status, TrialStatus::Failed);
        assert!(result.reason.unwrap().contains("no result file"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut scripted = ScriptedProvider::new(0, Some("{}"));
        scripted.bench_delay = Duration::from_secs(600);
        let (_, executor, server, t) = setup(scripted, dir.path(), Some(Duration::from_secs(60))).await;

        let result = executor.run(&t, &server, &CancellationToken::new()).await;
        assert_eq!(result.status, TrialStatus::Failed);
        assert!(result.reason.unwrap().contains("within 60s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_marks_trial_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let mut scripted = ScriptedProvider::new(0, Some("{}"));
        scripted.bench_delay = Duration::from_secs(600);
        let (_, executor, server, t) = setup(scripted, dir.path(), None).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let result = executor.run(&t, &server, &cancel).await;
        assert!(result.is_interrupted());
        assert!(executor.artifacts().failure_path(&t).exists());
    }

    #[test]
    fn test_parse_result_accepts_json_lines() {
        let raw = "{\"run\": 1}\n{\"run\": 2}\n";
        assert_eq!(parse_result(raw).unwrap()["run"], 2);
        assert!(parse_result("  ").is_err());
    }
}
