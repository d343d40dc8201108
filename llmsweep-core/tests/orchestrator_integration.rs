//! Integration tests for the run orchestrator.
//!
//! A scripted provider stands in for the machine: it hands out handles,
//! answers the launch, health, benchmark and cleanup commands the core
//! issues, and counts what happened so the tests can assert on lifecycle
//! guarantees (one start, one stop, one release per group).

use async_trait::async_trait;
use llmsweep_core::config::SweepConfig;
use llmsweep_core::error::{AcquireFailure, Result, SweepError};
use llmsweep_core::orchestrator::{RunOrchestrator, RunOutcome, RunReport};
use llmsweep_core::provider::{CommandOutput, ProbeOutcome, ProviderKind, ResourceHandle, ResourceProvider};
use llmsweep_core::result::TrialStatus;
use llmsweep_core::summary::{GroupOutcome, SUMMARY_JSON, SUMMARY_MARKDOWN};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Acquire {
    Ok,
    /// Fails before anything billable exists.
    Fail,
    /// Fails after creating an instance.
    FailWithPartial,
    /// Cancels the run mid-provisioning and hands back the instance.
    CancelWithPartial,
}

/// Where the provider pulls the cancellation trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Interrupt {
    Never,
    WhileStarting,
    /// During the benchmark of the n-th trial (1-based).
    DuringTrial(u32),
}

struct ScriptedProvider {
    cancel: CancellationToken,
    acquires: Mutex<Vec<Acquire>>,
    interrupt: Interrupt,
    /// Server starts (1-based) that never become healthy.
    unhealthy_starts: Vec<u32>,
    /// Benchmarks whose command contains one of these exit with status 1.
    failing: Vec<String>,

    acquire_calls: AtomicU32,
    starts: AtomicU32,
    stops: AtomicU32,
    kills: AtomicU32,
    benches: AtomicU32,
    release_calls: AtomicU32,
    events: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(cancel: &CancellationToken) -> Self {
        Self {
            cancel: cancel.clone(),
            acquires: Mutex::new(Vec::new()),
            interrupt: Interrupt::Never,
            unhealthy_starts: Vec::new(),
            failing: Vec::new(),
            acquire_calls: AtomicU32::new(0),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
            kills: AtomicU32::new(0),
            benches: AtomicU32::new(0),
            release_calls: AtomicU32::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes of successive `acquire` calls; `Ok` once the list runs out.
    fn with_acquires(self, script: &[Acquire]) -> Self {
        *self.acquires.lock().unwrap() = script.iter().rev().copied().collect();
        self
    }

    fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    fn with_unhealthy_starts(mut self, starts: &[u32]) -> Self {
        self.unhealthy_starts = starts.to_vec();
        self
    }

    fn with_failing(mut self, pattern: &str) -> Self {
        self.failing.push(pattern.to_string());
        self
    }

    fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn log(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn ok(stdout: impl Into<String>) -> Result<CommandOutput> {
        Ok(CommandOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        })
    }
}

#[async_trait]
impl ResourceProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cloud
    }

    async fn acquire(&self, _cancel: &CancellationToken) -> std::result::Result<ResourceHandle, AcquireFailure> {
        let n = self.acquire_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let step = self.acquires.lock().unwrap().pop().unwrap_or(Acquire::Ok);
        self.log(format!("acquire#{n}"));
        match step {
            Acquire::Ok => Ok(ResourceHandle::instance(format!("pod-{n}"), None)),
            Acquire::Fail => Err(SweepError::provision("no H100 capacity in region").into()),
            Acquire::FailWithPartial => Err(AcquireFailure::with_partial(
                SweepError::provision("pod never became reachable"),
                ResourceHandle::instance(format!("pod-{n}"), None),
            )),
            Acquire::CancelWithPartial => {
                self.cancel.cancel();
                Err(AcquireFailure::with_partial(
                    SweepError::provision("interrupted while waiting for instance"),
                    ResourceHandle::instance(format!("pod-{n}"), None),
                ))
            }
        }
    }

    async fn execute(&self, _handle: &ResourceHandle, command: &str) -> Result<CommandOutput> {
        if command.contains("nohup") {
            let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
            self.log(format!("start#{n}"));
            return Self::ok(format!("{}\n", 1000 + n));
        }
        if command.contains("kill -s INT") {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.log("stop");
            return Self::ok("");
        }
        if command.starts_with("kill -s KILL") {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.log("kill");
            return Self::ok("");
        }
        if command.contains("bench serve") {
            let n = self.benches.fetch_add(1, Ordering::SeqCst) + 1;
            self.log(format!("bench#{n}"));
            if self.interrupt == Interrupt::DuringTrial(n) {
                self.cancel.cancel();
                std::future::pending::<()>().await;
            }
            if self.failing.iter().any(|p| command.contains(p.as_str())) {
                return Ok(CommandOutput {
                    exit_code: 1,
                    stdout: "Traceback (most recent call last):\n".into(),
                    stderr: "RuntimeError: server disconnected".into(),
                });
            }
            return Self::ok("============ Serving Benchmark Result ============\n");
        }
        if command.starts_with("cat ") {
            return Self::ok(r#"{"mean_ttft_ms": 35.2, "mean_itl_ms": 8.1, "output_throughput": 2150.0}"#);
        }
        // kill -0, tail and anything else succeed quietly.
        Self::ok("")
    }

    async fn probe(&self, _handle: &ResourceHandle, _url: &str, _timeout: Duration) -> ProbeOutcome {
        if self.interrupt == Interrupt::WhileStarting {
            self.cancel.cancel();
            return ProbeOutcome::NotReady("connection refused".into());
        }
        let start = Self::count(&self.starts);
        if self.unhealthy_starts.contains(&start) {
            ProbeOutcome::NotReady("connection refused".into())
        } else {
            ProbeOutcome::Healthy
        }
    }

    async fn release(&self, handle: &ResourceHandle) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        if handle.claim_release() {
            self.log(format!("release {}", handle.describe()));
        }
    }
}

/// Sweep with one run; `layouts` tensor-parallel degrees, each swept over
/// context sizes 1024 and 2048 at concurrency 50.
fn sweep_config(dir: &Path, layouts: &[u32]) -> SweepConfig {
    let parallelism: Vec<_> = layouts.iter().map(|tp| serde_json::json!({ "tensor": tp })).collect();
    serde_json::from_value(serde_json::json!({
        "output_dir": dir,
        "cooldown_secs": 0,
        "stop_grace_secs": 1,
        "health": { "interval_secs": 1, "timeout_secs": 10, "request_timeout_secs": 1 },
        "runs": [{
            "name": "qwen",
            "model": { "repo_id": "Qwen/Qwen2.5-7B-Instruct" },
            "serve": { "parallelism": parallelism },
            "benchmark": {
                "context_sizes": [1024, 2048],
                "concurrency": [50],
                "num_prompts": [100],
                "output_lengths": [128],
                "output_dir": dir
            }
        }]
    }))
    .unwrap()
}

async fn run(provider: Arc<ScriptedProvider>, config: &SweepConfig, cancel: &CancellationToken) -> RunReport {
    RunOrchestrator::new(provider, config)
        .run_sweep(config, cancel)
        .await
        .unwrap()
}

fn statuses(report: &RunReport) -> Vec<TrialStatus> {
    report.summary.trials.iter().map(|t| t.status).collect()
}

// --- Integration Tests ---

#[tokio::test]
async fn test_one_layout_two_contexts_uses_one_server() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel));
    let config = sweep_config(dir.path(), &[1]);

    let report = run(provider.clone(), &config, &cancel).await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(statuses(&report), vec![TrialStatus::Success, TrialStatus::Success]);
    assert_eq!(ScriptedProvider::count(&provider.acquire_calls), 1);
    assert_eq!(ScriptedProvider::count(&provider.starts), 1);
    assert_eq!(ScriptedProvider::count(&provider.stops), 1);
    assert_eq!(ScriptedProvider::count(&provider.release_calls), 1);
    assert_eq!(
        provider.events(),
        vec!["acquire#1", "start#1", "bench#1", "bench#2", "stop", "release instance pod-1"]
    );

    let run_dir = dir.path().join("qwen");
    assert!(run_dir.join("qwen_TP1_DP1_PP1_CTX1024_C50_P100_O128.json").exists());
    assert!(run_dir.join("qwen_TP1_DP1_PP1_CTX2048_C50_P100_O128.json").exists());
    assert!(run_dir.join("qwen_TP1_DP1_PP1_CTX2048_C50_P100_O128.txt").exists());
    assert!(dir.path().join(SUMMARY_JSON).exists());
    assert!(dir.path().join(SUMMARY_MARKDOWN).exists());
}

#[tokio::test]
async fn test_each_layout_gets_its_own_resource() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel));
    let config = sweep_config(dir.path(), &[1, 2, 4]);

    let report = run(provider.clone(), &config, &cancel).await;

    assert_eq!(report.summary.counts.success, 6);
    assert_eq!(report.summary.groups.len(), 3);
    assert_eq!(ScriptedProvider::count(&provider.starts), 3);
    assert_eq!(ScriptedProvider::count(&provider.stops), 3);
    assert_eq!(ScriptedProvider::count(&provider.release_calls), 3);
    // Never two resources held at once.
    let events = provider.events();
    let held: Vec<_> = events
        .iter()
        .filter(|e| e.starts_with("acquire") || e.starts_with("release"))
        .map(|e| e.split(['#', ' ']).next().unwrap())
        .collect();
    assert_eq!(held, vec!["acquire", "release", "acquire", "release", "acquire", "release"]);
}

#[tokio::test]
async fn test_provision_error_skips_group_and_releases_partial() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel).with_acquires(&[Acquire::FailWithPartial]));
    let config = sweep_config(dir.path(), &[1]);

    let report = run(provider.clone(), &config, &cancel).await;

    assert_eq!(statuses(&report), vec![TrialStatus::Skipped, TrialStatus::Skipped]);
    assert_eq!(report.summary.groups[0].outcome, GroupOutcome::ProvisionFailed);
    assert_eq!(report.outcome, RunOutcome::NothingStarted);
    assert_eq!(ScriptedProvider::count(&provider.starts), 0);
    assert_eq!(ScriptedProvider::count(&provider.release_calls), 1);
    assert!(
        report.summary.trials[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("pod never became reachable")
    );
}

#[tokio::test]
async fn test_provision_error_moves_on_to_next_group() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel).with_acquires(&[Acquire::Fail, Acquire::Ok]));
    let config = sweep_config(dir.path(), &[1, 2]);

    let report = run(provider.clone(), &config, &cancel).await;

    assert_eq!(
        statuses(&report),
        vec![TrialStatus::Skipped, TrialStatus::Skipped, TrialStatus::Success, TrialStatus::Success]
    );
    assert_eq!(report.outcome, RunOutcome::Completed);
    // Nothing was created for the failed group, so nothing to release there.
    assert_eq!(ScriptedProvider::count(&provider.release_calls), 1);
    assert_eq!(ScriptedProvider::count(&provider.starts), 1);
}

#[tokio::test]
async fn test_failed_trial_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel).with_failing("--random-input-len 1024"));
    let config = sweep_config(dir.path(), &[1]);

    let report = run(provider.clone(), &config, &cancel).await;

    assert_eq!(statuses(&report), vec![TrialStatus::Failed, TrialStatus::Success]);
    assert_eq!(report.outcome, RunOutcome::Completed);
    let failed = &report.summary.trials[0];
    assert_eq!(failed.exit_code, Some(1));
    assert_eq!(failed.stderr_tail.as_deref(), Some("RuntimeError: server disconnected"));
    let run_dir = dir.path().join("qwen");
    assert!(run_dir.join("qwen_TP1_DP1_PP1_CTX1024_C50_P100_O128.failed.json").exists());
    assert_eq!(ScriptedProvider::count(&provider.release_calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_server_skips_group_only() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel).with_unhealthy_starts(&[1]));
    let config = sweep_config(dir.path(), &[1, 2]);

    let started = tokio::time::Instant::now();
    let report = run(provider.clone(), &config, &cancel).await;

    assert!(started.elapsed() >= Duration::from_secs(10));
    assert_eq!(report.summary.groups[0].outcome, GroupOutcome::ServerFailed);
    assert_eq!(report.summary.groups[1].outcome, GroupOutcome::Completed);
    assert_eq!(
        statuses(&report),
        vec![TrialStatus::Skipped, TrialStatus::Skipped, TrialStatus::Success, TrialStatus::Success]
    );
    // The failed server is killed, not stopped again.
    assert_eq!(ScriptedProvider::count(&provider.kills), 1);
    assert_eq!(ScriptedProvider::count(&provider.stops), 1);
    assert_eq!(ScriptedProvider::count(&provider.release_calls), 2);
}

#[tokio::test]
async fn test_interrupt_during_trial_releases_once() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel).with_interrupt(Interrupt::DuringTrial(1)));
    let config = sweep_config(dir.path(), &[1, 2]);

    let report = run(provider.clone(), &config, &cancel).await;

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert!(report.summary.interrupted);
    assert!(report.summary.trials[0].is_interrupted());
    assert_eq!(
        statuses(&report),
        vec![TrialStatus::Failed, TrialStatus::Skipped, TrialStatus::Skipped, TrialStatus::Skipped]
    );
    assert_eq!(report.summary.groups[0].outcome, GroupOutcome::Interrupted);
    assert_eq!(report.summary.groups[1].outcome, GroupOutcome::NotAttempted);
    assert_eq!(ScriptedProvider::count(&provider.acquire_calls), 1);
    assert_eq!(ScriptedProvider::count(&provider.stops), 1);
    assert_eq!(ScriptedProvider::count(&provider.release_calls), 1);
    assert_eq!(provider.events().last().map(String::as_str), Some("release instance pod-1"));
    // The summary is still persisted.
    let saved = std::fs::read_to_string(dir.path().join(SUMMARY_JSON)).unwrap();
    assert!(saved.contains("\"interrupted\": true"));
}

#[tokio::test]
async fn test_interrupt_while_starting_stops_and_releases() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel).with_interrupt(Interrupt::WhileStarting));
    let config = sweep_config(dir.path(), &[1]);

    let report = run(provider.clone(), &config, &cancel).await;

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(ScriptedProvider::count(&provider.benches), 0);
    assert_eq!(ScriptedProvider::count(&provider.stops), 1);
    assert_eq!(ScriptedProvider::count(&provider.release_calls), 1);
    assert_eq!(statuses(&report), vec![TrialStatus::Skipped, TrialStatus::Skipped]);
}

#[tokio::test]
async fn test_interrupt_during_provisioning_releases_partial_once() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel).with_acquires(&[Acquire::CancelWithPartial]));
    let config = sweep_config(dir.path(), &[1, 2]);

    let report = run(provider.clone(), &config, &cancel).await;

    assert_eq!(report.outcome, RunOutcome::Interrupted);
    assert_eq!(ScriptedProvider::count(&provider.acquire_calls), 1);
    assert_eq!(ScriptedProvider::count(&provider.starts), 0);
    assert_eq!(ScriptedProvider::count(&provider.release_calls), 1);
    assert_eq!(report.summary.counts.skipped, 4);
}

#[tokio::test]
async fn test_resume_skips_completed_trials() {
    let dir = tempfile::tempdir().unwrap();
    let config = sweep_config(dir.path(), &[1, 2]);

    let cancel = CancellationToken::new();
    let first = Arc::new(ScriptedProvider::new(&cancel).with_failing("qwen_TP2_DP1_PP1_CTX2048"));
    let report = run(first.clone(), &config, &cancel).await;
    assert_eq!(report.summary.counts.success, 3);
    assert_eq!(report.summary.counts.failed, 1);

    // Second pass: only the failed trial runs again.
    let cancel = CancellationToken::new();
    let second = Arc::new(ScriptedProvider::new(&cancel));
    let report = run(second.clone(), &config, &cancel).await;

    assert_eq!(report.summary.counts.success, 4);
    assert_eq!(report.summary.counts.resumed, 3);
    assert_eq!(report.summary.groups[0].outcome, GroupOutcome::AlreadyComplete);
    assert_eq!(ScriptedProvider::count(&second.acquire_calls), 1);
    assert_eq!(ScriptedProvider::count(&second.benches), 1);
    assert_eq!(
        report.summary.trials.iter().map(|t| t.trial_id.as_str()).collect::<Vec<_>>(),
        vec![
            "qwen_TP1_DP1_PP1_CTX1024_C50_P100_O128",
            "qwen_TP1_DP1_PP1_CTX2048_C50_P100_O128",
            "qwen_TP2_DP1_PP1_CTX1024_C50_P100_O128",
            "qwen_TP2_DP1_PP1_CTX2048_C50_P100_O128",
        ]
    );
    let run_dir = dir.path().join("qwen");
    assert!(!run_dir.join("qwen_TP2_DP1_PP1_CTX2048_C50_P100_O128.failed.json").exists());

    // A third pass has nothing to do and acquires nothing.
    let cancel = CancellationToken::new();
    let third = Arc::new(ScriptedProvider::new(&cancel));
    let report = run(third.clone(), &config, &cancel).await;
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(ScriptedProvider::count(&third.acquire_calls), 0);
}

#[tokio::test]
async fn test_overwrite_reruns_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sweep_config(dir.path(), &[1]);

    let cancel = CancellationToken::new();
    run(Arc::new(ScriptedProvider::new(&cancel)), &config, &cancel).await;

    config.on_existing = llmsweep_core::config::OnExisting::Overwrite;
    let provider = Arc::new(ScriptedProvider::new(&cancel));
    let report = run(provider.clone(), &config, &cancel).await;
    assert_eq!(report.summary.counts.resumed, 0);
    assert_eq!(ScriptedProvider::count(&provider.benches), 2);
}

#[tokio::test]
async fn test_config_error_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sweep_config(dir.path(), &[1]);
    config.runs[0].benchmark.context_sizes.clear();

    let cancel = CancellationToken::new();
    let provider = Arc::new(ScriptedProvider::new(&cancel));
    let err = RunOrchestrator::new(provider.clone(), &config)
        .run_sweep(&config, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, SweepError::Config(_)));
    assert_eq!(ScriptedProvider::count(&provider.acquire_calls), 0);
}
