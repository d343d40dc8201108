//! Trial artifacts on the local filesystem.
//!
//! Each trial owns three files under `<benchmark.output_dir>/<run>/`, all
//! named after the trial id:
//! - `<id>.json`: the successful [`TrialResult`] with metrics
//! - `<id>.failed.json`: failure or interruption marker
//! - `<id>.txt`: benchmark tool output for humans
//!
//! A trial counts as done only when `<id>.json` parses as a successful
//! result, so a sweep re-run with [`OnExisting::Skip`] picks up where the
//! previous one stopped.

use crate::config::OnExisting;
use crate::error::Result;
use crate::result::{TrialResult, TrialStatus};
use crate::sweep::Trial;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Lines the vLLM API server interleaves with benchmark output.
const API_SERVER_MARKER: &str = "(APIServer)";

/// Reads and writes per-trial artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    on_existing: OnExisting,
}

impl ArtifactStore {
    pub fn new(on_existing: OnExisting) -> Self {
        Self { on_existing }
    }

    pub fn result_path(&self, trial: &Trial) -> PathBuf {
        trial.output_dir.join(format!("{}.json", trial.id))
    }

    pub fn failure_path(&self, trial: &Trial) -> PathBuf {
        trial.output_dir.join(format!("{}.failed.json", trial.id))
    }

    pub fn log_path(&self, trial: &Trial) -> PathBuf {
        trial.output_dir.join(format!("{}.txt", trial.id))
    }

    /// The earlier successful result of `trial`, when resuming.
    ///
    /// Always `None` under [`OnExisting::Overwrite`]. A result file that is
    /// unreadable or records anything but success does not count.
    pub async fn completed(&self, trial: &Trial) -> Option<TrialResult> {
        if self.on_existing == OnExisting::Overwrite {
            return None;
        }
        let path = self.result_path(trial);
        let data = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str::<TrialResult>(&data) {
            Ok(mut result) if result.status == TrialStatus::Success && result.trial_id == trial.id => {
                result.resumed = true;
                result.artifact = Some(path);
                Some(result)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable result file");
                None
            }
        }
    }

    /// Persist `result` to the artifact matching its status and return it
    /// with `artifact` filled in. Skipped trials leave no artifact.
    pub async fn record(&self, trial: &Trial, mut result: TrialResult) -> Result<TrialResult> {
        let path = match result.status {
            TrialStatus::Success => self.result_path(trial),
            TrialStatus::Failed => self.failure_path(trial),
            TrialStatus::Skipped => return Ok(result),
        };
        result.artifact = Some(path.clone());
        write_json_atomic(&path, &result).await?;
        // Only the latest outcome of a trial stays on disk.
        match result.status {
            TrialStatus::Success => remove_if_exists(&self.failure_path(trial)).await,
            _ => remove_if_exists(&self.result_path(trial)).await,
        }
        tracing::debug!(trial = %trial.id, path = %path.display(), "Recorded trial result");
        Ok(result)
    }

    /// Write the benchmark tool's stdout as `<id>.txt`.
    pub async fn write_log(&self, trial: &Trial, stdout: &str) -> Result<PathBuf> {
        let path = self.log_path(trial);
        write_atomic(&path, render_log(&trial.id, stdout).as_bytes()).await?;
        Ok(path)
    }
}

/// Human-readable log: a header naming the trial, then the tool output
/// without API server lines.
pub fn render_log(trial_id: &str, stdout: &str) -> String {
    let mut out = format!("BENCHMARK: {trial_id}\n{}\n", "=".repeat(64));
    for line in stdout.lines().filter(|l| !l.contains(API_SERVER_MARKER)) {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    write_atomic(path, data.as_bytes()).await
}

/// Write through a sibling temp file and rename, so readers never observe a
/// partial file.
pub async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, data).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove stale artifact"),
    }
}
