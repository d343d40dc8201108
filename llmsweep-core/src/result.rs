//! Per-trial outcomes.

use crate::config::ParallelismLayout;
use crate::engine::Engine;
use crate::sweep::{Trial, TrialParams};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Terminal status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialStatus::Success => write!(f, "success"),
            TrialStatus::Failed => write!(f, "failed"),
            TrialStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Reason recorded for a trial cut short by cancellation.
pub const INTERRUPTED: &str = "interrupted";

/// What happened to one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub trial_id: String,
    pub run_name: String,
    pub status: TrialStatus,
    pub engine: Engine,
    pub model: String,
    pub layout: ParallelismLayout,
    pub params: TrialParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
    /// Parsed output of the benchmark tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    /// Artifact this result was persisted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub duration_secs: f64,
    /// Result loaded from an earlier run's artifact.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resumed: bool,
}

impl TrialResult {
    fn new(trial: &Trial, status: TrialStatus) -> Self {
        Self {
            trial_id: trial.id.clone(),
            run_name: trial.run_name.clone(),
            status,
            engine: trial.server.engine,
            model: trial.server.model_path.clone(),
            layout: trial.server.layout,
            params: trial.params,
            reason: None,
            exit_code: None,
            stderr_tail: None,
            metrics: None,
            artifact: None,
            started_at: None,
            finished_at: Utc::now(),
            duration_secs: 0.0,
            resumed: false,
        }
    }

    pub fn success(trial: &Trial, started_at: DateTime<Utc>, metrics: serde_json::Value) -> Self {
        let mut result = Self::new(trial, TrialStatus::Success);
        result.exit_code = Some(0);
        result.metrics = Some(metrics);
        result.finish(started_at)
    }

    pub fn failed(trial: &Trial, started_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        let mut result = Self::new(trial, TrialStatus::Failed);
        result.reason = Some(reason.into());
        result.finish(started_at)
    }

    /// A trial that never ran because its group could not be served.
    pub fn skipped(trial: &Trial, reason: impl Into<String>) -> Self {
        let mut result = Self::new(trial, TrialStatus::Skipped);
        result.reason = Some(reason.into());
        result
    }

    pub fn with_exit(mut self, exit_code: i32, stderr_tail: String) -> Self {
        self.exit_code = Some(exit_code);
        if !stderr_tail.is_empty() {
            self.stderr_tail = Some(stderr_tail);
        }
        self
    }

    pub fn is_interrupted(&self) -> bool {
        self.status == TrialStatus::Failed && self.reason.as_deref() == Some(INTERRUPTED)
    }

    fn finish(mut self, started_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        self.started_at = Some(started_at);
        self.finished_at = now;
        self.duration_secs = (now - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        self
    }
}

/// Pull a headline metric out of the benchmark tool's JSON, if present.
pub fn metric(metrics: &serde_json::Value, key: &str) -> Option<f64> {
    metrics.get(key).and_then(serde_json::Value::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::sweep::expand;
    use pretty_assertions::assert_eq;

    fn trial() -> Trial {
        let run: RunConfig = serde_json::from_value(serde_json::json!({
            "name": "r",
            "model": { "repo_id": "org/model" },
            "serve": { "parallelism": [ParallelismLayout::new(2, 1, 1)] },
            "benchmark": {
                "context_sizes": [1024], "concurrency": [8],
                "num_prompts": [32], "output_lengths": [128]
            }
        }))
        .unwrap();
        expand(&run).unwrap().remove(0)
    }

    #[test]
    fn test_success_carries_trial_identity() {
        let t = trial();
        let result = TrialResult::success(&t, Utc::now(), serde_json::json!({ "mean_ttft_ms": 12.5 }));
        assert_eq!(result.status, TrialStatus::Success);
        assert_eq!(result.trial_id, "r_TP2_DP1_PP1_CTX1024_C8_P32_O128");
        assert_eq!(result.layout, ParallelismLayout::new(2, 1, 1));
        assert_eq!(metric(result.metrics.as_ref().unwrap(), "mean_ttft_ms"), Some(12.5));
        assert!(result.duration_secs >= 0.0);
    }

    #[test]
    fn test_interrupted_marker() {
        let t = trial();
        assert!(TrialResult::failed(&t, Utc::now(), INTERRUPTED).is_interrupted());
        assert!(!TrialResult::failed(&t, Utc::now(), "exit 1").is_interrupted());
        assert!(!TrialResult::skipped(&t, INTERRUPTED).is_interrupted());
    }

    #[test]
    fn test_serialized_shape() {
        let t = trial();
        let result = TrialResult::failed(&t, Utc::now(), "boom").with_exit(2, "traceback".into());
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["engine"], "vllm");
        assert_eq!(value["exit_code"], 2);
        assert_eq!(value["params"]["context_size"], 1024);
        assert!(value.get("metrics").is_none());
        assert!(value.get("resumed").is_none());

        let back: TrialResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, result);
    }
}
