//! End-of-run summary.
//!
//! Built up while the orchestrator works through the groups, printed as a
//! table and persisted as `sweep_summary.json` plus a markdown rendition
//! under the sweep's output directory. Interrupted runs still get one.

use crate::artifacts::{write_atomic, write_json_atomic};
use crate::error::Result;
use crate::result::{TrialResult, TrialStatus, metric};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const SUMMARY_JSON: &str = "sweep_summary.json";
pub const SUMMARY_MARKDOWN: &str = "sweep_summary.md";

/// How a server group ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOutcome {
    /// The server came up and every trial ran.
    Completed,
    /// Every trial already had a result; nothing was acquired.
    AlreadyComplete,
    ProvisionFailed,
    /// The server failed to launch or never became healthy.
    ServerFailed,
    Interrupted,
    /// The run stopped before reaching this group.
    NotAttempted,
}

impl GroupOutcome {
    /// The group tried to get a server and could not.
    pub fn is_start_failure(self) -> bool {
        matches!(self, GroupOutcome::ProvisionFailed | GroupOutcome::ServerFailed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub index: usize,
    pub server: String,
    pub trials: usize,
    pub outcome: GroupOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Successes carried over from an earlier run; included in `success`.
    pub resumed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.success + self.failed + self.skipped
    }
}

/// Outcome of every trial in a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub sweep_id: Uuid,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub interrupted: bool,
    pub counts: StatusCounts,
    pub groups: Vec<GroupRecord>,
    pub trials: Vec<TrialResult>,
}

impl RunSummary {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            sweep_id: Uuid::new_v4(),
            provider: provider.into(),
            started_at: Utc::now(),
            finished_at: None,
            interrupted: false,
            counts: StatusCounts::default(),
            groups: Vec::new(),
            trials: Vec::new(),
        }
    }

    pub fn record_trial(&mut self, result: TrialResult) {
        match result.status {
            TrialStatus::Success => {
                self.counts.success += 1;
                if result.resumed {
                    self.counts.resumed += 1;
                }
            }
            TrialStatus::Failed => self.counts.failed += 1,
            TrialStatus::Skipped => self.counts.skipped += 1,
        }
        self.trials.push(result);
    }

    pub fn record_group(&mut self, group: GroupRecord) {
        self.groups.push(group);
    }

    pub fn finish(&mut self, interrupted: bool) {
        self.interrupted = interrupted;
        self.finished_at = Some(Utc::now());
    }

    /// At least one group tried to start and none succeeded.
    pub fn nothing_started(&self) -> bool {
        let attempted: Vec<_> = self
            .groups
            .iter()
            .filter(|g| !matches!(g.outcome, GroupOutcome::AlreadyComplete | GroupOutcome::NotAttempted))
            .collect();
        !attempted.is_empty() && attempted.iter().all(|g| g.outcome.is_start_failure())
    }

    fn duration_secs(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_seconds()
    }

    /// Fixed-width table for the terminal.
    pub fn render_table(&self) -> String {
        let width = self.trials.iter().map(|t| t.trial_id.len()).max().unwrap_or(8).max(8);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<width$}  {:<8}  {:>10}  {:>12}  DETAIL",
            "TRIAL", "STATUS", "TTFT ms", "OUT tok/s"
        );
        let _ = writeln!(out, "{}", "-".repeat(width + 48));
        for t in &self.trials {
            let (ttft, tput) = headline(t);
            let detail = if t.resumed {
                "resumed".to_string()
            } else {
                t.reason.clone().unwrap_or_default()
            };
            let _ = writeln!(
                out,
                "{:<width$}  {:<8}  {:>10}  {:>12}  {}",
                t.trial_id,
                t.status.to_string(),
                ttft,
                tput,
                first_line(&detail)
            );
        }
        let _ = writeln!(out, "{}", "-".repeat(width + 48));
        let _ = writeln!(
            out,
            "{} trials: {} succeeded ({} resumed), {} failed, {} skipped in {}s{}",
            self.counts.total(),
            self.counts.success,
            self.counts.resumed,
            self.counts.failed,
            self.counts.skipped,
            self.duration_secs(),
            if self.interrupted { " (interrupted)" } else { "" }
        );
        out
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Sweep Summary");
        let _ = writeln!(out);
        let _ = writeln!(out, "Sweep: `{}` on `{}`", self.sweep_id, self.provider);
        let _ = writeln!(out, "Started: {}", self.started_at.to_rfc3339());
        if let Some(finished) = self.finished_at {
            let _ = writeln!(out, "Finished: {}", finished.to_rfc3339());
        }
        if self.interrupted {
            let _ = writeln!(out);
            let _ = writeln!(out, "**Interrupted before completion.**");
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "## Server groups");
        let _ = writeln!(out);
        let _ = writeln!(out, "| # | Server | Trials | Outcome | Error |");
        let _ = writeln!(out, "|---|--------|--------|---------|-------|");
        for g in &self.groups {
            let outcome = serde_json::to_value(g.outcome)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                g.index,
                g.server,
                g.trials,
                outcome,
                first_line(g.error.as_deref().unwrap_or(""))
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "## Trials");
        let _ = writeln!(out);
        let _ = writeln!(out, "| Trial | Status | Mean TTFT (ms) | Output tok/s | Detail |");
        let _ = writeln!(out, "|-------|--------|----------------|--------------|--------|");
        for t in &self.trials {
            let (ttft, tput) = headline(t);
            let detail = if t.resumed { "resumed" } else { t.reason.as_deref().unwrap_or("") };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                t.trial_id,
                t.status,
                ttft,
                tput,
                first_line(detail)
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "---");
        let _ = writeln!(
            out,
            "Total: {} | Success: {} | Failed: {} | Skipped: {}",
            self.counts.total(),
            self.counts.success,
            self.counts.failed,
            self.counts.skipped
        );
        out
    }

    /// Write the JSON and markdown summaries into `dir`.
    pub async fn persist(&self, dir: &Path) -> Result<PathBuf> {
        let json_path = dir.join(SUMMARY_JSON);
        write_json_atomic(&json_path, self).await?;
        write_atomic(&dir.join(SUMMARY_MARKDOWN), self.render_markdown().as_bytes()).await?;
        Ok(json_path)
    }
}

fn headline(t: &TrialResult) -> (String, String) {
    let Some(metrics) = t.metrics.as_ref() else {
        return ("-".into(), "-".into());
    };
    let fmt = |v: Option<f64>| v.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".into());
    (
        fmt(metric(metrics, "mean_ttft_ms")),
        fmt(metric(metrics, "output_throughput")),
    )
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}
