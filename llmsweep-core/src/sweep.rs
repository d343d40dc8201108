//! Sweep expansion.
//!
//! Turns the declared runs into an ordered list of trials: one server
//! configuration per parallelism layout, and for each of them the cartesian
//! product of context size, concurrency, prompt count and output length in
//! declaration order.

use crate::config::{ParallelismLayout, RunConfig, Secret, SweepConfig};
use crate::engine::Engine;
use crate::error::{Result, SweepError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

/// Fully resolved parameters of one server instance.
///
/// Two trials can share a running server exactly when their configurations
/// compare equal.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub engine: Engine,
    pub model_path: String,
    pub port: u16,
    pub gpu_memory_utilization: f64,
    pub max_model_len: Option<u32>,
    pub max_num_seqs: Option<u32>,
    pub dtype: Option<String>,
    pub disable_log_requests: bool,
    pub enable_expert_parallel: bool,
    pub layout: ParallelismLayout,
    pub extra_args: BTreeMap<String, serde_json::Value>,
    pub hf_token: Option<Secret>,
}

impl ServerConfig {
    fn from_run(run: &RunConfig, model_path: &str, layout: ParallelismLayout) -> Self {
        Self {
            engine: run.engine,
            model_path: model_path.to_string(),
            port: run.serve.port,
            gpu_memory_utilization: run.serve.gpu_memory_utilization,
            max_model_len: run.serve.max_model_len,
            max_num_seqs: run.serve.max_num_seqs,
            dtype: run.serve.dtype.clone(),
            disable_log_requests: run.serve.disable_log_requests,
            enable_expert_parallel: run.serve.enable_expert_parallel,
            layout,
            extra_args: run.serve.extra_args.clone(),
            hf_token: run.model.hf_token.clone(),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        format!("{} {} {}", self.engine, self.model_path, self.layout)
    }
}

/// The swept load parameters of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialParams {
    pub context_size: u32,
    pub concurrency: u32,
    pub num_prompts: u32,
    pub output_len: u32,
}

/// One measurement: a server configuration plus load parameters.
#[derive(Debug, Clone)]
pub struct Trial {
    pub id: String,
    pub run_name: String,
    pub server: Arc<ServerConfig>,
    pub params: TrialParams,
    /// Local directory receiving this trial's artifacts.
    pub output_dir: PathBuf,
    pub endpoint: String,
    pub bench_extra_args: BTreeMap<String, serde_json::Value>,
}

impl Trial {
    fn new(run: &RunConfig, server: Arc<ServerConfig>, params: TrialParams) -> Self {
        Self {
            id: trial_id(&run.name, &server.layout, &params),
            run_name: run.name.clone(),
            output_dir: run.benchmark.output_dir.join(&run.name),
            endpoint: run.benchmark.endpoint.clone(),
            bench_extra_args: run.benchmark.extra_args.clone(),
            server,
            params,
        }
    }
}

/// Deterministic identifier encoding every varying dimension of a trial.
pub fn trial_id(run_name: &str, layout: &ParallelismLayout, params: &TrialParams) -> String {
    format!(
        "{}_TP{}_DP{}_PP{}_CTX{}_C{}_P{}_O{}",
        run_name,
        layout.tensor,
        layout.data,
        layout.pipeline,
        params.context_size,
        params.concurrency,
        params.num_prompts,
        params.output_len
    )
}

/// Expand one run into its trials.
pub fn expand(run: &RunConfig) -> Result<Vec<Trial>> {
    let model_path = run.model_path().ok_or_else(|| {
        SweepError::config(format!("run '{}': no model path configured", run.name))
    })?;
    let bench = &run.benchmark;
    require_values(&run.name, "parallelism", &run.serve.parallelism)?;
    require_values(&run.name, "context_sizes", &bench.context_sizes)?;
    require_values(&run.name, "concurrency", &bench.concurrency)?;
    require_values(&run.name, "num_prompts", &bench.num_prompts)?;
    require_values(&run.name, "output_lengths", &bench.output_lengths)?;

    let mut trials = Vec::with_capacity(
        run.serve.parallelism.len()
            * bench.context_sizes.len()
            * bench.concurrency.len()
            * bench.num_prompts.len()
            * bench.output_lengths.len(),
    );
    for layout in &run.serve.parallelism {
        let server = Arc::new(ServerConfig::from_run(run, model_path, *layout));
        for &context_size in &bench.context_sizes {
            for &concurrency in &bench.concurrency {
                for &num_prompts in &bench.num_prompts {
                    for &output_len in &bench.output_lengths {
                        let params = TrialParams {
                            context_size,
                            concurrency,
                            num_prompts,
                            output_len,
                        };
                        trials.push(Trial::new(run, Arc::clone(&server), params));
                    }
                }
            }
        }
    }
    Ok(trials)
}

/// Expand every run of a sweep, in declaration order.
pub fn expand_all(config: &SweepConfig) -> Result<Vec<Trial>> {
    let mut trials = Vec::new();
    for run in &config.runs {
        trials.extend(expand(run)?);
    }
    let mut seen = HashSet::with_capacity(trials.len());
    if let Some(dup) = trials.iter().find(|t| !seen.insert(t.id.as_str())) {
        return Err(SweepError::config(format!("duplicate trial id '{}'", dup.id)));
    }
    Ok(trials)
}

/// Trials sharing one server configuration, in sweep order.
#[derive(Debug, Clone)]
pub struct ServerGroup {
    pub index: usize,
    pub server: Arc<ServerConfig>,
    pub trials: Vec<Trial>,
}

/// Split an ordered trial list into maximal runs of equivalent servers.
pub fn group_trials(trials: Vec<Trial>) -> Vec<ServerGroup> {
    let mut groups: Vec<ServerGroup> = Vec::new();
    for trial in trials {
        match groups.last_mut() {
            Some(group) if *group.server == *trial.server => group.trials.push(trial),
            _ => groups.push(ServerGroup {
                index: groups.len(),
                server: Arc::clone(&trial.server),
                trials: vec![trial],
            }),
        }
    }
    groups
}

fn require_values<T>(run: &str, field: &str, values: &[T]) -> Result<()>
where
    T: Eq + std::hash::Hash + Display,
{
    if values.is_empty() {
        return Err(SweepError::config(format!(
            "run '{run}': '{field}' must list at least one value"
        )));
    }
    let mut seen = HashSet::with_capacity(values.len());
    for value in values {
        if !seen.insert(value) {
            return Err(SweepError::config(format!(
                "run '{run}': '{field}' lists {value} more than once"
            )));
        }
    }
    Ok(())
}
