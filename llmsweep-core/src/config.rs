//! Sweep configuration.
//!
//! A sweep file is YAML with a list of named runs plus optional `remote` and
//! `cloud` blocks that select where the servers run. Values are layered:
//! built-in defaults, then the file, then `LLMSWEEP_` environment variables
//! (nested keys separated by `__`, e.g. `LLMSWEEP_HEALTH__TIMEOUT_SECS=600`).

use crate::engine::Engine;
use crate::error::{Result, SweepError};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when no cloud API key is configured.
pub const CLOUD_API_KEY_ENV: &str = "RUNPOD_API_KEY";
/// Environment variable consulted when no model-repository token is configured.
pub const HF_TOKEN_ENV: &str = "HF_TOKEN";

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// What to do when a trial's result artifact already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExisting {
    /// Treat the trial as done and skip it (resume).
    #[default]
    Skip,
    /// Run the trial again and replace the artifact.
    Overwrite,
}

/// Top-level sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Directory receiving the sweep summary.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub on_existing: OnExisting,
    #[serde(default)]
    pub health: HealthConfig,
    /// Seconds to wait after SIGINT before a server is killed.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Pause between server groups so ports and GPU memory are released.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Upper bound on a single benchmark invocation.
    #[serde(default)]
    pub trial_timeout_secs: Option<u64>,
    /// Scratch directory on the target for server logs and raw result files.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    #[serde(default)]
    pub runs: Vec<RunConfig>,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub cloud: Option<CloudConfig>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            on_existing: OnExisting::default(),
            health: HealthConfig::default(),
            stop_grace_secs: default_stop_grace(),
            cooldown_secs: default_cooldown(),
            trial_timeout_secs: None,
            workdir: default_workdir(),
            runs: Vec::new(),
            remote: None,
            cloud: None,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./benchmark_results")
}

fn default_stop_grace() -> u64 {
    30
}

fn default_cooldown() -> u64 {
    5
}

fn default_workdir() -> String {
    "/tmp/llmsweep".to_string()
}

/// Health polling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Deadline for a freshly started server to report healthy.
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    /// Per-request timeout of a single probe.
    #[serde(default = "default_probe_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            request_timeout_secs: default_probe_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

fn default_health_interval() -> u64 {
    2
}

fn default_health_timeout() -> u64 {
    1200
}

fn default_probe_timeout() -> u64 {
    5
}

/// One named benchmark campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub serve: ServeConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
}

impl RunConfig {
    /// Model reference passed to the server: an explicit serve path, then the
    /// local download directory, then the repository id.
    pub fn model_path(&self) -> Option<&str> {
        [
            self.serve.model_path.as_deref(),
            self.model.local_dir.as_deref(),
            self.model.repo_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|p| !p.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub repo_id: Option<String>,
    #[serde(default)]
    pub local_dir: Option<String>,
    /// Model repository token, exported to the server as `HF_TOKEN`.
    #[serde(default)]
    pub hf_token: Option<Secret>,
}

/// Server template shared by every layout of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f64,
    #[serde(default)]
    pub max_model_len: Option<u32>,
    #[serde(default)]
    pub max_num_seqs: Option<u32>,
    #[serde(default)]
    pub dtype: Option<String>,
    #[serde(default)]
    pub disable_log_requests: bool,
    #[serde(default)]
    pub enable_expert_parallel: bool,
    /// Engine flags passed through verbatim (`true` adds a bare flag).
    #[serde(default)]
    pub extra_args: BTreeMap<String, serde_json::Value>,
    #[serde(default, alias = "parallelism_pairs")]
    pub parallelism: Vec<ParallelismLayout>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            port: default_port(),
            gpu_memory_utilization: default_gpu_memory_utilization(),
            max_model_len: None,
            max_num_seqs: None,
            dtype: None,
            disable_log_requests: false,
            enable_expert_parallel: false,
            extra_args: BTreeMap::new(),
            parallelism: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    8000
}

fn default_gpu_memory_utilization() -> f64 {
    0.9
}

/// Tensor, data and pipeline parallel degrees of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelismLayout {
    #[serde(default = "one", alias = "tensor_parallel")]
    pub tensor: u32,
    #[serde(default = "one", alias = "data_parallel")]
    pub data: u32,
    #[serde(default = "one", alias = "pipeline_parallel")]
    pub pipeline: u32,
}

impl Default for ParallelismLayout {
    fn default() -> Self {
        Self {
            tensor: 1,
            data: 1,
            pipeline: 1,
        }
    }
}

impl ParallelismLayout {
    pub fn new(tensor: u32, data: u32, pipeline: u32) -> Self {
        Self {
            tensor,
            data,
            pipeline,
        }
    }

    /// Number of GPUs the layout occupies, `None` if it does not fit a `u32`.
    pub fn world_size(&self) -> Option<u32> {
        self.tensor
            .checked_mul(self.data)
            .and_then(|n| n.checked_mul(self.pipeline))
    }
}

impl std::fmt::Display for ParallelismLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TP{}_DP{}_PP{}", self.tensor, self.data, self.pipeline)
    }
}

fn one() -> u32 {
    1
}

/// Swept benchmark parameters and where results go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default, alias = "context_size")]
    pub context_sizes: Vec<u32>,
    #[serde(default)]
    pub concurrency: Vec<u32>,
    #[serde(default)]
    pub num_prompts: Vec<u32>,
    #[serde(default, alias = "output_len")]
    pub output_lengths: Vec<u32>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub extra_args: BTreeMap<String, serde_json::Value>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            context_sizes: Vec::new(),
            concurrency: Vec::new(),
            num_prompts: Vec::new(),
            output_lengths: Vec::new(),
            output_dir: default_output_dir(),
            endpoint: default_endpoint(),
            extra_args: BTreeMap::new(),
        }
    }
}

fn default_endpoint() -> String {
    "/v1/completions".to_string()
}

/// Python environment prepared on a remote or cloud target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenvConfig {
    #[serde(default = "default_venv_path")]
    pub path: String,
    #[serde(default = "default_python_version")]
    pub python_version: String,
}

impl Default for VenvConfig {
    fn default() -> Self {
        Self {
            path: default_venv_path(),
            python_version: default_python_version(),
        }
    }
}

fn default_venv_path() -> String {
    "~/.benchmark-venv".to_string()
}

fn default_python_version() -> String {
    "3.11".to_string()
}

/// An already-running host reached over SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: Option<Secret>,
    #[serde(default, alias = "key_filename")]
    pub key_file: Option<PathBuf>,
    #[serde(default, alias = "uv")]
    pub venv: VenvConfig,
    /// Packages installed into the venv before any server starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_ssh_port(),
            username: default_username(),
            password: None,
            key_file: None,
            venv: VenvConfig::default(),
            dependencies: Vec::new(),
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_username() -> String {
    "root".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudProviderKind {
    #[default]
    Runpod,
    Skypilot,
}

/// An instance created for the sweep and destroyed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub provider: CloudProviderKind,
    #[serde(default)]
    pub api_key: Option<Secret>,
    #[serde(default, alias = "ssh_private_key")]
    pub ssh_key_file: Option<PathBuf>,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub venv: VenvConfig,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub runpod: RunPodSpec,
    #[serde(default)]
    pub skypilot: SkyPilotSpec,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            provider: CloudProviderKind::default(),
            api_key: None,
            ssh_key_file: None,
            ready_timeout_secs: default_ready_timeout(),
            poll_interval_secs: default_poll_interval(),
            terminate_timeout_secs: default_terminate_timeout(),
            retry: RetryConfig::default(),
            venv: VenvConfig::default(),
            dependencies: Vec::new(),
            runpod: RunPodSpec::default(),
            skypilot: SkyPilotSpec::default(),
        }
    }
}

fn default_ready_timeout() -> u64 {
    600
}

fn default_poll_interval() -> u64 {
    10
}

fn default_terminate_timeout() -> u64 {
    300
}

/// Bounded exponential backoff for transient cloud API failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    2_000
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// RunPod pod request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPodSpec {
    #[serde(default = "default_instance_name")]
    pub name: String,
    #[serde(default = "default_gpu_type")]
    pub gpu_type: String,
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,
    /// Rent an interruptible (spot) pod instead of on-demand.
    #[serde(default)]
    pub spot: bool,
    #[serde(default)]
    pub bid_per_gpu: Option<f64>,
    #[serde(default = "default_true")]
    pub secure_cloud: bool,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_container_disk")]
    pub container_disk_gb: u32,
    #[serde(default)]
    pub volume_gb: u32,
    #[serde(default = "default_volume_mount")]
    pub volume_mount_path: String,
    #[serde(default = "default_ports")]
    pub ports: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for RunPodSpec {
    fn default() -> Self {
        Self {
            name: default_instance_name(),
            gpu_type: default_gpu_type(),
            gpu_count: default_gpu_count(),
            spot: false,
            bid_per_gpu: None,
            secure_cloud: true,
            image: default_image(),
            container_disk_gb: default_container_disk(),
            volume_gb: 0,
            volume_mount_path: default_volume_mount(),
            ports: default_ports(),
            env: BTreeMap::new(),
        }
    }
}

fn default_instance_name() -> String {
    "llmsweep".to_string()
}

fn default_gpu_type() -> String {
    "NVIDIA H100 80GB HBM3".to_string()
}

fn default_gpu_count() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_image() -> String {
    "runpod/pytorch:2.4.0-py3.11-cuda12.4.1-devel-ubuntu22.04".to_string()
}

fn default_container_disk() -> u32 {
    20
}

fn default_volume_mount() -> String {
    "/workspace".to_string()
}

fn default_ports() -> String {
    "8888/http,8000/http,22/tcp".to_string()
}

/// SkyPilot cluster request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkyPilotSpec {
    #[serde(default = "default_instance_name")]
    pub cluster_name: String,
    #[serde(default = "default_accelerators")]
    pub accelerators: String,
    #[serde(default)]
    pub cloud: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub use_spot: bool,
    #[serde(default = "default_disk_size")]
    pub disk_size_gb: u32,
    #[serde(default)]
    pub image_id: Option<String>,
}

impl Default for SkyPilotSpec {
    fn default() -> Self {
        Self {
            cluster_name: default_instance_name(),
            accelerators: default_accelerators(),
            cloud: None,
            region: None,
            use_spot: false,
            disk_size_gb: default_disk_size(),
            image_id: None,
        }
    }
}

fn default_accelerators() -> String {
    "H100:1".to_string()
}

fn default_disk_size() -> u32 {
    256
}

/// Load a sweep file with defaults and environment overrides applied.
pub fn load_config(path: &Path) -> Result<SweepConfig> {
    if !path.exists() {
        return Err(SweepError::config(format!(
            "config file not found: {}",
            path.display()
        )));
    }
    let mut config = figment_for(path)
        .extract::<SweepConfig>()
        .map_err(Box::new)?;
    config.apply_env_credentials(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn figment_for(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(SweepConfig::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed("LLMSWEEP_").split("__"))
}

impl SweepConfig {
    /// Fill unset credentials from the environment.
    pub fn apply_env_credentials<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(cloud) = self.cloud.as_mut()
            && cloud.api_key.is_none()
        {
            cloud.api_key = lookup(CLOUD_API_KEY_ENV)
                .filter(|v| !v.is_empty())
                .map(Secret::new);
        }
        let hf_token = lookup(HF_TOKEN_ENV).filter(|v| !v.is_empty());
        for run in &mut self.runs {
            if run.model.hf_token.is_none() {
                run.model.hf_token = hf_token.clone().map(Secret::new);
            }
        }
    }

    /// Structural checks that do not depend on the chosen provider.
    pub fn validate(&self) -> Result<()> {
        if self.runs.is_empty() {
            return Err(SweepError::config("no runs defined"));
        }
        let mut names = HashSet::new();
        for run in &self.runs {
            if run.name.trim().is_empty() {
                return Err(SweepError::config("run with empty name"));
            }
            if run.name.contains('/') {
                return Err(SweepError::config(format!(
                    "run name '{}' must not contain '/'",
                    run.name
                )));
            }
            if !names.insert(run.name.as_str()) {
                return Err(SweepError::config(format!(
                    "duplicate run name '{}'",
                    run.name
                )));
            }
            if !(0.0..=1.0).contains(&run.serve.gpu_memory_utilization) {
                return Err(SweepError::config(format!(
                    "run '{}': gpu_memory_utilization must be within 0..=1",
                    run.name
                )));
            }
            for layout in &run.serve.parallelism {
                match layout.world_size() {
                    Some(0) => {
                        return Err(SweepError::config(format!(
                            "run '{}': parallel degrees must be at least 1",
                            run.name
                        )));
                    }
                    None => {
                        return Err(SweepError::config(format!(
                            "run '{}': layout {layout} needs more GPUs than can be counted",
                            run.name
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        if self.health.timeout_secs == 0 {
            return Err(SweepError::config("health.timeout_secs must be positive"));
        }
        Ok(())
    }

    /// The remote block, required for SSH sweeps.
    pub fn require_remote(&self) -> Result<&RemoteConfig> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| SweepError::config("missing 'remote' block"))?;
        if remote.host.as_deref().is_none_or(|h| h.trim().is_empty()) {
            return Err(SweepError::config("remote.host is required"));
        }
        if remote.password.is_some() && remote.key_file.is_some() {
            return Err(SweepError::config(
                "remote: set either password or key_file, not both",
            ));
        }
        Ok(remote)
    }

    /// The cloud block, required for ephemeral sweeps.
    pub fn require_cloud(&self) -> Result<&CloudConfig> {
        let cloud = self
            .cloud
            .as_ref()
            .ok_or_else(|| SweepError::config("missing 'cloud' block"))?;
        if cloud.provider == CloudProviderKind::Runpod && cloud.api_key.is_none() {
            return Err(SweepError::config(format!(
                "cloud.api_key is not set and {CLOUD_API_KEY_ENV} is empty"
            )));
        }
        if cloud.runpod.spot && cloud.runpod.bid_per_gpu.is_some_and(|bid| bid <= 0.0) {
            return Err(SweepError::config("cloud.runpod.bid_per_gpu must be positive"));
        }
        Ok(cloud)
    }
}
