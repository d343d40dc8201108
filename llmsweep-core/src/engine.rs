//! Inference engines and their command lines.

use crate::shell::CommandSpec;
use crate::sweep::{ServerConfig, Trial};
use serde::{Deserialize, Serialize};

/// Inference server implementation a run is benchmarked on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Vllm,
    Sglang,
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vllm => write!(f, "vllm"),
            Self::Sglang => write!(f, "sglang"),
        }
    }
}

impl Engine {
    /// Readiness endpoint served by the engine.
    pub fn health_path(&self) -> &'static str {
        "/health"
    }

    /// Command that runs the server in the foreground.
    pub fn serve_command(&self, server: &ServerConfig) -> CommandSpec {
        let layout = server.layout;
        let cmd = match self {
            Self::Vllm => CommandSpec::new("vllm")
                .arg("serve")
                .arg(server.model_path.as_str())
                .flag("--port", server.port)
                .flag("--tensor-parallel-size", layout.tensor)
                .flag("--pipeline-parallel-size", layout.pipeline)
                .flag("--gpu-memory-utilization", server.gpu_memory_utilization)
                .flag_opt("--data-parallel-size", (layout.data > 1).then_some(layout.data))
                .flag_opt("--max-model-len", server.max_model_len)
                .flag_opt("--max-num-seqs", server.max_num_seqs)
                .flag_opt("--dtype", server.dtype.as_deref())
                .switch("--disable-log-requests", server.disable_log_requests)
                .switch("--enable-expert-parallel", server.enable_expert_parallel),
            // Request logging and expert parallelism are vLLM switches; SGLang
            // takes its equivalents through `extra_args`.
            Self::Sglang => CommandSpec::new("python")
                .arg("-m")
                .arg("sglang.launch_server")
                .flag("--model-path", server.model_path.as_str())
                .flag("--host", "0.0.0.0")
                .flag("--port", server.port)
                .flag("--tp-size", layout.tensor)
                .flag("--dp-size", layout.data)
                .flag_opt("--pp-size", (layout.pipeline > 1).then_some(layout.pipeline))
                .flag("--mem-fraction-static", server.gpu_memory_utilization)
                .flag_opt("--context-length", server.max_model_len)
                .flag_opt("--max-running-requests", server.max_num_seqs)
                .flag_opt("--dtype", server.dtype.as_deref()),
        };
        let cmd = cmd.extra_args(&server.extra_args);
        match &server.hf_token {
            Some(token) => cmd.env("HF_TOKEN", token.clone()),
            None => cmd,
        }
    }

    /// Load-generator invocation for one trial. `result_dir` and
    /// `result_file` name where the tool writes its JSON result on the target.
    pub fn bench_command(
        &self,
        trial: &Trial,
        base_url: &str,
        result_dir: &str,
        result_file: &str,
    ) -> CommandSpec {
        let p = &trial.params;
        let model = trial.server.model_path.as_str();
        let cmd = match self {
            Self::Vllm => CommandSpec::new("vllm")
                .arg("bench")
                .arg("serve")
                .flag("--backend", "vllm")
                .flag("--base-url", base_url)
                .flag("--model", model)
                .flag("--endpoint", trial.endpoint.as_str())
                .flag("--dataset-name", "random")
                .flag("--random-input-len", p.context_size)
                .flag("--random-output-len", p.output_len)
                .flag("--num-prompts", p.num_prompts)
                .flag("--max-concurrency", p.concurrency)
                .flag("--request-rate", "inf")
                .arg("--ignore-eos")
                .flag("--percentile-metrics", "ttft,tpot,itl,e2el")
                .arg("--save-result")
                .flag("--result-dir", result_dir)
                .flag("--result-filename", result_file),
            Self::Sglang => CommandSpec::new("python")
                .arg("-m")
                .arg("sglang.bench_serving")
                .flag("--backend", "sglang")
                .flag("--base-url", base_url)
                .flag("--model", model)
                .flag("--dataset-name", "random")
                .flag("--random-input-len", p.context_size)
                .flag("--random-output-len", p.output_len)
                .flag("--num-prompts", p.num_prompts)
                .flag("--max-concurrency", p.concurrency)
                .flag("--request-rate", "inf")
                .flag("--output-file", format!("{result_dir}/{result_file}")),
        };
        cmd.extra_args(&trial.bench_extra_args)
    }
}
