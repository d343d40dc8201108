//! # llmsweep core
//!
//! Benchmark sweeps for LLM inference servers. A sweep configuration is
//! expanded into trials, trials sharing a server configuration are grouped,
//! and each group runs on a resource from a [`ResourceProvider`]: this
//! machine, an SSH host, or a cloud instance created for the purpose.
//! Servers and resources are always cleaned up, including on interruption.

pub mod artifacts;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod provider;
pub mod result;
pub mod server;
pub mod session;
pub mod shell;
pub mod summary;
pub mod sweep;

// Re-export commonly used types at the crate root.
pub use artifacts::ArtifactStore;
pub use config::{OnExisting, ParallelismLayout, RunConfig, SweepConfig, load_config};
pub use engine::Engine;
pub use error::{AcquireFailure, Result, SweepError};
pub use executor::TrialExecutor;
pub use orchestrator::{RunOrchestrator, RunOutcome, RunReport, plan};
pub use provider::{
    CommandOutput, ProbeOutcome, ProviderKind, ResourceHandle, ResourceProvider, build_provider,
};
pub use result::{TrialResult, TrialStatus};
pub use server::{ServerHandle, ServerManager, ServerSettings, ServerState};
pub use session::ActiveSession;
pub use summary::{GroupOutcome, RunSummary};
pub use sweep::{ServerConfig, ServerGroup, Trial, TrialParams, expand, expand_all, group_trials};
