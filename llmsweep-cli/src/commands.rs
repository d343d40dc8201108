//! Subcommand handlers.

use anyhow::Context;
use llmsweep_core::config::{OnExisting, SweepConfig, load_config};
use llmsweep_core::orchestrator::{RunOrchestrator, RunOutcome, plan};
use llmsweep_core::provider::{ProviderKind, build_provider};
use llmsweep_core::sweep::ServerGroup;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

pub const EXIT_FATAL: u8 = 1;
pub const EXIT_NOTHING_STARTED: u8 = 2;
pub const EXIT_INTERRUPTED: u8 = 130;

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run a sweep on this machine
    Local(RunArgs),
    /// Run a sweep on the SSH host from the `remote` block
    Remote(RunArgs),
    /// Run a sweep on a cloud instance created from the `cloud` block
    Cloud(RunArgs),
    /// Print the trials a sweep would run, grouped by server
    Plan {
        /// Sweep configuration file (YAML)
        config: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Sweep configuration file (YAML)
    pub config: PathBuf,

    /// Re-run trials that already have a result
    #[arg(long)]
    pub overwrite: bool,

    /// Print the plan without touching any resource
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn handle_command(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Local(args) => run(ProviderKind::Local, args).await,
        Commands::Remote(args) => run(ProviderKind::Remote, args).await,
        Commands::Cloud(args) => run(ProviderKind::Cloud, args).await,
        Commands::Plan { config } => {
            let config = load(&config)?;
            print!("{}", render_plan(&plan(&config)?));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load(path: &Path) -> anyhow::Result<SweepConfig> {
    load_config(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(kind: ProviderKind, args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut config = load(&args.config)?;
    if args.overwrite {
        config.on_existing = OnExisting::Overwrite;
    }
    let groups = plan(&config)?;
    if args.dry_run {
        print!("{}", render_plan(&groups));
        return Ok(ExitCode::SUCCESS);
    }
    let provider = build_provider(&config, kind)?;

    let cancel = CancellationToken::new();
    tokio::spawn(forward_signals(cancel.clone()));

    let orchestrator = RunOrchestrator::new(provider, &config);
    let report = orchestrator.run_groups(groups, &cancel).await;

    println!();
    print!("{}", report.summary.render_table());
    if let Some(path) = &report.summary_path {
        println!("Summary written to {}", path.display());
    }
    Ok(ExitCode::from(exit_code(report.outcome)))
}

fn exit_code(outcome: RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Completed => 0,
        RunOutcome::NothingStarted => EXIT_NOTHING_STARTED,
        RunOutcome::Interrupted => EXIT_INTERRUPTED,
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM. Later signals are
/// swallowed so cleanup is not cut short.
#[cfg(unix)]
async fn forward_signals(token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(error = %e, "Cannot listen for signals");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = sigint.recv() => tracing::info!("Received SIGINT"),
        }
        on_signal(&token);
    }
}

#[cfg(not(unix))]
async fn forward_signals(token: CancellationToken) {
    while tokio::signal::ctrl_c().await.is_ok() {
        on_signal(&token);
    }
}

fn on_signal(token: &CancellationToken) {
    if token.is_cancelled() {
        tracing::warn!("Cleanup in progress, ignoring signal");
    } else {
        tracing::warn!("Interrupt received, stopping server and releasing resources");
        token.cancel();
    }
}

pub fn render_plan(groups: &[ServerGroup]) -> String {
    let mut out = String::new();
    let total: usize = groups.iter().map(|g| g.trials.len()).sum();
    let _ = writeln!(out, "{} trials in {} server groups", total, groups.len());
    for group in groups {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "[{}] {} ({} GPUs, port {})",
            group.index,
            group.server.label(),
            group.server.layout.world_size().unwrap_or_default(),
            group.server.port
        );
        for trial in &group.trials {
            let _ = writeln!(out, "    {}", trial.id);
        }
    }
    out
}
