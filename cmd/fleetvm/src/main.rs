//! fleetvm: fleet-node agent that runs control-plane jobs in Firecracker microVMs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pkg_constants::paths;
use pkg_types::config::RunnerConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod benchmark;
mod doctor;
mod kill;
mod snapshot;
mod start;

#[derive(Parser)]
#[command(name = "fleetvm")]
#[command(about = "Fleet node agent: runs jobs in Firecracker microVMs")]
#[command(version)]
struct Cli {
    /// Path to the runner YAML config
    #[arg(long, short, global = true, default_value = paths::DEFAULT_CONFIG)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent until terminated (SIGUSR1 drains, SIGTERM/SIGINT stop)
    Start,
    /// Force-kill the VM of one job and clean up after it
    Kill(kill::KillArgs),
    /// Check the host for orphaned VMs, stale locks and leaked namespaces
    Doctor,
    /// Run one command through a full VM lifecycle and print phase timings
    Benchmark(benchmark::BenchmarkArgs),
    /// Cold-boot a VM and capture a snapshot for fast boots
    Snapshot(snapshot::SnapshotArgs),
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .init();
    }
}

/// Parse and schema-check a config without requiring its paths to exist.
/// Inspection commands must work on a half-broken host.
fn read_config(path: &Path) -> Result<RunnerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config = RunnerConfig::parse(&content)
        .with_context(|| format!("invalid config {}", path.display()))?;
    config.validate_schema()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let result = match cli.command {
        Command::Start => start::run(&cli.config).await,
        Command::Kill(args) => kill::run(&cli.config, args).await,
        Command::Doctor => doctor::run(&cli.config).await,
        Command::Benchmark(args) => benchmark::run(&cli.config, args).await,
        Command::Snapshot(args) => snapshot::run(&cli.config, args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
