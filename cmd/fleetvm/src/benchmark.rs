use std::collections::HashMap;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use pkg_runner::Teardown;
use pkg_types::config::RunnerConfig;
use pkg_types::job::{ExecMode, ExecutionContext, ExecutionOutcome};
use tracing::{info, warn};

use crate::start::HostResources;

#[derive(clap::Args)]
pub struct BenchmarkArgs {
    /// Command run as the payload inside the guest
    #[arg(long, default_value = "echo hello")]
    pub command: String,
    /// Number of sequential executions
    #[arg(long, default_value_t = 1)]
    pub iterations: u32,
}

pub async fn run(config_path: &Path, args: BenchmarkArgs) -> Result<ExitCode> {
    let config = RunnerConfig::load(config_path)?;
    let resources = HostResources::acquire(&config).await?;
    let executor = resources.executor(&config);

    let mut outcomes = Vec::new();
    for i in 0..args.iterations.max(1) {
        let ctx = benchmark_context();
        info!(run_id = %ctx.run_id, "[benchmark] iteration {}: {}", i + 1, args.command);
        let outcome = executor
            .execute_command(&ctx, ExecMode::Exec, &args.command)
            .await;
        print_outcome(i + 1, &outcome);
        outcomes.push(outcome);
    }

    if let Err(e) = resources.teardown().await {
        warn!("[benchmark] {:#}", e);
    }
    if outcomes.len() > 1 {
        let totals: Vec<u64> = outcomes.iter().map(ExecutionOutcome::total_ms).collect();
        let mean = totals.iter().sum::<u64>() / totals.len() as u64;
        println!(
            "\n{} runs: min {}ms, mean {}ms, max {}ms",
            totals.len(),
            totals.iter().min().copied().unwrap_or_default(),
            mean,
            totals.iter().max().copied().unwrap_or_default()
        );
    }
    Ok(if outcomes.iter().all(ExecutionOutcome::is_success) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn benchmark_context() -> ExecutionContext {
    ExecutionContext {
        run_id: uuid::Uuid::new_v4().to_string(),
        prompt: "benchmark".to_string(),
        image: None,
        working_dir: "/home/user/workspace".to_string(),
        resume_session: None,
        storage: Vec::new(),
        sandbox_token: String::new(),
        env: HashMap::new(),
        timeout_ms: None,
    }
}

fn print_outcome(iteration: u32, outcome: &ExecutionOutcome) {
    println!("\nRun {}", iteration);
    println!("{:<12} {:>8}", "PHASE", "MS");
    for d in &outcome.durations {
        println!("{:<12} {:>8}", d.phase, d.ms);
    }
    println!("{:<12} {:>8}", "total", outcome.total_ms());
    match &outcome.error {
        Some(err) => println!("failed: {}", err),
        None => println!("exit code: {}", outcome.exit_code),
    }
}
