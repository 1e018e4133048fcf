use std::path::Path;
use std::process::ExitCode;

use anyhow::{Result, bail};
use nix::sys::signal::Signal;
use pkg_constants::network::TAP_DEVICE;
use pkg_network::HostCommand;
use pkg_network::command::in_netns;
use pkg_runner::StatusWriter;
use pkg_types::VmId;
use pkg_vm::discovery::{VmProcessInfo, scan_vm_processes};
use pkg_vm::process::signal;
use pkg_vm::{Cleanup, CleanupReport, VmPaths};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

#[derive(clap::Args)]
pub struct KillArgs {
    /// Run id of the job to kill
    pub job_id: String,
    /// Skip the confirmation prompt
    #[arg(long, short, default_value_t = false)]
    pub yes: bool,
}

pub async fn run(config_path: &Path, args: KillArgs) -> Result<ExitCode> {
    let config = crate::read_config(config_path)?;
    let vm_id = VmId::from_run_id(&args.job_id);

    if !args.yes && !confirm(&args.job_id, &vm_id).await? {
        println!("Aborted.");
        return Ok(ExitCode::FAILURE);
    }

    let cmd = HostCommand::detect();
    let processes: Vec<VmProcessInfo> = scan_vm_processes(&config.vm_dir())
        .into_iter()
        .filter(|p| p.vm_id == vm_id)
        .collect();
    info!(vm_id = %vm_id, "[kill] found {} VM process(es)", processes.len());

    let namespace = match processes.iter().find_map(|p| p.namespace.clone()) {
        Some(ns) => Some(ns),
        None => match processes.first() {
            Some(p) => identify_namespace(&cmd, p.pid).await,
            None => None,
        },
    };
    let paths = VmPaths::new(&config.vm_dir(), &vm_id);
    let status = StatusWriter::new(config.status_path());

    let report = Cleanup::new()
        .step("kill vm process", async {
            if processes.is_empty() {
                bail!("no firecracker process for {}", vm_id);
            }
            for p in &processes {
                signal(&cmd, p.pid, Signal::SIGKILL).await?;
            }
            Ok(())
        })
        .step("delete tap device", async {
            let Some(ns) = &namespace else {
                bail!("namespace unknown");
            };
            cmd.run(&in_netns(ns, &["ip", "link", "delete", TAP_DEVICE]))
                .await?;
            Ok(())
        })
        .step("remove work dir", paths.remove())
        .step("update status file", async {
            if !status.remove_run(&args.job_id).await? {
                bail!("{} not listed as active", args.job_id);
            }
            Ok(())
        })
        .run()
        .await;

    print_report(&report);
    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn confirm(job_id: &str, vm_id: &VmId) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("Kill job {} (vm {})? [y/N] ", job_id, vm_id).as_bytes())
        .await?;
    stdout.flush().await?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(is_yes(&line))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Namespace of `pid` when its command line did not name one.
async fn identify_namespace(cmd: &HostCommand, pid: u32) -> Option<String> {
    let pid = pid.to_string();
    let out = cmd
        .run(&["ip", "netns", "identify", pid.as_str()])
        .await
        .ok()?;
    let ns = out.trim();
    (!ns.is_empty()).then(|| ns.to_string())
}

fn print_report(report: &CleanupReport) {
    for outcome in &report.outcomes {
        match &outcome.error {
            None => println!("  [ok]   {}", outcome.name),
            Some(err) => println!("  [fail] {}: {}", outcome.name, err),
        }
    }
}
