use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use pkg_network::HostCommand;
use pkg_network::netns::{namespace_prefix, parse_netns_list};
use pkg_runner::StatusWriter;
use pkg_runner::lock::{pid_alive, read_holder};
use pkg_types::status::{RunnerMode, RunnerStatus};
use pkg_vm::discovery::{
    ProxyProcessInfo, VmProcessInfo, reconcile, scan_proxy_processes, scan_vm_processes,
};
use tracing::warn;

/// What the host looks like right now.
#[derive(Debug, Default)]
struct Observation {
    status: Option<RunnerStatus>,
    lock_holder: Option<u32>,
    runner_alive: bool,
    vms: Vec<VmProcessInfo>,
    proxy_configured: bool,
    proxies: Vec<ProxyProcessInfo>,
    namespaces: Vec<String>,
}

pub async fn run(config_path: &Path) -> Result<ExitCode> {
    let config = crate::read_config(config_path)?;
    let status = match StatusWriter::new(config.status_path()).read().await {
        Ok(status) => status,
        Err(e) => {
            warn!("[doctor] {:#}", e);
            None
        }
    };
    let lock_holder = read_holder(&config.lock_path());
    let cmd = HostCommand::detect();
    let namespaces = match cmd.run(&["ip", "netns", "list"]).await {
        Ok(out) => parse_netns_list(&out, &namespace_prefix(&config.name)),
        Err(e) => {
            warn!("[doctor] cannot list namespaces: {:#}", e);
            Vec::new()
        }
    };
    let proxies = match &config.proxy {
        Some(p) => {
            let ca_dir = p.ca_dir.display().to_string();
            scan_proxy_processes(&p.binary, Some(ca_dir.as_str()))
        }
        None => Vec::new(),
    };

    let obs = Observation {
        status,
        lock_holder,
        runner_alive: lock_holder.is_some_and(pid_alive),
        vms: scan_vm_processes(&config.vm_dir()),
        proxy_configured: config.proxy.is_some(),
        proxies,
        namespaces,
    };

    print_observation(&obs);
    let problems = diagnose(&obs);
    if problems.is_empty() {
        println!("\nNo problems found.");
        return Ok(ExitCode::SUCCESS);
    }
    println!("\n{} problem(s):", problems.len());
    for p in &problems {
        println!("  - {}", p);
    }
    Ok(ExitCode::FAILURE)
}

fn print_observation(obs: &Observation) {
    match &obs.status {
        Some(s) => {
            println!("Mode:        {}", s.mode);
            println!("Active runs: {}", s.active_runs);
            for id in &s.active_run_ids {
                println!("  {}", id);
            }
            println!("Updated:     {}", s.updated_at.format("%Y-%m-%d %H:%M:%S"));
        }
        None => println!("Mode:        (no status file)"),
    }
    match obs.lock_holder {
        Some(pid) => println!(
            "Runner pid:  {} ({})",
            pid,
            if obs.runner_alive { "alive" } else { "dead" }
        ),
        None => println!("Runner pid:  (no lock file)"),
    }

    println!("\n{:<10} {:<8} {}", "VM", "PID", "NAMESPACE");
    for vm in &obs.vms {
        println!(
            "{:<10} {:<8} {}",
            vm.vm_id,
            vm.pid,
            vm.namespace.as_deref().unwrap_or("-")
        );
    }
    if obs.vms.is_empty() {
        println!("(no firecracker processes)");
    }

    if obs.proxy_configured {
        println!("\nProxy processes: {}", obs.proxies.len());
        for p in &obs.proxies {
            println!("  {} {}", p.pid, p.cmdline);
        }
    }
    println!("\nNamespaces: {}", obs.namespaces.len());
    for ns in &obs.namespaces {
        println!("  {}", ns);
    }
}

fn diagnose(obs: &Observation) -> Vec<String> {
    let mut problems = Vec::new();

    if let Some(pid) = obs.lock_holder
        && !obs.runner_alive
    {
        problems.push(format!("stale lock file: pid {} is not running", pid));
    }
    if let Some(status) = &obs.status
        && status.mode != RunnerMode::Stopped
        && !obs.runner_alive
    {
        problems.push(format!(
            "status file says {} but no runner is alive",
            status.mode
        ));
    }

    // A dead runner has no active runs, whatever its status file says.
    let active: Vec<String> = match &obs.status {
        Some(s) if obs.runner_alive => s.active_run_ids.clone(),
        _ => Vec::new(),
    };
    let rec = reconcile(&active, &obs.vms);
    for vm in &rec.orphans {
        problems.push(format!(
            "orphan VM {} (pid {}) has no active run",
            vm.vm_id, vm.pid
        ));
    }
    for run_id in &rec.missing {
        problems.push(format!("run {} is active but has no VM process", run_id));
    }
    for vm_id in &rec.duplicates {
        problems.push(format!("VM {} has more than one process", vm_id));
    }

    if obs.proxy_configured && obs.runner_alive && obs.proxies.is_empty() {
        problems.push("proxy is configured but not running".to_string());
    }
    if !obs.runner_alive {
        for p in &obs.proxies {
            problems.push(format!("orphan proxy process (pid {})", p.pid));
        }
        if !obs.namespaces.is_empty() {
            problems.push(format!(
                "{} leaked namespace(s): {}",
                obs.namespaces.len(),
                obs.namespaces.join(", ")
            ));
        }
    }
    problems
}
