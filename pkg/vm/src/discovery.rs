//! Find VM and proxy processes on the host.
//!
//! The scheduler keeps its state in memory only, so after a crash the
//! process table is the only record of which VMs are still running. A
//! Firecracker command line carries both the namespace (`ip netns exec
//! <ns>`) and the VmId (`--id`, and the API socket path), which is enough
//! to join a process back to a run.

use pkg_types::VmId;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmProcessInfo {
    pub pid: u32,
    pub vm_id: VmId,
    pub namespace: Option<String>,
    pub api_socket: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyProcessInfo {
    pub pid: u32,
    pub cmdline: String,
}

/// Parse a Firecracker command line (possibly wrapped in sudo / ip netns exec).
///
/// The VmId comes from `--id`, or failing that from the API socket's parent
/// directory (`…/<vm_id>/api.sock`).
pub fn parse_vm_cmdline(args: &[String]) -> Option<VmProcessInfoParts> {
    let fc_idx = args.iter().position(|a| {
        std::path::Path::new(a)
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with("firecracker"))
    })?;

    let namespace = args[..fc_idx]
        .windows(3)
        .find(|w| w[0] == "netns" && w[1] == "exec")
        .map(|w| w[2].clone());

    let fc_args = &args[fc_idx + 1..];
    let flag = |name: &str| {
        fc_args
            .windows(2)
            .find(|w| w[0] == name)
            .map(|w| w[1].clone())
            .or_else(|| {
                let prefix = format!("{}=", name);
                fc_args
                    .iter()
                    .find_map(|a| a.strip_prefix(&prefix).map(String::from))
            })
    };

    let api_socket = PathBuf::from(flag("--api-sock")?);
    let vm_id = flag("--id")
        .and_then(|id| VmId::parse(&id))
        .or_else(|| {
            api_socket
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| VmId::parse(&n.to_string_lossy()))
        })?;

    Some(VmProcessInfoParts {
        vm_id,
        namespace,
        api_socket,
    })
}

/// Command-line derived part of [`VmProcessInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmProcessInfoParts {
    pub vm_id: VmId,
    pub namespace: Option<String>,
    pub api_socket: PathBuf,
}

/// Whether `args` is the proxy: its binary name matches and, if given, it
/// runs with our CA directory.
pub fn is_proxy_cmdline(args: &[String], binary: &str, ca_dir: Option<&str>) -> bool {
    let binary_name = std::path::Path::new(binary)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| binary.to_string());
    let runs_binary = args.iter().take(3).any(|a| {
        std::path::Path::new(a)
            .file_name()
            .is_some_and(|n| n.to_string_lossy() == binary_name)
    });
    let uses_ca = match ca_dir {
        Some(dir) => {
            let want = format!("confdir={}", dir);
            args.iter().any(|a| a == &want)
        }
        None => true,
    };
    runs_binary && uses_ca
}

fn process_table() -> Vec<(u32, Vec<String>)> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    sys.processes()
        .values()
        .map(|p| {
            let cmd = p
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy().to_string())
                .collect();
            (p.pid().as_u32(), cmd)
        })
        .collect()
}

/// Firecracker processes whose API socket lives under `vm_dir`, i.e. the
/// VMs of the runner owning that directory.
pub fn scan_vm_processes(vm_dir: &Path) -> Vec<VmProcessInfo> {
    collect_vm_processes(process_table(), vm_dir)
}

/// Pick this runner's Firecracker processes out of a process table.
///
/// A sudo-wrapped launch shows up twice: the sudo process (whose argv still
/// has `ip netns exec <ns>`) and Firecracker itself (`ip` execs it). Such
/// pairs are merged into Firecracker's pid with sudo's namespace; two real
/// Firecracker processes for one VmId are both reported.
pub fn collect_vm_processes(table: Vec<(u32, Vec<String>)>, vm_dir: &Path) -> Vec<VmProcessInfo> {
    let mut direct: Vec<VmProcessInfo> = Vec::new();
    let mut wrappers: Vec<VmProcessInfo> = Vec::new();
    for (pid, args) in table {
        let Some(parts) = parse_vm_cmdline(&args) else {
            continue;
        };
        if !parts.api_socket.starts_with(vm_dir) {
            continue;
        }
        let info = VmProcessInfo {
            pid,
            vm_id: parts.vm_id,
            namespace: parts.namespace,
            api_socket: parts.api_socket,
        };
        if args.first().is_some_and(|a| a.ends_with("sudo")) {
            wrappers.push(info);
        } else {
            direct.push(info);
        }
    }

    for wrapper in wrappers {
        let mut matched = false;
        for p in direct.iter_mut().filter(|p| p.vm_id == wrapper.vm_id) {
            matched = true;
            if p.namespace.is_none() {
                p.namespace = wrapper.namespace.clone();
            }
        }
        if !matched {
            direct.push(wrapper);
        }
    }
    direct.sort_by(|a, b| a.vm_id.cmp(&b.vm_id).then(a.pid.cmp(&b.pid)));
    direct
}

/// Proxy processes matching `binary` (and our CA dir when given).
pub fn scan_proxy_processes(binary: &str, ca_dir: Option<&str>) -> Vec<ProxyProcessInfo> {
    process_table()
        .into_iter()
        .filter(|(_, args)| !args.first().is_some_and(|a| a.ends_with("sudo")))
        .filter(|(_, args)| is_proxy_cmdline(args, binary, ca_dir))
        .map(|(pid, args)| ProxyProcessInfo {
            pid,
            cmdline: args.join(" "),
        })
        .collect()
}

/// Reconciliation of running VMs against the runs a status file claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// VM processes with no active run.
    pub orphans: Vec<VmProcessInfo>,
    /// Active runs with no VM process.
    pub missing: Vec<String>,
    /// VmIds with more than one process.
    pub duplicates: Vec<VmId>,
}

impl Reconciliation {
    pub fn is_healthy(&self) -> bool {
        self.orphans.is_empty() && self.missing.is_empty() && self.duplicates.is_empty()
    }
}

pub fn reconcile(active_run_ids: &[String], processes: &[VmProcessInfo]) -> Reconciliation {
    let active: HashSet<VmId> = active_run_ids
        .iter()
        .map(|id| VmId::from_run_id(id))
        .collect();

    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for p in processes {
        if !seen.insert(p.vm_id.clone()) && !duplicates.contains(&p.vm_id) {
            duplicates.push(p.vm_id.clone());
        }
    }

    Reconciliation {
        orphans: processes
            .iter()
            .filter(|p| !active.contains(&p.vm_id))
            .cloned()
            .collect(),
        missing: active_run_ids
            .iter()
            .filter(|id| !seen.contains(&VmId::from_run_id(id)))
            .cloned()
            .collect(),
        duplicates,
    }
}
