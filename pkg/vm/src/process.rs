//! Firecracker process lifecycle.
//!
//! Firecracker is launched inside the VM's network namespace with its
//! working directory set to the per-VM directory, so relative paths baked
//! into a snapshot (overlay, vsock socket) resolve to this VM's files.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use pkg_constants::paths::{
    API_SOCKET_FILENAME, OVERLAY_LINK_FILENAME, VM_LOG_FILENAME, VSOCK_SOCKET_FILENAME,
};
use pkg_network::HostCommand;
use pkg_network::command::in_netns;
use pkg_types::VmId;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Files of one VM, all under `<vm_dir>/<vm_id>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    pub workdir: PathBuf,
    pub api_socket: PathBuf,
    pub vsock_socket: PathBuf,
    pub overlay_link: PathBuf,
    pub log: PathBuf,
}

impl VmPaths {
    pub fn new(vm_dir: &Path, vm_id: &VmId) -> Self {
        let workdir = vm_dir.join(vm_id.as_str());
        Self {
            api_socket: workdir.join(API_SOCKET_FILENAME),
            vsock_socket: workdir.join(VSOCK_SOCKET_FILENAME),
            overlay_link: workdir.join(OVERLAY_LINK_FILENAME),
            log: workdir.join(VM_LOG_FILENAME),
            workdir,
        }
    }

    /// Create the work directory and link the pooled overlay into it.
    pub async fn prepare(&self, overlay: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.workdir)
            .await
            .with_context(|| format!("create {}", self.workdir.display()))?;
        for stale in [&self.api_socket, &self.vsock_socket, &self.overlay_link] {
            let _ = tokio::fs::remove_file(stale).await;
        }
        tokio::fs::symlink(overlay, &self.overlay_link)
            .await
            .with_context(|| {
                format!(
                    "link {} → {}",
                    self.overlay_link.display(),
                    overlay.display()
                )
            })?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.workdir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", self.workdir.display())),
        }
    }
}

/// argv that launches Firecracker for `vm_id` inside `namespace`.
pub fn firecracker_argv(
    cmd: &HostCommand,
    binary: &Path,
    namespace: &str,
    api_socket: &Path,
    vm_id: &VmId,
) -> Vec<String> {
    let binary = binary.display().to_string();
    let api_socket = api_socket.display().to_string();
    cmd.argv(&in_netns(
        namespace,
        &[
            binary.as_str(),
            "--api-sock",
            api_socket.as_str(),
            "--id",
            vm_id.as_str(),
        ],
    ))
}

/// A running Firecracker process.
pub struct VmProcess {
    vm_id: VmId,
    pid: u32,
    child: Child,
    cmd: HostCommand,
}

impl VmProcess {
    pub async fn spawn(
        cmd: HostCommand,
        binary: &Path,
        namespace: &str,
        paths: &VmPaths,
        vm_id: &VmId,
    ) -> Result<Self> {
        let log = std::fs::File::create(&paths.log)
            .with_context(|| format!("create {}", paths.log.display()))?;
        let log_err = log.try_clone()?;

        let argv = firecracker_argv(&cmd, binary, namespace, &paths.api_socket, vm_id);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty firecracker command"))?;

        let child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&paths.workdir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn firecracker for {}", vm_id))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("firecracker for {} exited immediately", vm_id))?;

        info!(vm_id = %vm_id, ns = %namespace, "[vm] firecracker started (pid={})", pid);
        Ok(Self {
            vm_id: vm_id.clone(),
            pid,
            child,
            cmd,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn vm_id(&self) -> &VmId {
        &self.vm_id
    }

    /// Whether the process has exited.
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        signal(&self.cmd, self.pid, Signal::SIGTERM).await?;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                debug!(vm_id = %self.vm_id, "[vm] firecracker exited ({})", status?);
            }
            Err(_) => {
                warn!(vm_id = %self.vm_id, "[vm] firecracker ignored SIGTERM, killing");
                signal(&self.cmd, self.pid, Signal::SIGKILL).await?;
                let _ = self.child.kill().await;
            }
        }
        Ok(())
    }
}

/// Signal `pid`, escalating through sudo when the process belongs to root.
pub async fn signal(cmd: &HostCommand, pid: u32, sig: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) if cmd.uses_sudo() => {
            let flag = format!("-{}", sig.as_str().trim_start_matches("SIG"));
            let pid = pid.to_string();
            cmd.run(&["kill", flag.as_str(), pid.as_str()]).await?;
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("kill -{} {}", sig, pid)),
    }
}
