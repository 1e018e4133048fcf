//! Executor: one job, one microVM.
//!
//! acquire (overlay + namespace) → boot (cold or from snapshot) → guest
//! setup → payload → teardown. Resources are recorded in a [`VmSlot`] as
//! they are acquired and teardown releases exactly those, whatever step
//! failed.

use anyhow::{Context, Result, anyhow};
use pkg_constants::paths::{
    OVERLAY_LINK_FILENAME, SNAPSHOT_MEMORY_FILENAME, SNAPSHOT_OVERLAY_FILENAME,
    SNAPSHOT_STATE_FILENAME, VSOCK_SOCKET_FILENAME,
};
use pkg_constants::runtime::{API_READY_POLL_MS, API_READY_TIMEOUT_MS, VM_STOP_GRACE_MS};
use pkg_constants::vm::{GUEST_IFACE_ID, HOST_LISTEN_PORT};
use pkg_guest::{GuestChannel, VsockChannel};
use pkg_network::proxy::PROXY_CA_CERT_FILENAME;
use pkg_network::{HostCommand, NamespaceEntry, NamespacePool};
use pkg_pool::{OverlayEntry, OverlayPool, copy_sparse};
use pkg_types::VmId;
use pkg_types::config::{RunnerConfig, SnapshotConfig};
use pkg_types::job::{ExecMode, ExecutionContext, ExecutionOutcome};
use pkg_vm::{
    Cleanup, CleanupReport, FirecrackerClient, MemoryBackend, NetworkOverride, SnapshotType,
    VmConfig, VmConfigBuilder, VmPaths, VmProcess,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::setup;
use crate::timing::PhaseClock;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub firecracker_binary: PathBuf,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    /// Boot from this snapshot instead of the kernel when set.
    pub snapshot: Option<SnapshotConfig>,
    pub vm_dir: PathBuf,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub boot_timeout_ms: u64,
    pub exec_timeout_ms: u64,
    /// Proxy CA to install in the guest trust store.
    pub proxy_ca_cert: Option<PathBuf>,
}

impl ExecutorConfig {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            firecracker_binary: config.firecracker.binary.clone(),
            kernel: config.firecracker.kernel.clone(),
            rootfs: config.firecracker.rootfs.clone(),
            snapshot: config.firecracker.snapshot.clone(),
            vm_dir: config.vm_dir(),
            vcpus: config.sandbox.vcpu,
            memory_mib: config.sandbox.memory_mb,
            boot_timeout_ms: config.sandbox.boot_timeout_ms,
            exec_timeout_ms: config.sandbox.exec_timeout_ms,
            proxy_ca_cert: config
                .proxy
                .as_ref()
                .map(|p| p.ca_dir.join(PROXY_CA_CERT_FILENAME)),
        }
    }

    /// Cold-boot config. Overlay and vsock paths are relative to the VM work
    /// directory, which is Firecracker's cwd, so a snapshot taken from this
    /// VM restores against whichever work directory loads it.
    pub fn vm_config(&self, ns: &NamespaceEntry) -> VmConfig {
        VmConfigBuilder::new(
            &self.kernel,
            &self.rootfs,
            OVERLAY_LINK_FILENAME,
            VSOCK_SOCKET_FILENAME,
        )
        .vcpus(self.vcpus)
        .memory_mib(self.memory_mib)
        .network(ns.tap.clone(), ns.guest_ip, ns.gateway, ns.guest_mask)
        .build()
    }
}

enum BootMode {
    Cold,
    Snapshot(SnapshotConfig),
}

/// Everything acquired for one VM so far.
struct VmSlot {
    vm_id: VmId,
    paths: VmPaths,
    overlay: Option<OverlayEntry>,
    namespace: Option<NamespaceEntry>,
    process: Option<VmProcess>,
    guest: Option<VsockChannel>,
}

impl VmSlot {
    fn new(vm_dir: &Path, vm_id: VmId) -> Self {
        Self {
            paths: VmPaths::new(vm_dir, &vm_id),
            vm_id,
            overlay: None,
            namespace: None,
            process: None,
            guest: None,
        }
    }

    fn guest(&self) -> Result<&VsockChannel> {
        self.guest
            .as_ref()
            .ok_or_else(|| anyhow!("guest channel not connected"))
    }
}

pub struct Executor {
    config: ExecutorConfig,
    overlays: OverlayPool,
    namespaces: NamespacePool,
    cmd: HostCommand,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        overlays: OverlayPool,
        namespaces: NamespacePool,
        cmd: HostCommand,
    ) -> Self {
        Self {
            config,
            overlays,
            namespaces,
            cmd,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn overlays(&self) -> &OverlayPool {
        &self.overlays
    }

    pub fn namespaces(&self) -> &NamespacePool {
        &self.namespaces
    }

    /// Run the agent for `ctx`.
    pub async fn execute(&self, ctx: &ExecutionContext, mode: ExecMode) -> ExecutionOutcome {
        self.execute_command(ctx, mode, &setup::agent_command())
            .await
    }

    /// Run `command` as the payload instead of the agent.
    pub async fn execute_command(
        &self,
        ctx: &ExecutionContext,
        mode: ExecMode,
        command: &str,
    ) -> ExecutionOutcome {
        let mut clock = PhaseClock::new();
        let mut slot = VmSlot::new(&self.config.vm_dir, VmId::from_run_id(&ctx.run_id));
        info!(run_id = %ctx.run_id, vm_id = %slot.vm_id, "[executor] starting execution");

        let boot_mode = match &self.config.snapshot {
            Some(snap) => BootMode::Snapshot(snap.clone()),
            None => BootMode::Cold,
        };
        let result = self
            .run(ctx, mode, command, &boot_mode, &mut slot, &mut clock)
            .await;

        let report = self.teardown(slot, result.is_ok()).await;
        clock.mark("teardown");
        if !report.is_clean() {
            warn!(
                run_id = %ctx.run_id,
                "[executor] teardown incomplete: {} step(s) failed",
                report.failures().count()
            );
        }

        let outcome = match result {
            Ok(exit_code) => {
                info!(
                    run_id = %ctx.run_id,
                    "[executor] payload exited with {} after {}ms",
                    exit_code,
                    clock.elapsed_ms()
                );
                ExecutionOutcome::success(exit_code)
            }
            Err(e) => {
                warn!(run_id = %ctx.run_id, "[executor] execution failed: {:#}", e);
                ExecutionOutcome::failed(format!("{:#}", e))
            }
        };
        outcome.with_durations(clock.into_phases())
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        mode: ExecMode,
        command: &str,
        boot_mode: &BootMode,
        slot: &mut VmSlot,
        clock: &mut PhaseClock,
    ) -> Result<i32> {
        self.boot(slot, boot_mode, clock).await?;
        let guest = slot.guest()?;

        setup::stage_scripts(guest).await?;
        if let Some(ca) = &self.config.proxy_ca_cert {
            let pem = tokio::fs::read(ca)
                .await
                .with_context(|| format!("read proxy CA {}", ca.display()))?;
            setup::install_proxy_ca(guest, &pem).await?;
        }
        clock.mark("scripts");

        setup::restore_storage(guest, &ctx.storage).await?;
        clock.mark("storage");

        if let Some(session) = &ctx.resume_session {
            let path = setup::restore_session(guest, &ctx.working_dir, session).await?;
            info!(run_id = %ctx.run_id, "[executor] restored session {}", path);
        }
        setup::write_prompt(guest, ctx).await?;
        clock.mark("session");

        let timeout_ms = ctx.timeout_ms.unwrap_or(self.config.exec_timeout_ms);
        let exit_code = setup::run_payload(
            guest,
            command,
            &setup::payload_env(ctx),
            timeout_ms,
            mode,
        )
        .await?;
        clock.mark("payload");
        Ok(exit_code)
    }

    async fn boot(&self, slot: &mut VmSlot, boot_mode: &BootMode, clock: &mut PhaseClock) -> Result<()> {
        let overlay = self.overlays.acquire().await.context("acquire overlay")?;
        let overlay_path = overlay.path.clone();
        slot.overlay = Some(overlay);
        let ns = self
            .namespaces
            .acquire()
            .await
            .context("acquire namespace")?;
        slot.namespace = Some(ns.clone());
        clock.mark("acquire");

        slot.paths.prepare(&overlay_path).await?;
        // Listen before Firecracker starts so the guest's first connect lands.
        slot.guest = Some(
            VsockChannel::listen(&slot.paths.vsock_socket, HOST_LISTEN_PORT)
                .context("bind guest listener")?,
        );
        let process = VmProcess::spawn(
            self.cmd,
            &self.config.firecracker_binary,
            &ns.name,
            &slot.paths,
            &slot.vm_id,
        )
        .await?;
        slot.process = Some(process);

        let client = FirecrackerClient::new(&slot.paths.api_socket);
        client
            .wait_for_ready(
                Duration::from_millis(API_READY_TIMEOUT_MS),
                Duration::from_millis(API_READY_POLL_MS),
            )
            .await?;
        match boot_mode {
            BootMode::Cold => {
                client
                    .apply_config(&self.config.vm_config(&ns))
                    .await
                    .context("configure VM")?;
            }
            BootMode::Snapshot(snap) => {
                client
                    .load_snapshot(
                        &snap.snapshot,
                        &MemoryBackend::File(snap.memory.clone()),
                        true,
                        &[NetworkOverride {
                            iface_id: GUEST_IFACE_ID.to_string(),
                            host_dev_name: ns.tap.clone(),
                        }],
                    )
                    .await
                    .context("load snapshot")?;
            }
        }
        clock.mark("boot");

        slot.guest()?
            .wait_for_guest_connection(self.config.boot_timeout_ms)
            .await
            .context("guest agent did not connect")?;
        clock.mark("guest");
        info!(vm_id = %slot.vm_id, ns = %ns.name, "[executor] guest ready");
        Ok(())
    }

    /// Release everything in `slot`. Each step runs even if an earlier one
    /// failed. After a failed run the namespace is destroyed rather than
    /// recycled.
    async fn teardown(&self, slot: VmSlot, succeeded: bool) -> CleanupReport {
        let VmSlot {
            vm_id,
            paths,
            overlay,
            namespace,
            process,
            guest,
        } = slot;
        drop(guest);

        let report = Cleanup::new()
            .step("stop vm", async move {
                if let Some(mut process) = process {
                    process
                        .stop(Duration::from_millis(VM_STOP_GRACE_MS))
                        .await?;
                }
                Ok(())
            })
            .step("release namespace", async move {
                match namespace {
                    Some(ns) if succeeded => self.namespaces.release(ns).await?,
                    Some(ns) => self.namespaces.discard(ns).await?,
                    None => {}
                }
                Ok(())
            })
            .step("delete overlay", async move {
                if let Some(overlay) = overlay {
                    self.overlays.release(overlay).await?;
                }
                Ok(())
            })
            .step("remove workdir", async move { paths.remove().await })
            .run()
            .await;
        info!(vm_id = %vm_id, "[executor] teardown finished ({} steps)", report.outcomes.len());
        report
    }

    /// Cold-boot a VM, wait for the guest, then pause it and write a full
    /// snapshot plus a copy of its overlay into `output`.
    pub async fn create_snapshot(&self, output: &Path) -> Result<SnapshotConfig> {
        tokio::fs::create_dir_all(output)
            .await
            .with_context(|| format!("create {}", output.display()))?;
        let output = tokio::fs::canonicalize(output).await?;

        let mut clock = PhaseClock::new();
        let mut slot = VmSlot::new(&self.config.vm_dir, VmId::from_run_id("snapshot"));
        let result = self.capture(&mut slot, &output, &mut clock).await;
        let report = self.teardown(slot, result.is_ok()).await;
        if !report.is_clean() {
            warn!(
                "[executor] snapshot teardown incomplete: {} step(s) failed",
                report.failures().count()
            );
        }
        for phase in clock.phases() {
            info!("[executor] snapshot phase {}: {}ms", phase.phase, phase.ms);
        }
        result
    }

    async fn capture(
        &self,
        slot: &mut VmSlot,
        output: &Path,
        clock: &mut PhaseClock,
    ) -> Result<SnapshotConfig> {
        self.boot(slot, &BootMode::Cold, clock).await?;

        let snapshot = SnapshotConfig {
            snapshot: output.join(SNAPSHOT_STATE_FILENAME),
            memory: output.join(SNAPSHOT_MEMORY_FILENAME),
            overlay: output.join(SNAPSHOT_OVERLAY_FILENAME),
        };
        let client = FirecrackerClient::new(&slot.paths.api_socket);
        client.pause().await.context("pause VM")?;
        client
            .create_snapshot(SnapshotType::Full, &snapshot.snapshot, &snapshot.memory)
            .await
            .context("create snapshot")?;
        let overlay = slot
            .overlay
            .as_ref()
            .ok_or_else(|| anyhow!("no overlay acquired"))?;
        copy_sparse(&overlay.path, &snapshot.overlay).await?;
        clock.mark("snapshot");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_pool::{OverlayFactory, PoolOptions, ResourcePool};

    const CONFIG: &str = r#"
name: runner-1
group: acme/default
data_dir: /var/lib/fleetvm
server: { url: "https://api.example.com", token: secret }
sandbox: { vcpu: 4, memory_mb: 4096, exec_timeout_ms: 1000 }
firecracker:
  binary: /usr/local/bin/firecracker
  kernel: /var/lib/fleetvm/vmlinux
  rootfs: /var/lib/fleetvm/rootfs.ext4
proxy: { port: 8080, ca_dir: /var/lib/fleetvm/proxy }
"#;

    fn ns() -> NamespaceEntry {
        NamespaceEntry {
            name: "fvm-runner-1-0".into(),
            tap: "vmtap0".into(),
            gateway: "172.16.0.1".parse().unwrap(),
            guest_ip: "172.16.0.2".parse().unwrap(),
            guest_mask: "255.255.255.252".parse().unwrap(),
            veth_host: "fvmh0".into(),
            veth_host_ip: "10.200.0.1".parse().unwrap(),
            veth_ns_ip: "10.200.0.2".parse().unwrap(),
            subnet: "10.200.0.0/30".into(),
        }
    }

    #[test]
    fn config_from_runner_config() {
        let cfg = ExecutorConfig::from_config(&RunnerConfig::parse(CONFIG).unwrap());
        assert_eq!(cfg.vm_dir, PathBuf::from("/var/lib/fleetvm/vms"));
        assert_eq!(cfg.vcpus, 4);
        assert_eq!(cfg.memory_mib, 4096);
        assert_eq!(
            cfg.proxy_ca_cert,
            Some(PathBuf::from("/var/lib/fleetvm/proxy/mitmproxy-ca-cert.pem"))
        );
        assert!(cfg.snapshot.is_none());
    }

    #[test]
    fn vm_config_uses_workdir_relative_paths() {
        let cfg = ExecutorConfig::from_config(&RunnerConfig::parse(CONFIG).unwrap());
        let vm = cfg.vm_config(&ns());
        assert_eq!(vm.drives[1].path_on_host, PathBuf::from("overlay.ext4"));
        assert_eq!(vm.vsock.uds_path, PathBuf::from("vsock.sock"));
        assert_eq!(vm.machine_config.vcpu_count, 4);
        assert_eq!(vm.network_interfaces[0].host_dev_name, "vmtap0");
        // Same inputs, same config.
        assert_eq!(vm, cfg.vm_config(&ns()));
    }

    #[tokio::test]
    async fn failed_acquire_is_reported_and_nothing_leaks() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file where the overlay directory should be.
        let blocked = tmp.path().join("overlays");
        std::fs::write(&blocked, b"").unwrap();

        let mut runner = RunnerConfig::parse(CONFIG).unwrap();
        runner.data_dir = tmp.path().to_path_buf();
        let overlays = ResourcePool::new(
            OverlayFactory::new(&blocked, 1).with_formatter(None),
            PoolOptions {
                size: 0,
                replenish_threshold: 0,
            },
        );
        let namespaces =
            pkg_network::pool_from_config(&runner, HostCommand::with_sudo(false)).unwrap();
        let executor = Executor::new(
            ExecutorConfig::from_config(&runner),
            overlays,
            namespaces,
            HostCommand::with_sudo(false),
        );

        let ctx: ExecutionContext = serde_json::from_str(
            r#"{"runId": "8f14e45f-ceea-467f-a8f6-1b2c3d4e5f60", "prompt": "p", "sandboxToken": "t"}"#,
        )
        .unwrap();
        let outcome = executor.execute(&ctx, ExecMode::Exec).await;
        assert!(!outcome.is_success());
        assert!(
            outcome.error.as_deref().unwrap().contains("acquire overlay"),
            "{:?}",
            outcome.error
        );
        let phases: Vec<_> = outcome.durations.iter().map(|d| d.phase.as_str()).collect();
        assert_eq!(phases, vec!["teardown"]);
        assert!(!tmp.path().join("vms").join("8f14e45f").exists());
        assert!(executor.namespaces().is_empty().await);
    }

    #[tokio::test]
    async fn failed_run_destroys_its_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let host = tmp.path().join("host.sh");
        std::fs::write(
            &host,
            "echo \"$*\" >> \"$(dirname \"$0\")/log\"\nexit 0\n",
        )
        .unwrap();
        let host: &'static str = Box::leak(host.display().to_string().into_boxed_str());
        let cmd = HostCommand::with_prefix(Box::leak(vec!["/bin/sh", host].into_boxed_slice()));
        // A regular file where the VM work dirs should go, so boot fails
        // after both pools handed out an entry.
        std::fs::write(tmp.path().join("vms"), b"").unwrap();

        let mut runner = RunnerConfig::parse(CONFIG).unwrap();
        runner.data_dir = tmp.path().to_path_buf();
        runner.sandbox.namespace_pool_size = Some(1);
        let overlays = ResourcePool::new(
            OverlayFactory::new(tmp.path().join("overlays"), 1).with_formatter(None),
            PoolOptions {
                size: 0,
                replenish_threshold: 0,
            },
        );
        let namespaces = pkg_network::pool_from_config(&runner, cmd).unwrap();
        namespaces.init().await.unwrap();
        let executor = Executor::new(
            ExecutorConfig::from_config(&runner),
            overlays,
            namespaces,
            cmd,
        );

        let ctx: ExecutionContext = serde_json::from_str(
            r#"{"runId": "8f14e45f-ceea-467f-a8f6-1b2c3d4e5f60", "prompt": "p", "sandboxToken": "t"}"#,
        )
        .unwrap();
        let outcome = executor.execute(&ctx, ExecMode::Exec).await;
        assert!(!outcome.is_success());

        let log = std::fs::read_to_string(tmp.path().join("log")).unwrap();
        let ns = format!("{}0", executor.namespaces().factory().prefix());
        assert!(log.lines().any(|l| l == format!("ip netns del {}", ns)), "{}", log);
        // The broken namespace was never health-checked for reuse.
        assert!(!log.contains("link show dev vmtap0"), "{}", log);
    }
}
