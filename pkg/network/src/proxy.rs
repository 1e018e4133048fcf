//! Host-side HTTP(S) proxy the guests are DNAT'ed to.
//!
//! The proxy runs in transparent mode on every host address; each namespace
//! rewrites guest port 80/443 traffic to its own veth host IP, so one proxy
//! process serves all VMs.

use anyhow::{Context, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use pkg_constants::runtime::VM_STOP_GRACE_MS;
use pkg_types::config::ProxyConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How long the proxy must stay up after spawn to count as started.
const STARTUP_GRACE_MS: u64 = 300;

pub const PROXY_LOG_FILENAME: &str = "proxy.log";

/// CA certificate the proxy generates in its conf dir on first start.
pub const PROXY_CA_CERT_FILENAME: &str = "mitmproxy-ca-cert.pem";

/// Arguments for a transparent proxy using the CA in `ca_dir`.
pub fn proxy_args(port: u16, ca_dir: &Path) -> Vec<String> {
    vec![
        "--mode".to_string(),
        "transparent".to_string(),
        "--listen-host".to_string(),
        "0.0.0.0".to_string(),
        "--listen-port".to_string(),
        port.to_string(),
        "--set".to_string(),
        format!("confdir={}", ca_dir.display()),
        "--set".to_string(),
        "block_global=false".to_string(),
        "--quiet".to_string(),
    ]
}

pub struct ProxyManager {
    config: ProxyConfig,
    log_path: PathBuf,
    child: Mutex<Option<Child>>,
}

impl ProxyManager {
    pub fn new(config: ProxyConfig, log_dir: &Path) -> Self {
        Self {
            config,
            log_path: log_dir.join(PROXY_LOG_FILENAME),
            child: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Spawn the proxy and make sure it survives its first moments.
    pub async fn start(&self) -> Result<u32> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_ref()
            && let Some(pid) = child.id()
        {
            return Ok(pid);
        }

        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = std::fs::File::create(&self.log_path)
            .with_context(|| format!("create {}", self.log_path.display()))?;
        let log_err = log.try_clone()?;

        let mut child = tokio::process::Command::new(&self.config.binary)
            .args(proxy_args(self.config.port, &self.config.ca_dir))
            .stdout(log)
            .stderr(log_err)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn proxy {}", self.config.binary))?;

        tokio::time::sleep(Duration::from_millis(STARTUP_GRACE_MS)).await;
        if let Some(status) = child.try_wait()? {
            anyhow::bail!(
                "proxy exited during startup ({}), see {}",
                status,
                self.log_path.display()
            );
        }

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("proxy exited during startup"))?;
        info!(
            "[proxy] {} listening on :{} (pid={})",
            self.config.binary, self.config.port, pid
        );
        *guard = Some(child);
        Ok(pid)
    }

    /// SIGTERM, then SIGKILL after the grace period.
    pub async fn stop(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        match tokio::time::timeout(Duration::from_millis(VM_STOP_GRACE_MS), child.wait()).await {
            Ok(status) => {
                info!("[proxy] stopped ({})", status?);
            }
            Err(_) => {
                warn!("[proxy] did not exit after SIGTERM, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }
}
