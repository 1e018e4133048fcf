use anyhow::{Context, Result, bail};
use pkg_constants::{network, paths, runtime, state};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::validate::{validate_group, validate_name, validate_url};

/// Runner configuration file (YAML).
///
/// Example `runner.yaml`:
/// ```yaml
/// name: runner-1
/// group: acme/default
/// server:
///   url: https://api.example.com
///   token: my-secret-token
/// sandbox:
///   max_concurrent: 2
/// firecracker:
///   binary: /usr/local/bin/firecracker
///   kernel: /var/lib/fleetvm/vmlinux
///   rootfs: /var/lib/fleetvm/rootfs.ext4
/// proxy:
///   port: 8080
///   ca_dir: /var/lib/fleetvm/proxy
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    pub group: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    pub firecracker: FirecrackerConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_concurrent: usize,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub poll_interval_ms: u64,
    pub pending_queue_capacity: usize,
    /// Warm overlays kept ready. `None` = `max_concurrent + 1`.
    pub overlay_pool_size: Option<usize>,
    /// Warm namespaces kept ready. `None` = `max_concurrent + 1`.
    pub namespace_pool_size: Option<usize>,
    pub replenish_threshold: usize,
    /// Slice of the veth range this runner owns. `None` = derived from the
    /// runner name. Set it when two runners on one host collide.
    pub network_slot: Option<u8>,
    pub overlay_size_mb: u64,
    pub boot_timeout_ms: u64,
    pub exec_timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_concurrent: runtime::DEFAULT_MAX_CONCURRENT,
            vcpu: runtime::DEFAULT_VCPU,
            memory_mb: runtime::DEFAULT_MEMORY_MB,
            poll_interval_ms: state::DEFAULT_POLL_INTERVAL_MS,
            pending_queue_capacity: state::DEFAULT_PENDING_QUEUE_CAPACITY,
            overlay_pool_size: None,
            namespace_pool_size: None,
            replenish_threshold: runtime::DEFAULT_REPLENISH_THRESHOLD,
            network_slot: None,
            overlay_size_mb: runtime::DEFAULT_OVERLAY_SIZE_MB,
            boot_timeout_ms: runtime::DEFAULT_BOOT_TIMEOUT_MS,
            exec_timeout_ms: runtime::DEFAULT_EXEC_TIMEOUT_MS,
        }
    }
}

impl SandboxConfig {
    pub fn overlay_pool_size(&self) -> usize {
        self.overlay_pool_size.unwrap_or(self.max_concurrent + 1)
    }

    pub fn namespace_pool_size(&self) -> usize {
        self.namespace_pool_size.unwrap_or(self.max_concurrent + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    pub binary: PathBuf,
    pub kernel: PathBuf,
    pub rootfs: PathBuf,
    /// Fast boot from a snapshot instead of a cold kernel boot.
    #[serde(default)]
    pub snapshot: Option<SnapshotConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// VM state file produced by `PUT /snapshot/create`.
    pub snapshot: PathBuf,
    /// Guest memory file.
    pub memory: PathBuf,
    /// Overlay captured alongside the snapshot; per-job overlays are copies.
    pub overlay: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub port: u16,
    pub ca_dir: PathBuf,
    #[serde(default = "default_proxy_binary")]
    pub binary: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(paths::DEFAULT_DATA_DIR)
}

fn default_proxy_binary() -> String {
    runtime::DEFAULT_PROXY_BINARY.to_string()
}

impl RunnerConfig {
    /// Load and validate a runner config. Any problem is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without touching the filesystem.
    pub fn parse(content: &str) -> Result<Self> {
        let config: RunnerConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Schema checks plus existence of every referenced path.
    pub fn validate(&self) -> Result<()> {
        self.validate_schema()?;

        let mut required: Vec<(&str, &Path)> = vec![
            ("firecracker.binary", &self.firecracker.binary),
            ("firecracker.kernel", &self.firecracker.kernel),
            ("firecracker.rootfs", &self.firecracker.rootfs),
        ];
        if let Some(snap) = &self.firecracker.snapshot {
            required.push(("firecracker.snapshot.snapshot", &snap.snapshot));
            required.push(("firecracker.snapshot.memory", &snap.memory));
            required.push(("firecracker.snapshot.overlay", &snap.overlay));
        }
        if let Some(proxy) = &self.proxy {
            required.push(("proxy.ca_dir", &proxy.ca_dir));
        }
        for (key, path) in required {
            if !path.exists() {
                bail!("{} does not exist: {}", key, path.display());
            }
        }
        Ok(())
    }

    /// Checks that need no filesystem access.
    pub fn validate_schema(&self) -> Result<()> {
        validate_name(&self.name).context("invalid runner name")?;
        validate_group(&self.group)?;
        validate_url(&self.server.url).context("invalid server.url")?;
        if self.server.token.trim().is_empty() {
            bail!("server.token must not be empty");
        }

        let s = &self.sandbox;
        for (key, value) in [
            ("sandbox.max_concurrent", s.max_concurrent as u64),
            ("sandbox.vcpu", s.vcpu as u64),
            ("sandbox.memory_mb", s.memory_mb),
            ("sandbox.poll_interval_ms", s.poll_interval_ms),
            ("sandbox.overlay_size_mb", s.overlay_size_mb),
            ("sandbox.boot_timeout_ms", s.boot_timeout_ms),
            ("sandbox.exec_timeout_ms", s.exec_timeout_ms),
        ] {
            if value == 0 {
                bail!("{} must be greater than 0", key);
            }
        }
        if s.memory_mb < 128 {
            bail!("sandbox.memory_mb must be at least 128 (got {})", s.memory_mb);
        }
        let namespaces = s.max_concurrent + s.namespace_pool_size();
        if namespaces > network::VETH_BLOCKS_PER_RUNNER {
            bail!(
                "sandbox.max_concurrent plus sandbox.namespace_pool_size must not exceed {} (got {})",
                network::VETH_BLOCKS_PER_RUNNER,
                namespaces
            );
        }

        if let Some(proxy) = &self.proxy
            && proxy.port == 0
        {
            bail!("proxy.port must be greater than 0");
        }
        Ok(())
    }

    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join(paths::STATUS_FILENAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(paths::LOCK_FILENAME)
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.data_dir.join(paths::OVERLAY_DIR)
    }

    pub fn vm_dir(&self) -> PathBuf {
        self.data_dir.join(paths::VM_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: runner-1
group: acme/default
server:
  url: https://api.example.com
  token: secret
firecracker:
  binary: /usr/local/bin/firecracker
  kernel: /var/lib/fleetvm/vmlinux
  rootfs: /var/lib/fleetvm/rootfs.ext4
"#;

    #[test]
    fn parse_applies_defaults() {
        let cfg = RunnerConfig::parse(MINIMAL).unwrap();
        assert_eq!(cfg.sandbox.max_concurrent, 1);
        assert_eq!(cfg.sandbox.vcpu, 2);
        assert_eq!(cfg.sandbox.memory_mb, 2048);
        assert_eq!(cfg.sandbox.poll_interval_ms, 5000);
        assert_eq!(cfg.sandbox.pending_queue_capacity, 100);
        assert_eq!(cfg.sandbox.overlay_pool_size(), 2);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/fleetvm"));
        assert!(cfg.proxy.is_none());
        assert!(cfg.firecracker.snapshot.is_none());
        cfg.validate_schema().unwrap();
    }

    #[test]
    fn schema_rejects_bad_group_and_zero_values() {
        let mut cfg = RunnerConfig::parse(MINIMAL).unwrap();
        cfg.group = "AcmeDefault".to_string();
        assert!(cfg.validate_schema().is_err());

        let mut cfg = RunnerConfig::parse(MINIMAL).unwrap();
        cfg.sandbox.max_concurrent = 0;
        let err = cfg.validate_schema().unwrap_err().to_string();
        assert!(err.contains("max_concurrent"), "{}", err);

        let mut cfg = RunnerConfig::parse(MINIMAL).unwrap();
        cfg.server.token = "  ".to_string();
        assert!(cfg.validate_schema().is_err());

        let mut cfg = RunnerConfig::parse(MINIMAL).unwrap();
        cfg.sandbox.max_concurrent = 40;
        let err = cfg.validate_schema().unwrap_err().to_string();
        assert!(err.contains("must not exceed 64"), "{}", err);
        cfg.sandbox.max_concurrent = 31;
        cfg.validate_schema().unwrap();
    }

    #[test]
    fn missing_required_field_fails() {
        let yaml = MINIMAL.replace("  token: secret\n", "");
        assert!(RunnerConfig::parse(&yaml).is_err());
    }

    #[test]
    fn validate_checks_paths_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = tmp.path().join("firecracker");
        let kernel = tmp.path().join("vmlinux");
        let rootfs = tmp.path().join("rootfs.ext4");
        for p in [&bin, &kernel, &rootfs] {
            std::fs::write(p, b"").unwrap();
        }

        let yaml = format!(
            "name: r\ngroup: a/b\nserver: {{url: 'http://localhost', token: t}}\n\
             firecracker: {{binary: '{}', kernel: '{}', rootfs: '{}'}}\n",
            bin.display(),
            kernel.display(),
            rootfs.display()
        );
        let path = tmp.path().join("runner.yaml");
        std::fs::write(&path, &yaml).unwrap();
        let cfg = RunnerConfig::load(&path).unwrap();
        assert_eq!(cfg.name, "r");

        std::fs::remove_file(&kernel).unwrap();
        let err = RunnerConfig::load(&path).unwrap_err().to_string();
        assert!(err.contains("firecracker.kernel"), "{}", err);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(RunnerConfig::load(Path::new("/nonexistent/runner.yaml")).is_err());
    }
}
