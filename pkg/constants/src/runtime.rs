//! Sandbox runtime defaults.

/// Default number of jobs executed concurrently.
pub const DEFAULT_MAX_CONCURRENT: usize = 1;

/// Default vCPU count for micro-VMs.
pub const DEFAULT_VCPU: u32 = 2;

/// Default memory size in MiB for micro-VMs.
pub const DEFAULT_MEMORY_MB: u64 = 2048;

/// Default size of each writable overlay in MiB.
pub const DEFAULT_OVERLAY_SIZE_MB: u64 = 2048;

/// Replenish a pool once it drops below this many warm entries.
pub const DEFAULT_REPLENISH_THRESHOLD: usize = 1;

/// How long a freshly spawned Firecracker gets to expose its API socket.
pub const API_READY_TIMEOUT_MS: u64 = 5_000;

/// Poll interval while waiting for the API socket.
pub const API_READY_POLL_MS: u64 = 10;

/// Default time allowed for the guest agent to connect after boot.
pub const DEFAULT_BOOT_TIMEOUT_MS: u64 = 30_000;

/// Default payload timeout (one hour).
pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 3_600_000;

/// Timeout for setup commands (script staging, mkdir, small writes).
pub const SETUP_EXEC_TIMEOUT_MS: u64 = 60_000;

/// Timeout for a single storage archive download + extract.
pub const STORAGE_DOWNLOAD_TIMEOUT_MS: u64 = 600_000;

/// Grace period between SIGTERM and SIGKILL when stopping a VM.
pub const VM_STOP_GRACE_MS: u64 = 3_000;

/// Default proxy binary (transparent HTTPS proxy).
pub const DEFAULT_PROXY_BINARY: &str = "mitmdump";
