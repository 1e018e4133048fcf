//! Filesystem path constants.

/// Default config file path for the runner.
pub const DEFAULT_CONFIG: &str = "/etc/fleetvm/runner.yaml";

/// Default data directory (pools, VM work dirs, status, lock).
pub const DEFAULT_DATA_DIR: &str = "/var/lib/fleetvm";

/// Status file name inside the data directory.
pub const STATUS_FILENAME: &str = "status.json";

/// Single-instance lock file name inside the data directory.
pub const LOCK_FILENAME: &str = "runner.pid";

/// Overlay pool directory inside the data directory.
pub const OVERLAY_DIR: &str = "overlays";

/// Per-VM work directories live under this directory.
pub const VM_DIR: &str = "vms";

/// Firecracker API socket inside a VM work directory.
pub const API_SOCKET_FILENAME: &str = "api.sock";

/// Hybrid vsock socket inside a VM work directory.
pub const VSOCK_SOCKET_FILENAME: &str = "vsock.sock";

/// Overlay symlink inside a VM work directory. Drive paths recorded in
/// snapshots are relative, so they resolve against the work directory.
pub const OVERLAY_LINK_FILENAME: &str = "overlay.ext4";

/// Firecracker stdout/stderr log inside a VM work directory.
pub const VM_LOG_FILENAME: &str = "firecracker.log";

/// Files written by `fleetvm snapshot` into its output directory.
pub const SNAPSHOT_STATE_FILENAME: &str = "snapshot.bin";
pub const SNAPSHOT_MEMORY_FILENAME: &str = "memory.bin";
pub const SNAPSHOT_OVERLAY_FILENAME: &str = "overlay.ext4";
