//! Virtual machine / guest constants.

/// vsock port the guest agent listens on (host-initiated dial).
pub const GUEST_AGENT_PORT: u32 = 1024;

/// vsock port the host listens on for guest-initiated connections.
/// Firecracker forwards guest connects to `{uds_path}_{port}` on the host.
pub const HOST_LISTEN_PORT: u32 = 1025;

/// Context id assigned to every guest (host is 2).
pub const GUEST_CID: u32 = 3;

/// Interface id of the single network interface.
pub const GUEST_IFACE_ID: &str = "eth0";

/// Guest protocol version spoken by this host.
pub const GUEST_PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single guest protocol frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Directory inside the guest holding the execution scripts.
pub const GUEST_SCRIPT_DIR: &str = "/usr/local/lib/fleetvm";

/// Home directory of the unprivileged guest user.
pub const GUEST_HOME: &str = "/home/user";

/// Session history directory, relative to the guest home.
pub const GUEST_SESSION_DIR: &str = ".agent/sessions";
