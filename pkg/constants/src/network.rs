//! Network namespace / NAT constants.

use std::net::Ipv4Addr;

/// Prefix for every network namespace owned by a runner.
/// Full name = `{NETNS_PREFIX}-{runner}-{index}`.
pub const NETNS_PREFIX: &str = "fvm";

/// TAP device created inside each namespace (the VM's eth0 backs onto it).
pub const TAP_DEVICE: &str = "vmtap0";

/// Gateway address assigned to the TAP device inside every namespace.
///
/// Namespaces are isolated, so every VM sees the same gateway / guest pair.
/// Snapshots rely on this: the guest network config is frozen in memory.
pub const GUEST_GATEWAY: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 1);

/// Address configured on the guest's eth0.
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 2);

/// Netmask of the TAP link (/30).
pub const GUEST_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 252);

/// Prefix length of the TAP link.
pub const GUEST_PREFIX_LEN: u8 = 30;

/// CIDR block veth pairs between the host and each namespace are carved from.
/// Each runner owns one /24 of it, picked by its network slot.
pub const VETH_CIDR: &str = "10.200.0.0/16";

/// Prefix length of the slice one runner owns.
pub const VETH_RUNNER_PREFIX_LEN: u8 = 24;

/// /30 blocks in one runner's slice.
pub const VETH_BLOCKS_PER_RUNNER: usize = 64;

/// Host-side veth name prefix. Full name = `{VETH_HOST_PREFIX}{slot:02x}-{index}`.
/// Linux caps interface names at 15 bytes.
pub const VETH_HOST_PREFIX: &str = "fvmh";

/// Namespace-side veth name.
pub const VETH_NS_DEVICE: &str = "veth0";

/// Guest TCP ports redirected to the host proxy when a proxy is configured.
pub const PROXIED_PORTS: &[u16] = &[80, 443];
