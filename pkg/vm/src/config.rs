//! Firecracker VM configuration.
//!
//! The same struct serializes to the `--config-file` JSON shape and feeds
//! the individual API calls in [`crate::firecracker::FirecrackerClient::apply_config`].

use pkg_constants::network::{GUEST_GATEWAY, GUEST_IP, GUEST_NETMASK, TAP_DEVICE};
use pkg_constants::runtime::{DEFAULT_MEMORY_MB, DEFAULT_VCPU};
use pkg_constants::vm::{GUEST_CID, GUEST_IFACE_ID};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const ROOTFS_DRIVE_ID: &str = "rootfs";
pub const OVERLAY_DRIVE_ID: &str = "overlay";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
    pub vsock: Vsock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
    pub smt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vsock {
    pub guest_cid: u32,
    pub uds_path: PathBuf,
}

impl VmConfig {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Kernel command line with a static guest address on eth0.
pub fn boot_args(guest_ip: Ipv4Addr, gateway: Ipv4Addr, netmask: Ipv4Addr) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off init=/sbin/init ip={}::{}:{}::{}:off",
        guest_ip, gateway, netmask, GUEST_IFACE_ID
    )
}

/// Locally administered MAC embedding the guest IP (`06:00:<ip octets>`).
pub fn guest_mac(guest_ip: Ipv4Addr) -> String {
    let [a, b, c, d] = guest_ip.octets();
    format!("06:00:{:02X}:{:02X}:{:02X}:{:02X}", a, b, c, d)
}

/// Builds a [`VmConfig`] from the handful of inputs that vary per VM.
#[derive(Debug, Clone)]
pub struct VmConfigBuilder {
    kernel: PathBuf,
    rootfs: PathBuf,
    overlay: PathBuf,
    vsock_uds: PathBuf,
    vcpus: u32,
    memory_mib: u64,
    tap: String,
    guest_ip: Ipv4Addr,
    gateway: Ipv4Addr,
    netmask: Ipv4Addr,
}

impl VmConfigBuilder {
    pub fn new(
        kernel: impl AsRef<Path>,
        rootfs: impl AsRef<Path>,
        overlay: impl AsRef<Path>,
        vsock_uds: impl AsRef<Path>,
    ) -> Self {
        Self {
            kernel: kernel.as_ref().to_path_buf(),
            rootfs: rootfs.as_ref().to_path_buf(),
            overlay: overlay.as_ref().to_path_buf(),
            vsock_uds: vsock_uds.as_ref().to_path_buf(),
            vcpus: DEFAULT_VCPU,
            memory_mib: DEFAULT_MEMORY_MB,
            tap: TAP_DEVICE.to_string(),
            guest_ip: GUEST_IP,
            gateway: GUEST_GATEWAY,
            netmask: GUEST_NETMASK,
        }
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn memory_mib(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    /// TAP device and addressing of the namespace the VM runs in.
    pub fn network(
        mut self,
        tap: impl Into<String>,
        guest_ip: Ipv4Addr,
        gateway: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> Self {
        self.tap = tap.into();
        self.guest_ip = guest_ip;
        self.gateway = gateway;
        self.netmask = netmask;
        self
    }

    pub fn build(&self) -> VmConfig {
        VmConfig {
            boot_source: BootSource {
                kernel_image_path: self.kernel.clone(),
                boot_args: boot_args(self.guest_ip, self.gateway, self.netmask),
            },
            drives: vec![
                Drive {
                    drive_id: ROOTFS_DRIVE_ID.to_string(),
                    path_on_host: self.rootfs.clone(),
                    is_root_device: true,
                    is_read_only: true,
                },
                Drive {
                    drive_id: OVERLAY_DRIVE_ID.to_string(),
                    path_on_host: self.overlay.clone(),
                    is_root_device: false,
                    is_read_only: false,
                },
            ],
            machine_config: MachineConfig {
                vcpu_count: self.vcpus,
                mem_size_mib: self.memory_mib,
                smt: false,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: GUEST_IFACE_ID.to_string(),
                host_dev_name: self.tap.clone(),
                guest_mac: guest_mac(self.guest_ip),
            }],
            vsock: Vsock {
                guest_cid: GUEST_CID,
                uds_path: self.vsock_uds.clone(),
            },
        }
    }
}
