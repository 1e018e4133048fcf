//! Network namespaces for microVMs.
//!
//! Every namespace holds a TAP device (`vmtap0`) with the fixed guest gateway
//! and a veth pair to the host with its own /30. Traffic from the guest is
//! masqueraded twice: inside the namespace onto the veth, then on the host
//! onto the uplink. With a proxy configured, guest HTTP(S) is DNAT'ed to the
//! proxy listening on the host side of the veth.
//!
//! Because the guest always sees 172.16.0.2/30 the same snapshot can be
//! restored into any namespace.
//!
//! Host-side names and addresses are scoped by the runner's network slot:
//! veths are `fvmh<slot>-<n>` and subnets come from `10.200.<slot>.0/24`, so
//! runners sharing a host never touch each other's links or NAT rules.

use anyhow::{Context, Result};
use async_trait::async_trait;
use pkg_constants::network::{
    GUEST_GATEWAY, GUEST_IP, GUEST_NETMASK, GUEST_PREFIX_LEN, NETNS_PREFIX, PROXIED_PORTS,
    TAP_DEVICE, VETH_CIDR, VETH_HOST_PREFIX, VETH_NS_DEVICE, VETH_RUNNER_PREFIX_LEN,
};
use pkg_pool::{PoolFactory, PoolOptions, ResourcePool};
use pkg_types::config::RunnerConfig;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

use crate::command::{HostCommand, in_netns};
use crate::subnet::{Subnet, SubnetAllocator};

pub type NamespacePool = ResourcePool<NamespaceFactory>;

/// A ready namespace, lent to one VM at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEntry {
    pub name: String,
    pub tap: String,
    pub gateway: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub guest_mask: Ipv4Addr,
    pub veth_host: String,
    pub veth_host_ip: Ipv4Addr,
    pub veth_ns_ip: Ipv4Addr,
    pub subnet: String,
}

impl NamespaceEntry {
    fn new(name: String, veth_prefix: &str, subnet: &Subnet) -> Self {
        Self {
            name,
            tap: TAP_DEVICE.to_string(),
            gateway: GUEST_GATEWAY,
            guest_ip: GUEST_IP,
            guest_mask: GUEST_NETMASK,
            veth_host: format!("{}{}", veth_prefix, subnet.index),
            veth_host_ip: subnet.host_ip,
            veth_ns_ip: subnet.peer_ip,
            subnet: subnet.cidr(),
        }
    }
}

/// Namespace name prefix owned by one runner: `fvm-<runner>-`.
pub fn namespace_prefix(runner: &str) -> String {
    format!("{}-{}-", NETNS_PREFIX, runner)
}

/// Default network slot for a runner: FNV-1a of its name, folded to a byte.
pub fn network_slot(runner: &str) -> u8 {
    let hash = runner.bytes().fold(0x811c_9dc5u32, |h, b| {
        (h ^ b as u32).wrapping_mul(0x0100_0193)
    });
    hash.to_be_bytes().iter().fold(0, |acc, b| acc ^ b)
}

/// Host veth prefix owned by `slot`: `fvmh<slot>-`.
pub fn veth_prefix(slot: u8) -> String {
    format!("{}{:02x}-", VETH_HOST_PREFIX, slot)
}

/// The /24 of the veth range owned by `slot`.
pub fn slot_cidr(slot: u8) -> Result<String> {
    let (base, _) = VETH_CIDR
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("invalid veth range {}", VETH_CIDR))?;
    let base: Ipv4Addr = base.parse().context("invalid veth range")?;
    let [a, b, _, _] = base.octets();
    Ok(format!("{}.{}.{}.0/{}", a, b, slot, VETH_RUNNER_PREFIX_LEN))
}

/// Whether `ip -o link show` output lists the link as administratively up.
pub fn link_is_up(output: &str) -> bool {
    output
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .is_some_and(|(flags, _)| flags.split(',').any(|f| f == "UP"))
}

/// Commands that build a namespace, in order.
pub fn setup_commands(entry: &NamespaceEntry, proxy_port: Option<u16>) -> Vec<Vec<String>> {
    let ns = entry.name.as_str();
    let host_prefix = format!("/{}", GUEST_PREFIX_LEN);
    let p2p = |ip: Ipv4Addr| format!("{}/30", ip);

    let mut cmds: Vec<Vec<String>> = vec![
        argv(&["ip", "netns", "add", ns]),
        in_netns(ns, &["ip", "link", "set", "lo", "up"]),
        // TAP for the guest NIC
        in_netns(ns, &["ip", "tuntap", "add", "dev", TAP_DEVICE, "mode", "tap"]),
        in_netns(
            ns,
            &[
                "ip",
                "addr",
                "add",
                &format!("{}{}", entry.gateway, host_prefix),
                "dev",
                TAP_DEVICE,
            ],
        ),
        in_netns(ns, &["ip", "link", "set", TAP_DEVICE, "up"]),
        // veth pair to the host
        argv(&[
            "ip",
            "link",
            "add",
            &entry.veth_host,
            "type",
            "veth",
            "peer",
            "name",
            VETH_NS_DEVICE,
            "netns",
            ns,
        ]),
        argv(&[
            "ip",
            "addr",
            "add",
            &p2p(entry.veth_host_ip),
            "dev",
            &entry.veth_host,
        ]),
        argv(&["ip", "link", "set", &entry.veth_host, "up"]),
        in_netns(
            ns,
            &["ip", "addr", "add", &p2p(entry.veth_ns_ip), "dev", VETH_NS_DEVICE],
        ),
        in_netns(ns, &["ip", "link", "set", VETH_NS_DEVICE, "up"]),
        in_netns(
            ns,
            &[
                "ip",
                "route",
                "add",
                "default",
                "via",
                &entry.veth_host_ip.to_string(),
            ],
        ),
        // NAT
        in_netns(ns, &["sysctl", "-q", "-w", "net.ipv4.ip_forward=1"]),
        in_netns(
            ns,
            &[
                "iptables", "-t", "nat", "-A", "POSTROUTING", "-o", VETH_NS_DEVICE, "-j",
                "MASQUERADE",
            ],
        ),
        argv(&["sysctl", "-q", "-w", "net.ipv4.ip_forward=1"]),
        host_masquerade(&entry.subnet, "-A"),
    ];

    if let Some(port) = proxy_port {
        let dest = format!("{}:{}", entry.veth_host_ip, port);
        for guest_port in PROXIED_PORTS {
            cmds.push(in_netns(
                ns,
                &[
                    "iptables",
                    "-t",
                    "nat",
                    "-A",
                    "PREROUTING",
                    "-i",
                    TAP_DEVICE,
                    "-p",
                    "tcp",
                    "--dport",
                    &guest_port.to_string(),
                    "-j",
                    "DNAT",
                    "--to-destination",
                    &dest,
                ],
            ));
        }
    }
    cmds
}

/// Commands that remove a namespace. Failures are expected when a previous
/// attempt already removed part of it.
pub fn teardown_commands(entry: &NamespaceEntry) -> Vec<Vec<String>> {
    vec![
        host_masquerade(&entry.subnet, "-D"),
        argv(&["ip", "link", "del", &entry.veth_host]),
        argv(&["ip", "netns", "del", &entry.name]),
    ]
}

fn host_masquerade(subnet: &str, action: &str) -> Vec<String> {
    argv(&[
        "iptables",
        "-t",
        "nat",
        action,
        "POSTROUTING",
        "-s",
        subnet,
        "-j",
        "MASQUERADE",
    ])
}

fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Names from `ip netns list` that start with `prefix`.
///
/// Lines look like `fvm-runner-1-0 (id: 3)` or just `fvm-runner-1-0`.
pub fn parse_netns_list(output: &str, prefix: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .filter(|name| name.starts_with(prefix))
        .map(String::from)
        .collect()
}

/// Interface names from `ip -o link show` that start with `prefix`.
///
/// Lines look like `7: fvmh3@if6: <BROADCAST,MULTICAST,UP> mtu 1500 …`.
pub fn parse_link_names(output: &str, prefix: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|l| l.split(": ").nth(1))
        .map(|name| name.split('@').next().unwrap_or(name))
        .filter(|name| name.starts_with(prefix))
        .map(String::from)
        .collect()
}

/// Host MASQUERADE rules for the veth range, as `-D` argv ready to run.
///
/// Input is `iptables -t nat -S POSTROUTING`.
pub fn stale_masquerade_rules(output: &str, range_prefix: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .filter_map(|l| l.strip_prefix("-A POSTROUTING "))
        .filter(|rule| rule.contains("MASQUERADE"))
        .filter_map(|rule| {
            let mut parts = rule.split_whitespace();
            while let Some(p) = parts.next() {
                if p == "-s" {
                    return parts.next();
                }
            }
            None
        })
        .filter(|src| src.starts_with(range_prefix))
        .map(|src| host_masquerade(src, "-D"))
        .collect()
}

pub struct NamespaceFactory {
    prefix: String,
    veth_prefix: String,
    /// `a.b.c.` of this runner's slice, for matching NAT rules.
    range_prefix: String,
    counter: AtomicU32,
    subnets: SubnetAllocator,
    proxy_port: Option<u16>,
    cmd: HostCommand,
}

impl NamespaceFactory {
    pub fn new(
        runner: &str,
        slot: u8,
        proxy_port: Option<u16>,
        cmd: HostCommand,
    ) -> Result<Self> {
        let cidr = slot_cidr(slot)?;
        let range_prefix = cidr
            .rsplit_once(".0/")
            .map(|(p, _)| format!("{}.", p))
            .ok_or_else(|| anyhow::anyhow!("invalid slot range {}", cidr))?;
        Ok(Self {
            prefix: namespace_prefix(runner),
            veth_prefix: veth_prefix(slot),
            range_prefix,
            counter: AtomicU32::new(0),
            subnets: SubnetAllocator::new(&cidr)?,
            proxy_port,
            cmd,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn veth_prefix(&self) -> &str {
        &self.veth_prefix
    }

    async fn teardown(&self, entry: &NamespaceEntry) -> Result<()> {
        let cmds = teardown_commands(entry);
        let (last, rest) = cmds
            .split_last()
            .ok_or_else(|| anyhow::anyhow!("no teardown commands"))?;
        for c in rest {
            self.cmd.run_quiet(c.as_slice()).await;
        }
        self.cmd.run(last.as_slice()).await?;
        Ok(())
    }

    async fn require_up(&self, argv: &[String], what: &str) -> Result<()> {
        let out = self
            .cmd
            .run(argv)
            .await
            .with_context(|| format!("{} is missing", what))?;
        if !link_is_up(&out) {
            anyhow::bail!("{} is down", what);
        }
        Ok(())
    }
}

/// The namespace pool for `config`.
pub fn pool_from_config(config: &RunnerConfig, cmd: HostCommand) -> Result<NamespacePool> {
    let slot = config
        .sandbox
        .network_slot
        .unwrap_or_else(|| network_slot(&config.name));
    let factory = NamespaceFactory::new(
        &config.name,
        slot,
        config.proxy.as_ref().map(|p| p.port),
        cmd,
    )?;
    Ok(ResourcePool::new(
        factory,
        PoolOptions {
            size: config.sandbox.namespace_pool_size(),
            replenish_threshold: config.sandbox.replenish_threshold,
        },
    ))
}

#[async_trait]
impl PoolFactory for NamespaceFactory {
    type Entry = NamespaceEntry;

    fn kind(&self) -> &'static str {
        "namespace"
    }

    async fn create(&self) -> Result<NamespaceEntry> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}{}", self.prefix, n);
        let subnet = self.subnets.allocate(&name).await?;
        let entry = NamespaceEntry::new(name, &self.veth_prefix, &subnet);

        for c in setup_commands(&entry, self.proxy_port) {
            if let Err(e) = self.cmd.run(c.as_slice()).await {
                warn!(ns = %entry.name, "namespace setup failed, rolling back: {:#}", e);
                let _ = self.teardown(&entry).await;
                self.subnets.release(&entry.name).await;
                return Err(e).with_context(|| format!("create namespace {}", entry.name));
            }
        }

        debug!(
            ns = %entry.name,
            "[netns] created {} (tap={}, veth={} {})",
            entry.name, entry.tap, entry.veth_host, entry.subnet
        );
        Ok(entry)
    }

    async fn destroy(&self, entry: NamespaceEntry) -> Result<()> {
        let result = self.teardown(&entry).await;
        self.subnets.release(&entry.name).await;
        result.with_context(|| format!("delete namespace {}", entry.name))
    }

    async fn purge_stale(&self) -> Result<usize> {
        let listed = self.cmd.run(&["ip", "netns", "list"]).await?;
        let stale = parse_netns_list(&listed, &self.prefix);
        for ns in &stale {
            if let Err(e) = self.cmd.run(&["ip", "netns", "del", ns]).await {
                warn!(ns = %ns, "failed to delete stale namespace: {:#}", e);
            }
        }

        // veths whose namespace end vanished without taking the pair along
        let mut removed = stale.len();
        if let Ok(links) = self.cmd.run(&["ip", "-o", "link", "show", "type", "veth"]).await {
            for link in parse_link_names(&links, &self.veth_prefix) {
                if self.cmd.run_quiet(&["ip", "link", "del", link.as_str()]).await {
                    removed += 1;
                }
            }
        }

        if let Ok(rules) = self
            .cmd
            .run(&["iptables", "-t", "nat", "-S", "POSTROUTING"])
            .await
        {
            for rule in stale_masquerade_rules(&rules, &self.range_prefix) {
                self.cmd.run_quiet(rule.as_slice()).await;
            }
        }

        self.subnets.reset().await;
        if removed > 0 {
            info!("[netns] purged {} stale namespaces/links", removed);
        }
        Ok(removed)
    }

    fn recyclable(&self) -> bool {
        true
    }

    /// A namespace is only reused with its TAP and both veth ends up. A
    /// killed job can leave it without a TAP.
    async fn check(&self, entry: &NamespaceEntry) -> Result<()> {
        let ns = entry.name.as_str();
        let links = [
            (
                in_netns(ns, &["ip", "-o", "link", "show", "dev", TAP_DEVICE]),
                format!("{} in {}", TAP_DEVICE, ns),
            ),
            (
                in_netns(ns, &["ip", "-o", "link", "show", "dev", VETH_NS_DEVICE]),
                format!("{} in {}", VETH_NS_DEVICE, ns),
            ),
            (
                argv(&["ip", "-o", "link", "show", "dev", &entry.veth_host]),
                entry.veth_host.clone(),
            ),
        ];
        for (args, what) in &links {
            self.require_up(args, what).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> NamespaceEntry {
        let subnet = Subnet {
            index: 3,
            network: Ipv4Addr::new(10, 200, 0, 12),
            host_ip: Ipv4Addr::new(10, 200, 0, 13),
            peer_ip: Ipv4Addr::new(10, 200, 0, 14),
            prefix_len: 30,
        };
        NamespaceEntry::new("fvm-runner-1-0".to_string(), &veth_prefix(1), &subnet)
    }

    #[test]
    fn entry_fields() {
        let e = entry();
        assert_eq!(e.tap, "vmtap0");
        assert_eq!(e.gateway, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(e.guest_ip, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(e.guest_mask, Ipv4Addr::new(255, 255, 255, 252));
        assert_eq!(e.veth_host, "fvmh01-3");
        assert_eq!(e.subnet, "10.200.0.12/30");
    }

    #[test]
    fn setup_without_proxy() {
        let cmds = setup_commands(&entry(), None);
        assert_eq!(cmds[0], vec!["ip", "netns", "add", "fvm-runner-1-0"]);
        assert!(cmds.iter().any(|c| c.join(" ")
            == "ip netns exec fvm-runner-1-0 ip addr add 172.16.0.1/30 dev vmtap0"));
        assert!(cmds.iter().any(|c| c.join(" ")
            == "iptables -t nat -A POSTROUTING -s 10.200.0.12/30 -j MASQUERADE"));
        assert!(!cmds.iter().any(|c| c.contains(&"DNAT".to_string())));
    }

    #[test]
    fn setup_with_proxy_adds_dnat() {
        let cmds = setup_commands(&entry(), Some(8080));
        let dnat: Vec<String> = cmds
            .iter()
            .filter(|c| c.contains(&"DNAT".to_string()))
            .map(|c| c.join(" "))
            .collect();
        assert_eq!(dnat.len(), 2);
        assert!(dnat[0].contains("--dport 80 "));
        assert!(dnat[1].contains("--dport 443 "));
        assert!(dnat[0].ends_with("--to-destination 10.200.0.13:8080"));
    }

    #[test]
    fn teardown_ends_with_netns_delete() {
        let cmds = teardown_commands(&entry());
        assert_eq!(cmds.last().unwrap().join(" "), "ip netns del fvm-runner-1-0");
        assert_eq!(
            cmds[0].join(" "),
            "iptables -t nat -D POSTROUTING -s 10.200.0.12/30 -j MASQUERADE"
        );
    }

    #[test]
    fn parse_netns_output() {
        let out = "fvm-runner-1-1 (id: 4)\nfvm-runner-1-0 (id: 3)\nfvm-runner-10-0\nother\n";
        assert_eq!(
            parse_netns_list(out, &namespace_prefix("runner-1")),
            vec!["fvm-runner-1-1", "fvm-runner-1-0"]
        );
    }

    #[test]
    fn parse_links_output() {
        let out = "1: lo: <LOOPBACK,UP> mtu 65536\n\
                   7: fvmh3@if6: <BROADCAST,MULTICAST,UP> mtu 1500\n\
                   9: veth9@if8: <BROADCAST> mtu 1500\n";
        assert_eq!(parse_link_names(out, "fvmh"), vec!["fvmh3"]);
    }

    #[test]
    fn parse_masquerade_rules() {
        let out = "-P POSTROUTING ACCEPT\n\
                   -A POSTROUTING -s 10.200.0.4/30 -j MASQUERADE\n\
                   -A POSTROUTING -s 192.168.1.0/24 -j MASQUERADE\n\
                   -A POSTROUTING -o eth0 -j MASQUERADE\n";
        let rules = stale_masquerade_rules(out, "10.200.");
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].join(" "),
            "iptables -t nat -D POSTROUTING -s 10.200.0.4/30 -j MASQUERADE"
        );
    }

    #[test]
    fn slots_scope_names_and_ranges() {
        assert_eq!(veth_prefix(0x3a), "fvmh3a-");
        assert_eq!(slot_cidr(7).unwrap(), "10.200.7.0/24");
        assert_eq!(network_slot("runner-1"), network_slot("runner-1"));
        // Longest name fits the 15-byte interface limit.
        assert!(format!("{}{}", veth_prefix(0xff), 63).len() <= 15);
    }

    #[test]
    fn link_state_from_ip_output() {
        assert!(link_is_up(
            "5: vmtap0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 state DOWN"
        ));
        assert!(!link_is_up("7: fvmh01-0@if6: <BROADCAST,MULTICAST> mtu 1500"));
        assert!(!link_is_up(""));
    }

    /// Stands in for `ip`/`iptables`: logs every call and answers listing
    /// commands from files next to the script.
    const FAKE_HOST: &str = r#"dir=$(dirname "$0")
echo "$*" >> "$dir/log"
case "$*" in
  "ip netns list") cat "$dir/netns" 2>/dev/null ;;
  "ip -o link show type veth") cat "$dir/links" 2>/dev/null ;;
  "iptables -t nat -S POSTROUTING") cat "$dir/rules" 2>/dev/null ;;
  *"link show dev vmtap0")
    [ -e "$dir/no-tap" ] && exit 1
    echo "5: vmtap0: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500" ;;
  *"link show dev "*) echo "7: link: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500" ;;
esac
exit 0
"#;

    fn fake_host(dir: &std::path::Path) -> HostCommand {
        let script = dir.join("fake-host.sh");
        std::fs::write(&script, FAKE_HOST).unwrap();
        let script: &'static str = Box::leak(script.display().to_string().into_boxed_str());
        let prefix: &'static [&'static str] = Box::leak(vec!["/bin/sh", script].into_boxed_slice());
        HostCommand::with_prefix(prefix)
    }

    fn log(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn pool(dir: &std::path::Path, runner: &str, slot: u8) -> NamespacePool {
        let factory = NamespaceFactory::new(runner, slot, None, fake_host(dir)).unwrap();
        ResourcePool::new(
            factory,
            PoolOptions {
                size: 1,
                replenish_threshold: 0,
            },
        )
    }

    #[tokio::test]
    async fn healthy_namespace_is_recycled() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path(), "runner-1", 1);
        pool.init().await.unwrap();

        let a = pool.acquire().await.unwrap();
        pool.release(a.clone()).await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(a, b);
        assert!(
            log(tmp.path())
                .iter()
                .any(|l| l.ends_with(&format!("{} ip -o link show dev vmtap0", a.name)))
        );
        assert!(!log(tmp.path()).iter().any(|l| l == &format!("ip netns del {}", a.name)));
    }

    #[tokio::test]
    async fn namespace_without_tap_is_destroyed_on_release() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool(tmp.path(), "runner-1", 1);
        pool.init().await.unwrap();

        let a = pool.acquire().await.unwrap();
        std::fs::write(tmp.path().join("no-tap"), b"").unwrap();
        pool.release(a.clone()).await.unwrap();
        assert!(pool.is_empty().await);
        assert!(log(tmp.path()).contains(&format!("ip netns del {}", a.name)));
        assert!(log(tmp.path()).contains(&format!("ip link del {}", a.veth_host)));

        std::fs::remove_file(tmp.path().join("no-tap")).unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.name, b.name);
    }

    #[tokio::test]
    async fn purge_leaves_other_runners_alone() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("netns"),
            "fvm-runner-a-0 (id: 1)\nfvm-runner-b-0 (id: 2)\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("links"),
            "7: fvmh01-0@if6: <BROADCAST,MULTICAST,UP> mtu 1500\n\
             9: fvmh02-0@if8: <BROADCAST,MULTICAST,UP> mtu 1500\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("rules"),
            "-P POSTROUTING ACCEPT\n\
             -A POSTROUTING -s 10.200.1.0/30 -j MASQUERADE\n\
             -A POSTROUTING -s 10.200.2.0/30 -j MASQUERADE\n",
        )
        .unwrap();

        let factory =
            NamespaceFactory::new("runner-a", 1, None, fake_host(tmp.path())).unwrap();
        assert_eq!(factory.purge_stale().await.unwrap(), 2);

        let log = log(tmp.path());
        assert!(log.contains(&"ip netns del fvm-runner-a-0".to_string()));
        assert!(log.contains(&"ip link del fvmh01-0".to_string()));
        assert!(log.contains(
            &"iptables -t nat -D POSTROUTING -s 10.200.1.0/30 -j MASQUERADE".to_string()
        ));
        assert!(!log.iter().any(|l| l.contains("runner-b") && l.contains("del")));
        assert!(!log.iter().any(|l| l.contains("fvmh02")));
        assert!(!log.iter().any(|l| l.contains("10.200.2.")));
    }

    #[tokio::test]
    async fn pool_from_config_uses_configured_slot() {
        let mut config = RunnerConfig::parse(
            "name: runner-1\ngroup: a/b\nserver: {url: 'http://localhost', token: t}\n\
             firecracker: {binary: /fc, kernel: /k, rootfs: /r}\n",
        )
        .unwrap();
        let derived = pool_from_config(&config, HostCommand::with_sudo(false)).unwrap();
        assert_eq!(
            derived.factory().veth_prefix(),
            veth_prefix(network_slot("runner-1"))
        );

        config.sandbox.network_slot = Some(9);
        let pool = pool_from_config(&config, HostCommand::with_sudo(false)).unwrap();
        assert_eq!(pool.factory().veth_prefix(), "fvmh09-");
        assert_eq!(pool.options().size, 2);
    }
}
