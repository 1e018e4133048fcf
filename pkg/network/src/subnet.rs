use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Prefix length of every allocated point-to-point block.
const BLOCK_PREFIX_LEN: u8 = 30;
const BLOCK_SIZE: u32 = 4;

/// One /30 carved out of the veth range: network, host side, namespace side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub index: u32,
    pub network: Ipv4Addr,
    pub host_ip: Ipv4Addr,
    pub peer_ip: Ipv4Addr,
    pub prefix_len: u8,
}

impl Subnet {
    /// `a.b.c.d/30`
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.network, self.prefix_len)
    }
}

#[derive(Default)]
struct Allocations {
    by_key: HashMap<String, Subnet>,
    /// Released block indexes, reused lowest first.
    free: BTreeSet<u32>,
    next_index: u32,
}

/// Hands out /30 point-to-point subnets for veth pairs.
///
/// Allocates from a configurable CIDR block (e.g. 10.200.0.0/16) and keeps a
/// mapping of key → subnet so the same namespace always gets the same block.
#[derive(Clone)]
pub struct SubnetAllocator {
    /// Base IP as a u32 (e.g. 10.200.0.0 → 0x0AC80000)
    base_ip: u32,
    /// Number of /30 blocks in the range
    max_blocks: u32,
    allocations: Arc<RwLock<Allocations>>,
}

impl SubnetAllocator {
    /// Create an allocator over the given CIDR block (e.g. "10.200.0.0/16").
    pub fn new(cidr: &str) -> anyhow::Result<Self> {
        let (ip_str, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("Invalid CIDR format: {}", cidr))?;

        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid prefix length: {}", prefix))?;
        if prefix_len > BLOCK_PREFIX_LEN {
            anyhow::bail!("CIDR {} is smaller than a /{}", cidr, BLOCK_PREFIX_LEN);
        }

        let ip: Ipv4Addr = ip_str
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid IP: {}", ip_str))?;
        let base_ip = u32::from(ip);

        let host_bits = 32 - prefix_len as u32;
        let max_blocks = 1u32.checked_shl(host_bits).unwrap_or(0) / BLOCK_SIZE;

        debug!(
            "SubnetAllocator initialized: CIDR={}, blocks={}",
            cidr, max_blocks
        );

        Ok(Self {
            base_ip,
            max_blocks,
            allocations: Arc::new(RwLock::new(Allocations::default())),
        })
    }

    fn block(&self, index: u32) -> Subnet {
        let network = self.base_ip + index * BLOCK_SIZE;
        Subnet {
            index,
            network: Ipv4Addr::from(network),
            host_ip: Ipv4Addr::from(network + 1),
            peer_ip: Ipv4Addr::from(network + 2),
            prefix_len: BLOCK_PREFIX_LEN,
        }
    }

    /// Allocate a subnet for `key`. Returns the existing one if already allocated.
    pub async fn allocate(&self, key: &str) -> anyhow::Result<Subnet> {
        {
            let map = self.allocations.read().await;
            if let Some(subnet) = map.by_key.get(key) {
                return Ok(*subnet);
            }
        }

        let mut map = self.allocations.write().await;
        if let Some(subnet) = map.by_key.get(key) {
            return Ok(*subnet);
        }

        let index = match map.free.pop_first() {
            Some(index) => index,
            None => {
                if map.next_index >= self.max_blocks {
                    return Err(anyhow::anyhow!(
                        "SubnetAllocator exhausted: no more subnets available"
                    ));
                }
                let index = map.next_index;
                map.next_index += 1;
                index
            }
        };

        let subnet = self.block(index);
        map.by_key.insert(key.to_string(), subnet);
        debug!("SubnetAllocator: allocated {} → {}", key, subnet.cidr());
        Ok(subnet)
    }

    /// Release a key's subnet so the block can be reused.
    pub async fn release(&self, key: &str) {
        let mut map = self.allocations.write().await;
        if let Some(subnet) = map.by_key.remove(key) {
            map.free.insert(subnet.index);
            debug!("SubnetAllocator: released {} (was {})", key, subnet.cidr());
        }
    }

    pub async fn get(&self, key: &str) -> Option<Subnet> {
        let map = self.allocations.read().await;
        map.by_key.get(key).copied()
    }

    /// Forget every allocation (used after purging all namespaces).
    pub async fn reset(&self) {
        let mut map = self.allocations.write().await;
        *map = Allocations::default();
    }
}
