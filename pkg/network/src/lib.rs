pub mod command;
pub mod netns;
pub mod proxy;
pub mod subnet;

pub use command::HostCommand;
pub use netns::{NamespaceEntry, NamespaceFactory, NamespacePool, pool_from_config};
pub use proxy::ProxyManager;
pub use subnet::{Subnet, SubnetAllocator};
