pub mod overlay;
pub mod pool;

pub use overlay::{OverlayEntry, OverlayFactory, OverlayPool, copy_sparse};
pub use pool::{PoolFactory, PoolOptions, ResourcePool};
