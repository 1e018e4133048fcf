pub mod cleanup;
pub mod config;
pub mod discovery;
pub mod firecracker;
pub mod process;

pub use cleanup::{Cleanup, CleanupReport, StepOutcome};
pub use config::{VmConfig, VmConfigBuilder};
pub use firecracker::{
    ApiError, FirecrackerClient, FirecrackerError, MemoryBackend, NetworkOverride, SnapshotType,
};
pub use process::{VmPaths, VmProcess};
