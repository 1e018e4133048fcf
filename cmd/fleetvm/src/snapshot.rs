use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use pkg_runner::Teardown;
use pkg_types::config::{RunnerConfig, SnapshotConfig};
use serde::Serialize;
use tracing::{info, warn};

use crate::start::HostResources;

#[derive(clap::Args)]
pub struct SnapshotArgs {
    /// Directory for the snapshot, memory and overlay files
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Serialize)]
struct SnapshotBlock<'a> {
    firecracker: FirecrackerBlock<'a>,
}

#[derive(Serialize)]
struct FirecrackerBlock<'a> {
    snapshot: &'a SnapshotConfig,
}

/// The config fragment that enables snapshot boots.
fn config_block(snapshot: &SnapshotConfig) -> Result<String> {
    Ok(serde_yaml::to_string(&SnapshotBlock {
        firecracker: FirecrackerBlock { snapshot },
    })?)
}

pub async fn run(config_path: &Path, args: SnapshotArgs) -> Result<ExitCode> {
    let mut config = RunnerConfig::load(config_path)?;
    // Capture from a cold boot; a configured snapshot would seed the overlays.
    config.firecracker.snapshot = None;

    let resources = HostResources::acquire(&config).await?;
    let executor = resources.executor(&config);
    info!("[snapshot] capturing into {}", args.output.display());
    let result = executor.create_snapshot(&args.output).await;
    if let Err(e) = resources.teardown().await {
        warn!("[snapshot] {:#}", e);
    }

    let snapshot = result?;
    println!("Snapshot written. Add to {}:\n", config_path.display());
    print!("{}", config_block(&snapshot)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_parses_back_as_config_section() {
        let snap = SnapshotConfig {
            snapshot: PathBuf::from("/var/lib/fleetvm/snap/snapshot.bin"),
            memory: PathBuf::from("/var/lib/fleetvm/snap/memory.bin"),
            overlay: PathBuf::from("/var/lib/fleetvm/snap/overlay.ext4"),
        };
        let yaml = config_block(&snap).unwrap();
        assert!(yaml.starts_with("firecracker:\n  snapshot:\n"), "{}", yaml);

        let v: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        let parsed: SnapshotConfig =
            serde_yaml::from_value(v["firecracker"]["snapshot"].clone()).unwrap();
        assert_eq!(parsed.memory, snap.memory);
        assert_eq!(parsed.overlay, snap.overlay);
    }
}
