//! Writable disk overlays.
//!
//! Each overlay is a fixed-size sparse file formatted as ext4, or a sparse
//! copy of the overlay captured with a snapshot. Overlays are never reused:
//! the executor hands them back through `release`, which deletes the file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use pkg_constants::paths::OVERLAY_DIR;
use pkg_types::config::RunnerConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::pool::{PoolFactory, PoolOptions, ResourcePool};

const OVERLAY_PREFIX: &str = "overlay-";
const OVERLAY_SUFFIX: &str = ".ext4";

pub type OverlayPool = ResourcePool<OverlayFactory>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    pub path: PathBuf,
}

pub struct OverlayFactory {
    dir: PathBuf,
    size_bytes: u64,
    /// Overlay to copy instead of formatting a fresh file.
    seed: Option<PathBuf>,
    /// `mkfs.ext4` by default; `None` leaves the file unformatted.
    formatter: Option<String>,
}

impl OverlayFactory {
    pub fn new(dir: impl Into<PathBuf>, size_mb: u64) -> Self {
        Self {
            dir: dir.into(),
            size_bytes: size_mb * 1024 * 1024,
            seed: None,
            formatter: Some("mkfs.ext4".to_string()),
        }
    }

    pub fn with_seed(mut self, seed: Option<PathBuf>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_formatter(mut self, formatter: Option<String>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_overlay_file(name: &str) -> bool {
        name.starts_with(OVERLAY_PREFIX) && name.ends_with(OVERLAY_SUFFIX)
    }

    async fn format(&self, path: &Path) -> Result<()> {
        let Some(mkfs) = &self.formatter else {
            return Ok(());
        };
        let output = tokio::process::Command::new(mkfs)
            .args(["-F", "-q"])
            .arg(path)
            .output()
            .await
            .with_context(|| format!("failed to run {}", mkfs))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} {} failed: {}",
                mkfs,
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// `cp --sparse=always src dst`: holes stay holes.
pub async fn copy_sparse(src: &Path, dst: &Path) -> Result<()> {
    let output = tokio::process::Command::new("cp")
        .arg("--sparse=always")
        .arg(src)
        .arg(dst)
        .output()
        .await
        .context("failed to run cp")?;
    if !output.status.success() {
        anyhow::bail!(
            "copy {} → {} failed: {}",
            src.display(),
            dst.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[async_trait]
impl PoolFactory for OverlayFactory {
    type Entry = OverlayEntry;

    fn kind(&self) -> &'static str {
        "overlay"
    }

    async fn create(&self) -> Result<OverlayEntry> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("create overlay dir {}", self.dir.display()))?;

        let path = self.dir.join(format!(
            "{}{}{}",
            OVERLAY_PREFIX,
            uuid::Uuid::new_v4(),
            OVERLAY_SUFFIX
        ));

        let created = match &self.seed {
            Some(seed) => copy_sparse(seed, &path).await,
            None => {
                let file = tokio::fs::File::create(&path)
                    .await
                    .with_context(|| format!("create overlay {}", path.display()))?;
                file.set_len(self.size_bytes).await?;
                drop(file);
                self.format(&path).await
            }
        };
        if let Err(e) = created {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        debug!("[overlay] created {}", path.display());
        Ok(OverlayEntry { path })
    }

    async fn destroy(&self, entry: OverlayEntry) -> Result<()> {
        match tokio::fs::remove_file(&entry.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove overlay {}", entry.path.display())),
        }
    }

    async fn purge_stale(&self) -> Result<usize> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if Self::is_overlay_file(&name.to_string_lossy()) {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl OverlayPool {
    pub fn from_config(config: &RunnerConfig) -> Self {
        let factory = OverlayFactory::new(
            config.data_dir.join(OVERLAY_DIR),
            config.sandbox.overlay_size_mb,
        )
        .with_seed(
            config
                .firecracker
                .snapshot
                .as_ref()
                .map(|s| s.overlay.clone()),
        );
        ResourcePool::new(
            factory,
            PoolOptions {
                size: config.sandbox.overlay_pool_size(),
                replenish_threshold: config.sandbox.replenish_threshold,
            },
        )
    }
}
