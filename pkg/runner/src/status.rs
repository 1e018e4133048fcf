//! Status file: a JSON projection of the scheduler for `doctor` and `kill`.

use anyhow::{Context, Result};
use pkg_types::status::RunnerStatus;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StatusWriter {
    path: PathBuf,
}

impl StatusWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write via a temp file and rename, so readers never see a partial file.
    pub async fn write(&self, status: &RunnerStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(status)?;
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename {} → {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    /// `None` when no runner has written a status yet.
    pub async fn read(&self) -> Result<Option<RunnerStatus>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let status = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parse {}", self.path.display()))?;
                Ok(Some(status))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", self.path.display())),
        }
    }

    /// Drop `run_id` from the active list. Returns whether it was present.
    pub async fn remove_run(&self, run_id: &str) -> Result<bool> {
        let Some(mut status) = self.read().await? else {
            return Ok(false);
        };
        let removed = status.remove_run(run_id);
        if removed {
            self.write(&status).await?;
        }
        Ok(removed)
    }
}
