//! Single-instance lock: a PID file created exclusively.

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: u32,
}

/// Whether `pid` names a live process. EPERM means it exists but is not ours.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid as i32), None), Ok(()) | Err(Errno::EPERM))
}

/// PID recorded in the lock file, if the file exists and parses.
pub fn read_holder(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

impl PidLock {
    /// Take the lock for this process. A file left by a dead process is
    /// removed; a live holder is an error.
    pub fn acquire(path: &Path) -> Result<Self> {
        let pid = std::process::id();
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(mut file) => {
                    writeln!(file, "{}", pid)
                        .with_context(|| format!("write {}", path.display()))?;
                    info!("[lock] acquired {} (pid={})", path.display(), pid);
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match read_holder(path) {
                        Some(holder) if pid_alive(holder) => {
                            bail!(
                                "another runner is already running (pid {}, lock {})",
                                holder,
                                path.display()
                            );
                        }
                        holder => {
                            warn!(
                                "[lock] removing stale lock {} (pid {:?})",
                                path.display(),
                                holder
                            );
                            std::fs::remove_file(path)
                                .with_context(|| format!("remove stale {}", path.display()))?;
                        }
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("create {}", path.display()));
                }
            }
        }
        bail!("could not acquire {}", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file if it still names this process.
    pub fn release(&self) {
        if read_holder(&self.path) == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runner.pid");
        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(read_holder(&path), Some(std::process::id()));
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn live_holder_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runner.pid");
        let _lock = PidLock::acquire(&path).unwrap();
        let err = PidLock::acquire(&path).unwrap_err().to_string();
        assert!(err.contains("already running"), "{}", err);
    }

    #[test]
    fn stale_pid_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runner.pid");
        // Above the kernel's pid_max ceiling, so never alive.
        std::fs::write(&path, "4194311\n").unwrap();
        let _lock = PidLock::acquire(&path).unwrap();
        assert_eq!(read_holder(&path), Some(std::process::id()));
    }

    #[test]
    fn garbage_lock_file_is_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("runner.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert!(PidLock::acquire(&path).is_ok());
    }

    #[test]
    fn liveness() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
        assert!(!pid_alive(4_194_311));
    }
}
