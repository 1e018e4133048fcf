use async_trait::async_trait;
use pkg_constants::runtime::SETUP_EXEC_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::GuestError;
use crate::protocol::ProcessExit;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnResult {
    pub pid: u32,
}

/// Operations on a running guest.
///
/// A non-zero exit from `exec` is a result, not an error; errors are kept
/// for the channel itself failing (see [`GuestError::is_connectivity`]) and
/// for timeouts.
#[async_trait]
pub trait GuestChannel: Send + Sync {
    async fn exec(
        &self,
        command: &str,
        timeout_ms: u64,
        env: &HashMap<String, String>,
    ) -> Result<ExecResult, GuestError>;

    /// `exec` with the setup timeout, failing on a non-zero exit. Returns stdout.
    async fn exec_or_throw(&self, command: &str) -> Result<String, GuestError> {
        let res = self
            .exec(command, SETUP_EXEC_TIMEOUT_MS, &HashMap::new())
            .await?;
        if !res.success() {
            return Err(GuestError::CommandFailed {
                command: command.to_string(),
                exit_code: res.exit_code,
                stderr: res.stderr,
            });
        }
        Ok(res.stdout)
    }

    /// Start `command` in the background; its exit is pushed later.
    async fn spawn_and_watch(
        &self,
        command: &str,
        timeout_ms: u64,
        env: &HashMap<String, String>,
    ) -> Result<SpawnResult, GuestError>;

    /// Wait for the pushed exit of `pid`. An exit that arrived before this
    /// call is returned immediately.
    async fn wait_for_exit(&self, pid: u32, timeout_ms: u64) -> Result<ProcessExit, GuestError>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), GuestError>;

    /// Write a file owned by root, e.g. under `/usr/local`.
    async fn write_file_with_sudo(
        &self,
        path: &str,
        content: &[u8],
        mode: Option<u32>,
    ) -> Result<(), GuestError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, GuestError>;

    async fn mkdir(&self, path: &str) -> Result<(), GuestError>;

    async fn exists(&self, path: &str) -> Result<bool, GuestError>;

    async fn is_reachable(&self) -> bool;

    /// Block until the guest agent is connected or `timeout_ms` passes.
    async fn wait_for_guest_connection(&self, timeout_ms: u64) -> Result<(), GuestError>;
}
