use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A job announced by the control plane (poll result or realtime push).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobNotice {
    pub run_id: String,
}

/// Everything a node needs to execute a claimed job.
///
/// Returned by the claim call; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub run_id: String,
    pub prompt: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default)]
    pub resume_session: Option<ResumeSession>,
    #[serde(default)]
    pub storage: Vec<StorageArchive>,
    /// Short-lived token the guest uses to talk back to the control plane.
    pub sandbox_token: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_working_dir() -> String {
    "/home/user/workspace".to_string()
}

/// Prior session state restored into the guest before the payload runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSession {
    pub session_id: String,
    /// JSONL session history.
    pub history: String,
}

/// One archive of the storage manifest, materialized at `mount_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageArchive {
    pub name: String,
    pub mount_path: String,
    /// Pre-signed download URL of a gzip'd tarball.
    pub url: String,
}

/// How the payload is driven inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Single request held open until the command exits.
    Exec,
    /// Spawn, then wait for the guest's exit notification.
    #[default]
    Spawn,
}

/// Result of one execution, reported through complete-job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
    /// Wall time of each executor phase, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub durations: Vec<PhaseTiming>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: String,
    pub ms: u64,
}

impl ExecutionOutcome {
    pub fn success(exit_code: i32) -> Self {
        Self {
            exit_code,
            error: None,
            durations: Vec::new(),
        }
    }

    /// Failure before or around the payload (boot, setup, channel).
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            error: Some(error.into()),
            durations: Vec::new(),
        }
    }

    pub fn with_durations(mut self, durations: Vec<PhaseTiming>) -> Self {
        self.durations = durations;
        self
    }

    pub fn total_ms(&self) -> u64 {
        self.durations.iter().map(|d| d.ms).sum()
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}
