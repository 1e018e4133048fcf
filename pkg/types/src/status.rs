use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduler lifecycle.
///
/// `Running → Draining → Stopping → Stopped`, or straight to `Stopping`
/// on termination. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerMode {
    Running,
    Draining,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RunnerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerMode::Running => write!(f, "running"),
            RunnerMode::Draining => write!(f, "draining"),
            RunnerMode::Stopping => write!(f, "stopping"),
            RunnerMode::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of the scheduler written to the status file for external tooling.
/// A projection only: the scheduler never reads it back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatus {
    pub mode: RunnerMode,
    pub active_runs: usize,
    pub active_run_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunnerStatus {
    pub fn new(
        mode: RunnerMode,
        mut active_run_ids: Vec<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        active_run_ids.sort();
        Self {
            mode,
            active_runs: active_run_ids.len(),
            active_run_ids,
            started_at,
            updated_at: Utc::now(),
        }
    }

    /// Drop a run id (used by force-kill tooling).
    pub fn remove_run(&mut self, run_id: &str) -> bool {
        let before = self.active_run_ids.len();
        self.active_run_ids.retain(|id| id != run_id);
        self.active_runs = self.active_run_ids.len();
        self.updated_at = Utc::now();
        before != self.active_run_ids.len()
    }
}
