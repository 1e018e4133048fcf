//! Best-effort teardown.
//!
//! A fixed, ordered list of named steps. Every step runs even if an earlier
//! one failed or panicked; each outcome is collected into a report instead
//! of short-circuiting.

use anyhow::Result;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub outcomes: Vec<StepOutcome>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(StepOutcome::ok)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes.iter().filter(|o| !o.ok())
    }

    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

#[derive(Default)]
pub struct Cleanup<'a> {
    steps: Vec<(String, BoxFuture<'a, Result<()>>)>,
}

impl<'a> Cleanup<'a> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Append a step. The future is not polled until [`Cleanup::run`].
    pub fn step<F>(mut self, name: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'a,
    {
        self.steps.push((name.into(), Box::pin(fut)));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order.
    pub async fn run(self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for (name, fut) in self.steps {
            let error = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(_) => Some("step panicked".to_string()),
            };
            if let Some(err) = &error {
                warn!(step = %name, "cleanup step failed: {}", err);
            }
            report.outcomes.push(StepOutcome { name, error });
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failing_tap_step_does_not_stop_later_steps() {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = tmp.path().join("vm");
        std::fs::create_dir_all(workspace.join("sub")).unwrap();
        let status = tmp.path().join("status.json");

        let report = Cleanup::new()
            .step("delete tap", async {
                anyhow::bail!("Cannot find device \"vmtap0\"")
            })
            .step("remove workspace", async {
                tokio::fs::remove_dir_all(&workspace).await?;
                Ok(())
            })
            .step("update status", async {
                tokio::fs::write(&status, b"{}").await?;
                Ok(())
            })
            .run()
            .await;

        assert_eq!(report.outcomes.len(), 3);
        assert!(!report.is_clean());
        assert_eq!(report.failures().count(), 1);
        assert!(
            report
                .outcome("delete tap")
                .unwrap()
                .error
                .as_deref()
                .unwrap()
                .contains("vmtap0")
        );
        assert!(report.outcome("remove workspace").unwrap().ok());
        assert!(report.outcome("update status").unwrap().ok());
        assert!(!workspace.exists());
        assert!(status.exists());
    }

    #[tokio::test]
    async fn panicking_step_is_isolated() {
        let report = Cleanup::new()
            .step("boom", async { panic!("boom") })
            .step("after", async { Ok(()) })
            .run()
            .await;
        assert_eq!(
            report.outcome("boom").unwrap().error.as_deref(),
            Some("step panicked")
        );
        assert!(report.outcome("after").unwrap().ok());
    }

    #[tokio::test]
    async fn steps_run_in_order() {
        let order = std::sync::Mutex::new(Vec::new());
        Cleanup::new()
            .step("a", async {
                order.lock().unwrap().push("a");
                Ok(())
            })
            .step("b", async {
                order.lock().unwrap().push("b");
                Ok(())
            })
            .run()
            .await;
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }
}
