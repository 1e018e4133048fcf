//! Job scheduler.
//!
//! One loop owns all scheduling state and consumes [`RunnerEvent`]s from a
//! single channel. Notifications come from the realtime subscription and the
//! poller; claims and executions run as spawned tasks that report back
//! through the same channel, so the loop never waits on the network.
//!
//! `claiming` counts against `max_concurrent`, which keeps the number of
//! active runs within the limit at every point.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use pkg_executor::Executor;
use pkg_types::job::{ExecMode, ExecutionContext, ExecutionOutcome};
use pkg_types::status::{RunnerMode, RunnerStatus};
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::api::{ClaimOutcome, ControlPlane};
use crate::status::StatusWriter;

#[derive(Debug)]
pub enum RunnerEvent {
    /// A job is available.
    Notify(String),
    ClaimFinished {
        run_id: String,
        result: Result<ClaimOutcome>,
    },
    JobFinished {
        run_id: String,
    },
    /// Finish running jobs, take no new ones.
    Drain,
    /// Stop intake, wait for running jobs, tear down.
    Terminate,
}

/// Executes one claimed job.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, ctx: ExecutionContext) -> ExecutionOutcome;
}

/// Releases process-wide resources once the scheduler stops.
#[async_trait]
pub trait Teardown: Send + Sync {
    async fn teardown(&self) -> Result<()>;
}

/// [`JobRunner`] backed by the VM executor.
pub struct ExecutorJobs {
    executor: Arc<Executor>,
    mode: ExecMode,
}

impl ExecutorJobs {
    pub fn new(executor: Arc<Executor>, mode: ExecMode) -> Self {
        Self { executor, mode }
    }
}

#[async_trait]
impl JobRunner for ExecutorJobs {
    async fn run(&self, ctx: ExecutionContext) -> ExecutionOutcome {
        self.executor.execute(&ctx, self.mode).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub max_concurrent: usize,
    pub pending_queue_capacity: usize,
}

/// Scheduling state. Only the loop touches it.
#[derive(Debug)]
pub struct RunnerState {
    pub mode: RunnerMode,
    pub active_runs: HashSet<String>,
    pub claiming: HashSet<String>,
    pub pending: VecDeque<String>,
    pub started_at: DateTime<Utc>,
}

impl RunnerState {
    fn new() -> Self {
        Self {
            mode: RunnerMode::Running,
            active_runs: HashSet::new(),
            claiming: HashSet::new(),
            pending: VecDeque::new(),
            started_at: Utc::now(),
        }
    }

    fn knows(&self, run_id: &str) -> bool {
        self.active_runs.contains(run_id)
            || self.claiming.contains(run_id)
            || self.pending.iter().any(|id| id == run_id)
    }

    fn in_flight(&self) -> usize {
        self.active_runs.len() + self.claiming.len()
    }

    fn is_idle(&self) -> bool {
        self.active_runs.is_empty() && self.claiming.is_empty()
    }

    pub fn status(&self) -> RunnerStatus {
        RunnerStatus::new(
            self.mode,
            self.active_runs.iter().cloned().collect(),
            self.started_at,
        )
    }
}

pub struct Scheduler {
    state: RunnerState,
    options: SchedulerOptions,
    control: Arc<dyn ControlPlane>,
    jobs: Arc<dyn JobRunner>,
    teardown: Box<dyn Teardown>,
    status: Option<StatusWriter>,
    tx: mpsc::UnboundedSender<RunnerEvent>,
    rx: mpsc::UnboundedReceiver<RunnerEvent>,
    tasks: JoinSet<()>,
}

impl Scheduler {
    pub fn new(
        options: SchedulerOptions,
        control: Arc<dyn ControlPlane>,
        jobs: Arc<dyn JobRunner>,
        teardown: Box<dyn Teardown>,
        status: Option<StatusWriter>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: RunnerState::new(),
            options,
            control,
            jobs,
            teardown,
            status,
            tx,
            rx,
            tasks: JoinSet::new(),
        }
    }

    /// Handle for event sources (poller, realtime, signals).
    pub fn sender(&self) -> mpsc::UnboundedSender<RunnerEvent> {
        self.tx.clone()
    }

    /// Process events until drained or terminated; returns the final status.
    pub async fn run(mut self) -> RunnerStatus {
        info!(
            "[scheduler] running (max_concurrent={}, queue={})",
            self.options.max_concurrent, self.options.pending_queue_capacity
        );
        self.persist().await;
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
            while self.tasks.try_join_next().is_some() {}
            if self.ready_to_stop() {
                break;
            }
        }
        self.shutdown().await
    }

    fn ready_to_stop(&self) -> bool {
        matches!(self.state.mode, RunnerMode::Draining | RunnerMode::Stopping) && self.state.is_idle()
    }

    async fn handle(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::Notify(run_id) => self.on_notify(run_id),
            RunnerEvent::ClaimFinished { run_id, result } => {
                self.on_claim_finished(run_id, result).await
            }
            RunnerEvent::JobFinished { run_id } => self.on_job_finished(run_id).await,
            RunnerEvent::Drain => self.on_drain().await,
            RunnerEvent::Terminate => self.on_terminate().await,
        }
    }

    fn on_notify(&mut self, run_id: String) {
        if self.state.mode != RunnerMode::Running {
            debug!(run_id = %run_id, "[scheduler] {}: ignoring job", self.state.mode);
            return;
        }
        if self.state.knows(&run_id) {
            debug!(run_id = %run_id, "[scheduler] duplicate notification");
            return;
        }
        if self.state.in_flight() >= self.options.max_concurrent {
            if self.state.pending.len() >= self.options.pending_queue_capacity {
                warn!(
                    run_id = %run_id,
                    "[scheduler] pending queue full ({}), dropping job",
                    self.state.pending.len()
                );
                return;
            }
            debug!(run_id = %run_id, "[scheduler] at capacity, queued");
            self.state.pending.push_back(run_id);
            return;
        }
        self.spawn_claim(run_id);
    }

    fn spawn_claim(&mut self, run_id: String) {
        self.state.claiming.insert(run_id.clone());
        let control = self.control.clone();
        let tx = self.tx.clone();
        self.tasks.spawn(async move {
            let result = match AssertUnwindSafe(control.claim(&run_id)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("claim panicked")),
            };
            let _ = tx.send(RunnerEvent::ClaimFinished { run_id, result });
        });
    }

    async fn on_claim_finished(&mut self, run_id: String, result: Result<ClaimOutcome>) {
        self.state.claiming.remove(&run_id);
        match result {
            Ok(ClaimOutcome::Claimed(ctx)) if self.state.mode == RunnerMode::Stopping => {
                warn!(run_id = %run_id, "[scheduler] claimed while stopping, reporting failure");
                self.spawn_complete(
                    run_id,
                    ExecutionOutcome::failed("runner stopped before the job started"),
                );
                drop(ctx);
            }
            Ok(ClaimOutcome::Claimed(ctx)) => {
                info!(run_id = %run_id, "[scheduler] claimed");
                self.state.active_runs.insert(run_id.clone());
                self.persist().await;
                self.spawn_job(*ctx);
            }
            Ok(ClaimOutcome::AlreadyClaimed) => {
                debug!(run_id = %run_id, "[scheduler] already claimed by another runner");
            }
            Err(e) => {
                warn!(run_id = %run_id, "[scheduler] claim failed: {:#}", e);
            }
        }
        self.admit_pending();
    }

    /// Execute, report, and always send `JobFinished`, even if the job panics.
    fn spawn_job(&mut self, ctx: ExecutionContext) {
        let jobs = self.jobs.clone();
        let control = self.control.clone();
        let tx = self.tx.clone();
        let run_id = ctx.run_id.clone();
        self.tasks.spawn(async move {
            let outcome = match AssertUnwindSafe(jobs.run(ctx)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(run_id = %run_id, "[scheduler] job panicked: {}", msg);
                    ExecutionOutcome::failed(format!("job panicked: {}", msg))
                }
            };
            if let Err(e) = control.complete(&run_id, &outcome).await {
                warn!(run_id = %run_id, "[scheduler] complete-job failed: {:#}", e);
            }
            let _ = tx.send(RunnerEvent::JobFinished { run_id });
        });
    }

    fn spawn_complete(&mut self, run_id: String, outcome: ExecutionOutcome) {
        let control = self.control.clone();
        self.tasks.spawn(async move {
            if let Err(e) = control.complete(&run_id, &outcome).await {
                warn!(run_id = %run_id, "[scheduler] complete-job failed: {:#}", e);
            }
        });
    }

    async fn on_job_finished(&mut self, run_id: String) {
        if !self.state.active_runs.remove(&run_id) {
            debug!(run_id = %run_id, "[scheduler] finish for unknown run");
        }
        info!(run_id = %run_id, "[scheduler] job finished ({} active)", self.state.active_runs.len());
        self.persist().await;
        self.admit_pending();
    }

    /// Claim queued jobs while there is room.
    fn admit_pending(&mut self) {
        while self.state.mode == RunnerMode::Running
            && self.state.in_flight() < self.options.max_concurrent
        {
            let Some(run_id) = self.state.pending.pop_front() else {
                break;
            };
            debug!(run_id = %run_id, "[scheduler] admitting queued job");
            self.spawn_claim(run_id);
        }
    }

    async fn on_drain(&mut self) {
        if self.state.mode != RunnerMode::Running {
            debug!("[scheduler] drain ignored in {}", self.state.mode);
            return;
        }
        let dropped = self.state.pending.len();
        self.state.mode = RunnerMode::Draining;
        self.state.pending.clear();
        info!(
            "[scheduler] draining: {} active, {} claiming, {} queued dropped",
            self.state.active_runs.len(),
            self.state.claiming.len(),
            dropped
        );
        self.persist().await;
    }

    async fn on_terminate(&mut self) {
        if self.state.mode == RunnerMode::Stopping {
            return;
        }
        self.state.mode = RunnerMode::Stopping;
        self.state.pending.clear();
        info!(
            "[scheduler] terminating: waiting for {} active job(s)",
            self.state.active_runs.len()
        );
        self.persist().await;
    }

    async fn shutdown(mut self) -> RunnerStatus {
        if self.state.mode != RunnerMode::Stopping {
            self.state.mode = RunnerMode::Stopping;
            self.persist().await;
        }
        while self.tasks.join_next().await.is_some() {}
        if let Err(e) = self.teardown.teardown().await {
            warn!("[scheduler] teardown failed: {:#}", e);
        }
        self.state.mode = RunnerMode::Stopped;
        self.persist().await;
        info!("[scheduler] stopped");
        self.state.status()
    }

    /// The returned future owns its data so the loop future stays `Send`.
    fn persist(&self) -> impl Future<Output = ()> + Send + 'static {
        let writer = self.status.clone();
        let status = self.state.status();
        async move {
            if let Some(writer) = writer
                && let Err(e) = writer.write(&status).await
            {
                warn!("[scheduler] failed to write status: {:#}", e);
            }
        }
    }
}
