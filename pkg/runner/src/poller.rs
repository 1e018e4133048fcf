//! Fallback intake: periodic poll of the control plane.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::ControlPlane;
use crate::scheduler::RunnerEvent;

pub struct Poller {
    control: Arc<dyn ControlPlane>,
    tx: mpsc::UnboundedSender<RunnerEvent>,
    interval: Duration,
    max_concurrent: usize,
}

impl Poller {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        tx: mpsc::UnboundedSender<RunnerEvent>,
        interval: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            control,
            tx,
            interval,
            max_concurrent,
        }
    }

    /// Poll until the scheduler goes away. The first round is a burst that
    /// fills every free slot after a restart.
    pub async fn run(self) {
        info!("[poller] polling every {}ms", self.interval.as_millis());
        let burst = self.burst().await;
        debug!("[poller] startup burst found {} job(s)", burst);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The burst already covered the immediate first tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.tx.closed() => break,
            }
            if !self.poll_once().await {
                break;
            }
        }
        debug!("[poller] stopped");
    }

    /// Poll repeatedly until the queue is empty, an id repeats, or
    /// `max_concurrent` polls were made. Returns the number of notices sent.
    pub async fn burst(&self) -> usize {
        let mut seen = HashSet::new();
        for _ in 0..self.max_concurrent.max(1) {
            match self.control.poll().await {
                Ok(Some(job)) => {
                    if !seen.insert(job.run_id.clone()) {
                        break;
                    }
                    if self.tx.send(RunnerEvent::Notify(job.run_id)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[poller] poll failed: {:#}", e);
                    break;
                }
            }
        }
        seen.len()
    }

    /// One poll. Returns false once the scheduler has stopped listening.
    async fn poll_once(&self) -> bool {
        match self.control.poll().await {
            Ok(Some(job)) => {
                debug!(run_id = %job.run_id, "[poller] job available");
                self.tx.send(RunnerEvent::Notify(job.run_id)).is_ok()
            }
            Ok(None) => !self.tx.is_closed(),
            Err(e) => {
                warn!("[poller] poll failed: {:#}", e);
                !self.tx.is_closed()
            }
        }
    }
}
