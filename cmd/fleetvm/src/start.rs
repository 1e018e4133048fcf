use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pkg_executor::{Executor, ExecutorConfig};
use pkg_network::{HostCommand, NamespacePool, ProxyManager, pool_from_config};
use pkg_pool::OverlayPool;
use pkg_runner::{
    ControlPlane, ExecutorJobs, HttpControlPlane, PidLock, Poller, RealtimeSubscriber,
    RunnerEvent, Scheduler, SchedulerOptions, StatusWriter, Teardown,
};
use pkg_types::config::RunnerConfig;
use pkg_types::job::ExecMode;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Host resources one runner process owns: the instance lock, both pools,
/// and the proxy. Released by [`Teardown::teardown`].
pub(crate) struct HostResources {
    cmd: HostCommand,
    overlays: OverlayPool,
    namespaces: NamespacePool,
    proxy: Option<Arc<ProxyManager>>,
    lock: PidLock,
}

impl HostResources {
    /// Take the lock, then start the proxy and fill both pools. The lock is
    /// taken first so a second instance never touches the pools.
    pub(crate) async fn acquire(config: &RunnerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("create {}", config.data_dir.display()))?;
        let lock = PidLock::acquire(&config.lock_path())?;
        let cmd = HostCommand::detect();
        let resources = Self {
            cmd,
            overlays: OverlayPool::from_config(config),
            namespaces: pool_from_config(config, cmd)?,
            proxy: config
                .proxy
                .as_ref()
                .map(|p| Arc::new(ProxyManager::new(p.clone(), &config.data_dir))),
            lock,
        };
        if let Err(e) = resources.init().await {
            if let Err(te) = resources.teardown().await {
                warn!("[start] {:#}", te);
            }
            return Err(e);
        }
        Ok(resources)
    }

    async fn init(&self) -> Result<()> {
        if let Some(proxy) = &self.proxy {
            proxy.start().await.context("start proxy")?;
        }
        self.overlays
            .init()
            .await
            .context("initialise overlay pool")?;
        self.namespaces
            .init()
            .await
            .context("initialise namespace pool")?;
        Ok(())
    }

    pub(crate) fn executor(&self, config: &RunnerConfig) -> Executor {
        Executor::new(
            ExecutorConfig::from_config(config),
            self.overlays.clone(),
            self.namespaces.clone(),
            self.cmd,
        )
    }
}

#[async_trait]
impl Teardown for HostResources {
    async fn teardown(&self) -> Result<()> {
        let mut failed = Vec::new();
        if let Err(e) = self.overlays.cleanup().await {
            warn!("[start] overlay pool cleanup failed: {:#}", e);
            failed.push("overlays");
        }
        if let Err(e) = self.namespaces.cleanup().await {
            warn!("[start] namespace pool cleanup failed: {:#}", e);
            failed.push("namespaces");
        }
        if let Some(proxy) = &self.proxy
            && let Err(e) = proxy.stop().await
        {
            warn!("[start] proxy stop failed: {:#}", e);
            failed.push("proxy");
        }
        self.lock.release();
        if !failed.is_empty() {
            anyhow::bail!("teardown incomplete: {}", failed.join(", "));
        }
        Ok(())
    }
}

pub async fn run(config_path: &Path) -> Result<ExitCode> {
    let config = RunnerConfig::load(config_path)?;
    let signals = SignalStreams::install()?;
    let resources = HostResources::acquire(&config).await?;

    info!("Starting fleetvm runner");
    info!("  Name:        {}", config.name);
    info!("  Group:       {}", config.group);
    info!("  Server:      {}", config.server.url);
    info!("  Data dir:    {}", config.data_dir.display());
    info!("  Concurrency: {}", config.sandbox.max_concurrent);

    let executor = Arc::new(resources.executor(&config));
    let control: Arc<dyn ControlPlane> = match HttpControlPlane::from_config(&config) {
        Ok(control) => Arc::new(control),
        Err(e) => {
            if let Err(te) = resources.teardown().await {
                warn!("[start] {:#}", te);
            }
            return Err(e);
        }
    };
    let scheduler = Scheduler::new(
        SchedulerOptions {
            max_concurrent: config.sandbox.max_concurrent,
            pending_queue_capacity: config.sandbox.pending_queue_capacity,
        },
        control.clone(),
        Arc::new(ExecutorJobs::new(executor, ExecMode::Spawn)),
        Box::new(resources),
        Some(StatusWriter::new(config.status_path())),
    );

    let tx = scheduler.sender();
    let intake = vec![
        signals.forward(tx.clone()),
        tokio::spawn(RealtimeSubscriber::new(control.clone(), tx.clone()).run()),
        tokio::spawn(
            Poller::new(
                control,
                tx.clone(),
                Duration::from_millis(config.sandbox.poll_interval_ms),
                config.sandbox.max_concurrent,
            )
            .run(),
        ),
    ];
    drop(tx);

    let status = scheduler.run().await;
    for task in intake {
        task.abort();
    }
    info!(
        "fleetvm runner exited ({}, {} active)",
        status.mode, status.active_runs
    );
    Ok(ExitCode::SUCCESS)
}

/// SIGUSR1 drains; SIGTERM and SIGINT terminate.
struct SignalStreams {
    usr1: Signal,
    term: Signal,
    int: Signal,
}

impl SignalStreams {
    fn install() -> Result<Self> {
        Ok(Self {
            usr1: signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?,
            term: signal(SignalKind::terminate()).context("install SIGTERM handler")?,
            int: signal(SignalKind::interrupt()).context("install SIGINT handler")?,
        })
    }

    fn forward(mut self, tx: mpsc::UnboundedSender<RunnerEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (name, event) = tokio::select! {
                    _ = self.usr1.recv() => ("SIGUSR1", RunnerEvent::Drain),
                    _ = self.term.recv() => ("SIGTERM", RunnerEvent::Terminate),
                    _ = self.int.recv() => ("SIGINT", RunnerEvent::Terminate),
                    _ = tx.closed() => break,
                };
                info!("[start] received {}", name);
                if tx.send(event).is_err() {
                    break;
                }
            }
        })
    }
}
