//! Warm resource pool.
//!
//! Keeps `size` pre-created OS resources ready so a job pays an O(1) pop
//! instead of the creation latency. An empty pool degrades to synchronous
//! creation; it never makes the caller wait on a replenish.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Creates and destroys one kind of pooled resource.
#[async_trait]
pub trait PoolFactory: Send + Sync + 'static {
    type Entry: Send + 'static;

    /// Short label used in logs ("overlay", "namespace").
    fn kind(&self) -> &'static str;

    async fn create(&self) -> Result<Self::Entry>;

    async fn destroy(&self, entry: Self::Entry) -> Result<()>;

    /// Remove leftovers of previous runs found on disk / in the OS.
    /// Returns the number of resources removed.
    async fn purge_stale(&self) -> Result<usize>;

    /// Whether a released entry may be handed out again.
    fn recyclable(&self) -> bool {
        false
    }

    /// Verify a released entry before it is queued again. An error sends
    /// the entry to `destroy` instead.
    async fn check(&self, _entry: &Self::Entry) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Number of warm entries to keep.
    pub size: usize,
    /// Replenish in the background when fewer than this many remain.
    pub replenish_threshold: usize,
}

struct Inner<F: PoolFactory> {
    factory: F,
    options: PoolOptions,
    entries: Mutex<VecDeque<F::Entry>>,
    replenishing: AtomicBool,
    closed: AtomicBool,
}

/// Pool of pre-created resources. Cheap to clone; clones share the queue.
pub struct ResourcePool<F: PoolFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: PoolFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: PoolFactory> ResourcePool<F> {
    pub fn new(factory: F, options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                options,
                entries: Mutex::new(VecDeque::new()),
                replenishing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn options(&self) -> PoolOptions {
        self.inner.options
    }

    /// Reset leftovers from a previous run, then fill the pool.
    pub async fn init(&self) -> Result<()> {
        let kind = self.inner.factory.kind();
        let purged = self.inner.factory.purge_stale().await?;
        if purged > 0 {
            info!("[pool:{}] purged {} stale entries", kind, purged);
        }

        let start = Instant::now();
        for _ in 0..self.inner.options.size {
            let entry = self.inner.factory.create().await?;
            self.inner.entries.lock().await.push_back(entry);
        }
        info!(
            "[pool:{}] ready with {} entries in {}ms",
            kind,
            self.inner.options.size,
            start.elapsed().as_millis()
        );
        Ok(())
    }

    /// Take an entry, creating one on the spot if the pool is empty.
    ///
    /// Only fails if creating the resource itself fails.
    pub async fn acquire(&self) -> Result<F::Entry> {
        let kind = self.inner.factory.kind();
        let popped = self.inner.entries.lock().await.pop_front();

        let entry = match popped {
            Some(entry) => entry,
            None => {
                let start = Instant::now();
                let entry = self.inner.factory.create().await?;
                warn!(
                    pool = kind,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "[pool:{}] empty, created entry on demand",
                    kind
                );
                entry
            }
        };

        let remaining = self.len().await;
        if remaining < self.inner.options.replenish_threshold
            && remaining < self.inner.options.size
        {
            self.spawn_replenish();
        }
        Ok(entry)
    }

    /// Return an entry. Recyclable entries that pass the factory check go
    /// back to the queue while the pool is below `size`; everything else is
    /// destroyed.
    pub async fn release(&self, entry: F::Entry) -> Result<()> {
        let factory = &self.inner.factory;
        if factory.recyclable() && !self.inner.closed.load(Ordering::SeqCst) {
            match factory.check(&entry).await {
                Ok(()) => {
                    let mut entries = self.inner.entries.lock().await;
                    if entries.len() < self.inner.options.size
                        && !self.inner.closed.load(Ordering::SeqCst)
                    {
                        entries.push_back(entry);
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(
                        "[pool:{}] released entry failed check, destroying: {:#}",
                        factory.kind(),
                        e
                    );
                }
            }
        }
        factory.destroy(entry).await
    }

    /// Destroy an entry without offering it back to the queue. Used when the
    /// holder may have left it broken.
    pub async fn discard(&self, entry: F::Entry) -> Result<()> {
        let result = self.inner.factory.destroy(entry).await;
        if !self.inner.closed.load(Ordering::SeqCst) {
            let remaining = self.len().await;
            if remaining < self.inner.options.size {
                self.spawn_replenish();
            }
        }
        result
    }

    /// Destroy every queued entry, then sweep anything orphaned.
    pub async fn cleanup(&self) -> Result<()> {
        let kind = self.inner.factory.kind();
        self.inner.closed.store(true, Ordering::SeqCst);

        let drained: Vec<F::Entry> = self.inner.entries.lock().await.drain(..).collect();
        let count = drained.len();
        for entry in drained {
            if let Err(e) = self.inner.factory.destroy(entry).await {
                warn!("[pool:{}] failed to destroy entry: {:#}", kind, e);
            }
        }
        let purged = self.inner.factory.purge_stale().await?;
        info!(
            "[pool:{}] cleaned up {} queued and {} orphaned entries",
            kind, count, purged
        );
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Start a background refill unless one is already running.
    fn spawn_replenish(&self) {
        if self
            .inner
            .replenishing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let kind = inner.factory.kind();
            let mut created = 0usize;
            loop {
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                if inner.entries.lock().await.len() >= inner.options.size {
                    break;
                }
                match inner.factory.create().await {
                    Ok(entry) => {
                        if inner.closed.load(Ordering::SeqCst) {
                            let _ = inner.factory.destroy(entry).await;
                            break;
                        }
                        inner.entries.lock().await.push_back(entry);
                        created += 1;
                    }
                    Err(e) => {
                        warn!("[pool:{}] replenish failed: {:#}", kind, e);
                        break;
                    }
                }
            }
            if created > 0 {
                debug!("[pool:{}] replenished {} entries", kind, created);
            }
            inner.replenishing.store(false, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        purged: AtomicUsize,
    }

    struct FakeFactory {
        counters: Arc<Counters>,
        stale: usize,
        recyclable: bool,
        fail: AtomicBool,
        broken: AtomicBool,
    }

    impl FakeFactory {
        fn new(counters: Arc<Counters>) -> Self {
            Self {
                counters,
                stale: 0,
                recyclable: false,
                fail: AtomicBool::new(false),
                broken: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PoolFactory for FakeFactory {
        type Entry = usize;

        fn kind(&self) -> &'static str {
            "fake"
        }

        async fn create(&self) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("create failed");
            }
            Ok(self.counters.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _entry: usize) -> Result<()> {
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn purge_stale(&self) -> Result<usize> {
            self.counters.purged.fetch_add(1, Ordering::SeqCst);
            Ok(self.stale)
        }

        fn recyclable(&self) -> bool {
            self.recyclable
        }

        async fn check(&self, entry: &usize) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                anyhow::bail!("entry {} is broken", entry);
            }
            Ok(())
        }
    }

    async fn wait_for_len<F: PoolFactory>(pool: &ResourcePool<F>, want: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.len().await != want {
            assert!(Instant::now() < deadline, "pool never reached {}", want);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn acquire_with_size_zero_creates_on_demand() {
        let counters = Arc::new(Counters::default());
        let pool = ResourcePool::new(
            FakeFactory::new(counters.clone()),
            PoolOptions {
                size: 0,
                replenish_threshold: 1,
            },
        );
        pool.init().await.unwrap();
        assert!(pool.is_empty().await);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a, b);
        assert_eq!(counters.created.load(Ordering::SeqCst), 2);
        assert!(pool.is_empty().await);
    }

    #[tokio::test]
    async fn init_purges_then_fills() {
        let counters = Arc::new(Counters::default());
        let mut factory = FakeFactory::new(counters.clone());
        factory.stale = 3;
        let pool = ResourcePool::new(
            factory,
            PoolOptions {
                size: 2,
                replenish_threshold: 1,
            },
        );
        pool.init().await.unwrap();
        assert_eq!(counters.purged.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn acquire_below_threshold_triggers_replenish() {
        let counters = Arc::new(Counters::default());
        let pool = ResourcePool::new(
            FakeFactory::new(counters.clone()),
            PoolOptions {
                size: 3,
                replenish_threshold: 3,
            },
        );
        pool.init().await.unwrap();
        pool.acquire().await.unwrap();
        pool.acquire().await.unwrap();
        wait_for_len(&pool, 3).await;
        assert_eq!(counters.created.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn replenish_failure_does_not_fail_acquire() {
        let counters = Arc::new(Counters::default());
        let pool = ResourcePool::new(
            FakeFactory::new(counters.clone()),
            PoolOptions {
                size: 1,
                replenish_threshold: 1,
            },
        );
        pool.init().await.unwrap();
        pool.factory().fail.store(true, Ordering::SeqCst);
        assert!(pool.acquire().await.is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.is_empty().await);
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn release_recycles_only_recyclable_entries() {
        let counters = Arc::new(Counters::default());
        let mut factory = FakeFactory::new(counters.clone());
        factory.recyclable = true;
        let pool = ResourcePool::new(
            factory,
            PoolOptions {
                size: 1,
                replenish_threshold: 0,
            },
        );
        pool.init().await.unwrap();
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a).await.unwrap();
        pool.release(b).await.unwrap();
        assert_eq!(pool.len().await, 1);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);

        let counters = Arc::new(Counters::default());
        let pool = ResourcePool::new(
            FakeFactory::new(counters.clone()),
            PoolOptions {
                size: 1,
                replenish_threshold: 0,
            },
        );
        pool.init().await.unwrap();
        let a = pool.acquire().await.unwrap();
        pool.release(a).await.unwrap();
        assert!(pool.is_empty().await);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_destroys_entries_that_fail_check() {
        let counters = Arc::new(Counters::default());
        let mut factory = FakeFactory::new(counters.clone());
        factory.recyclable = true;
        let pool = ResourcePool::new(
            factory,
            PoolOptions {
                size: 1,
                replenish_threshold: 0,
            },
        );
        pool.init().await.unwrap();
        let a = pool.acquire().await.unwrap();
        pool.factory().broken.store(true, Ordering::SeqCst);
        pool.release(a).await.unwrap();
        assert!(pool.is_empty().await);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);

        pool.factory().broken.store(false, Ordering::SeqCst);
        let b = pool.acquire().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn discard_never_recycles_and_refills() {
        let counters = Arc::new(Counters::default());
        let mut factory = FakeFactory::new(counters.clone());
        factory.recyclable = true;
        let pool = ResourcePool::new(
            factory,
            PoolOptions {
                size: 1,
                replenish_threshold: 0,
            },
        );
        pool.init().await.unwrap();
        let a = pool.acquire().await.unwrap();
        pool.discard(a).await.unwrap();
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
        wait_for_len(&pool, 1).await;
        let b = pool.acquire().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn cleanup_destroys_queue_and_purges() {
        let counters = Arc::new(Counters::default());
        let pool = ResourcePool::new(
            FakeFactory::new(counters.clone()),
            PoolOptions {
                size: 3,
                replenish_threshold: 1,
            },
        );
        pool.init().await.unwrap();
        pool.cleanup().await.unwrap();
        assert!(pool.is_empty().await);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 3);
        assert_eq!(counters.purged.load(Ordering::SeqCst), 2);
    }
}
