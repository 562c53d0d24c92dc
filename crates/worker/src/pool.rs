//! Bounded pool of browser workers.
//!
//! At most `max_workers` fetches run at once; callers queue on a fair
//! semaphore so URLs are handed out in submission order. Workers are
//! created lazily while holding a dispatch permit, which also caps the
//! number of live browsers at `max_workers`.

use crate::browser_worker::{BrowserWorker, FetchReport, FetchSettings};
use crate::challenge::ChallengeWaiter;
use crate::engine::{RenderEngine, RenderSession};
use crate::metrics::Metrics;
use crawl_hive_common::{ChallengeSignatureRegistry, CrawlConfig, WorkerLifecycle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker pool is shutting down")]
    ShuttingDown,
    #[error("failed to start a browser worker after {attempts} attempt(s): {last_error}")]
    WorkerCreation { attempts: u32, last_error: String },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    /// Per-worker and aggregate footprint ceiling
    pub memory_threshold_mb: u64,
    pub lifecycle: WorkerLifecycle,
    /// Recycle after this many fetches; 0 disables
    pub max_fetches_per_worker: u64,
    pub worker_create_attempts: u32,
    pub worker_create_timeout: Duration,
    pub worker_create_backoff: Duration,
    pub fetch: FetchSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_crawl_config(&CrawlConfig::default())
    }
}

impl PoolConfig {
    pub fn from_crawl_config(config: &CrawlConfig) -> Self {
        Self {
            max_workers: config.max_browsers.max(1),
            memory_threshold_mb: config.memory_threshold_mb,
            lifecycle: config.worker_lifecycle,
            max_fetches_per_worker: config.max_fetches_per_worker,
            worker_create_attempts: config.worker_create_attempts.max(1),
            worker_create_timeout: config.worker_create_timeout,
            worker_create_backoff: config.retry_backoff,
            fetch: FetchSettings::from_config(config),
        }
    }
}

/// Why a worker was taken out of service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    MemoryExceeded,
    AggregateMemoryExceeded,
    AlwaysNew,
    FetchLimit,
    Fatal,
    Shutdown,
    Abandoned,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemoryExceeded => "memory_exceeded",
            Self::AggregateMemoryExceeded => "aggregate_memory_exceeded",
            Self::AlwaysNew => "always_new",
            Self::FetchLimit => "fetch_limit",
            Self::Fatal => "fatal_error",
            Self::Shutdown => "shutdown",
            Self::Abandoned => "abandoned",
        }
    }

    /// Recycled workers get an eager replacement
    pub fn is_recycle(&self) -> bool {
        !matches!(self, Self::Fatal | Self::Shutdown | Self::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Keep,
    Retire(RetireReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub live_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub peak_busy: usize,
    pub workers_created: u64,
    pub workers_recycled: u64,
    pub workers_destroyed: u64,
    pub fetches: u64,
    pub aggregate_memory_mb: u64,
}

/// Proof of a reserved dispatch slot
pub struct DispatchPermit {
    _permit: OwnedSemaphorePermit,
}

struct LiveWorker {
    session: Arc<dyn RenderSession>,
    memory_mb: u64,
}

type LiveWorkers = Arc<StdMutex<HashMap<u64, LiveWorker>>>;

fn lock_live(live: &LiveWorkers) -> std::sync::MutexGuard<'_, HashMap<u64, LiveWorker>> {
    live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Retirement counters shared with worker leases
#[derive(Default)]
struct RetireCounters {
    recycled: AtomicU64,
    destroyed: AtomicU64,
}

impl RetireCounters {
    fn count(&self, reason: RetireReason, metrics: Option<&Metrics>) {
        if reason.is_recycle() {
            self.recycled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(metrics) = metrics {
            metrics.workers_live.dec();
            metrics
                .workers_recycled
                .with_label_values(&[reason.as_str()])
                .inc();
        }
    }
}

/// Tracks in-flight fetches for graceful shutdown
struct BusyGuard {
    busy: Arc<AtomicUsize>,
    metrics: Option<Metrics>,
}

impl BusyGuard {
    fn new(busy: Arc<AtomicUsize>, peak: &AtomicUsize, metrics: Option<Metrics>) -> Self {
        let now = busy.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        if let Some(metrics) = &metrics {
            metrics.workers_busy.inc();
        }
        Self { busy, metrics }
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics.workers_busy.dec();
        }
    }
}

/// Exclusive hold on a worker during a fetch.
///
/// If the holding task is dropped mid-fetch the browser is closed instead of
/// leaking.
struct WorkerLease {
    worker: Option<BrowserWorker>,
    live: LiveWorkers,
    counters: Arc<RetireCounters>,
    metrics: Option<Metrics>,
}

impl WorkerLease {
    fn new(
        worker: BrowserWorker,
        live: LiveWorkers,
        counters: Arc<RetireCounters>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            worker: Some(worker),
            live,
            counters,
            metrics,
        }
    }

    fn worker_mut(&mut self) -> Option<&mut BrowserWorker> {
        self.worker.as_mut()
    }

    fn release(mut self) -> Option<BrowserWorker> {
        self.worker.take()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            warn!(worker_id = worker.id(), "Fetch abandoned, closing worker");
            lock_live(&self.live).remove(&worker.id());
            self.counters
                .count(RetireReason::Abandoned, self.metrics.as_ref());
            worker.session().close();
        }
    }
}

pub struct WorkerPool {
    engine: Arc<dyn RenderEngine>,
    config: PoolConfig,
    waiter: ChallengeWaiter,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<BrowserWorker>>,
    live: LiveWorkers,
    next_worker_id: AtomicU64,
    busy: Arc<AtomicUsize>,
    peak_busy: AtomicUsize,
    workers_created: AtomicU64,
    retired: Arc<RetireCounters>,
    fetches: AtomicU64,
    // Stops new dispatches
    shutdown: CancellationToken,
    // Aborts in-flight fetches
    kill: CancellationToken,
    metrics: Option<Metrics>,
}

impl WorkerPool {
    pub fn new(
        engine: Arc<dyn RenderEngine>,
        config: PoolConfig,
        waiter: ChallengeWaiter,
        shutdown: CancellationToken,
    ) -> Self {
        info!(
            "Worker pool using engine '{}': max {} worker(s), lifecycle {:?}, memory threshold {} MB",
            engine.name(),
            config.max_workers,
            config.lifecycle,
            config.memory_threshold_mb
        );

        Self {
            engine,
            permits: Arc::new(Semaphore::new(config.max_workers.max(1))),
            config,
            waiter,
            idle: Mutex::new(Vec::new()),
            live: Arc::new(StdMutex::new(HashMap::new())),
            next_worker_id: AtomicU64::new(1),
            busy: Arc::new(AtomicUsize::new(0)),
            peak_busy: AtomicUsize::new(0),
            workers_created: AtomicU64::new(0),
            retired: Arc::new(RetireCounters::default()),
            fetches: AtomicU64::new(0),
            shutdown,
            kill: CancellationToken::new(),
            metrics: None,
        }
    }

    /// Build a pool from the crawl configuration with the default signatures
    pub fn from_crawl_config(
        engine: Arc<dyn RenderEngine>,
        config: &CrawlConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let waiter = ChallengeWaiter::new(
            ChallengeSignatureRegistry::new(),
            config.turnstile_timeout,
            config.challenge_poll_interval,
        );
        Self::new(engine, PoolConfig::from_crawl_config(config), waiter, shutdown)
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait for a free slot. Slots are granted in request order.
    pub async fn reserve(&self) -> Result<DispatchPermit, PoolError> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(PoolError::ShuttingDown),
            permit = self.permits.clone().acquire_owned() => permit
                .map(|permit| DispatchPermit { _permit: permit })
                .map_err(|_| PoolError::ShuttingDown),
        }
    }

    /// Reserve a slot and fetch `url`
    pub async fn submit(&self, url: &str) -> Result<FetchReport, PoolError> {
        let permit = self.reserve().await?;
        self.dispatch(permit, url).await
    }

    /// Fetch `url` on an idle or freshly created worker
    pub async fn dispatch(&self, permit: DispatchPermit, url: &str) -> Result<FetchReport, PoolError> {
        let _permit = permit;
        if self.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }

        let worker = match self.take_idle().await {
            Some(worker) => worker,
            None => self.spawn_worker().await?,
        };
        debug!(worker_id = worker.id(), url = %url, "Dispatching URL");

        let mut lease = WorkerLease::new(
            worker,
            self.live.clone(),
            self.retired.clone(),
            self.metrics.clone(),
        );
        let report = {
            let _busy = BusyGuard::new(self.busy.clone(), &self.peak_busy, self.metrics.clone());
            match lease.worker_mut() {
                Some(worker) => {
                    worker
                        .fetch(url, &self.config.fetch, &self.waiter, &self.kill)
                        .await
                }
                None => return Err(PoolError::ShuttingDown),
            }
        };
        let Some(worker) = lease.release() else {
            return Err(PoolError::ShuttingDown);
        };

        self.fetches.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            let outcome = report
                .failure_reason()
                .map(|reason| reason.to_string())
                .unwrap_or_else(|| "success".to_string());
            metrics.fetches.with_label_values(&[outcome.as_str()]).inc();
        }

        self.record_footprint(worker.id(), worker.memory_mb());

        match self.disposition(&worker) {
            Disposition::Keep => self.idle.lock().await.push(worker),
            Disposition::Retire(reason) => {
                self.retire(worker, reason).await;
                if reason.is_recycle() && !self.shutdown.is_cancelled() {
                    self.replace_worker().await;
                }
            }
        }

        Ok(report)
    }

    async fn take_idle(&self) -> Option<BrowserWorker> {
        self.idle.lock().await.pop()
    }

    fn record_footprint(&self, worker_id: u64, memory_mb: Option<u64>) {
        if let Some(entry) = lock_live(&self.live).get_mut(&worker_id) {
            entry.memory_mb = memory_mb.unwrap_or(0);
        }
    }

    fn aggregate_memory_mb(&self) -> u64 {
        lock_live(&self.live).values().map(|w| w.memory_mb).sum()
    }

    fn disposition(&self, worker: &BrowserWorker) -> Disposition {
        if worker.is_fatal() {
            return Disposition::Retire(RetireReason::Fatal);
        }
        if self.shutdown.is_cancelled() {
            return Disposition::Retire(RetireReason::Shutdown);
        }

        let threshold = self.config.memory_threshold_mb;
        if let Some(memory_mb) = worker.memory_mb() {
            if memory_mb > threshold {
                warn!(
                    worker_id = worker.id(),
                    "Worker footprint {} MB exceeds {} MB, recycling",
                    memory_mb,
                    threshold
                );
                return Disposition::Retire(RetireReason::MemoryExceeded);
            }
        }

        let aggregate = self.aggregate_memory_mb();
        if aggregate > threshold {
            warn!(
                worker_id = worker.id(),
                "Aggregate footprint {} MB exceeds {} MB, recycling",
                aggregate,
                threshold
            );
            return Disposition::Retire(RetireReason::AggregateMemoryExceeded);
        }

        if self.config.lifecycle == WorkerLifecycle::AlwaysNew {
            return Disposition::Retire(RetireReason::AlwaysNew);
        }

        let limit = self.config.max_fetches_per_worker;
        if limit > 0 && worker.fetches() >= limit {
            return Disposition::Retire(RetireReason::FetchLimit);
        }

        Disposition::Keep
    }

    async fn retire(&self, worker: BrowserWorker, reason: RetireReason) {
        let worker_id = worker.id();
        info!(
            worker_id,
            reason = reason.as_str(),
            "Retiring worker after {} fetch(es)",
            worker.fetches()
        );

        lock_live(&self.live).remove(&worker_id);
        self.retired.count(reason, self.metrics.as_ref());

        worker.destroy().await;
    }

    /// Start a fresh worker in place of a recycled one
    async fn replace_worker(&self) {
        match self.spawn_worker().await {
            Ok(worker) => self.idle.lock().await.push(worker),
            Err(e) => warn!("Replacement worker not started, next dispatch will retry: {}", e),
        }
    }

    async fn spawn_worker(&self) -> Result<BrowserWorker, PoolError> {
        let attempts = self.config.worker_create_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if self.shutdown.is_cancelled() {
                return Err(PoolError::ShuttingDown);
            }

            let worker_id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
            match BrowserWorker::create(
                self.engine.clone(),
                worker_id,
                self.config.worker_create_timeout,
            )
            .await
            {
                Ok(worker) => {
                    lock_live(&self.live).insert(
                        worker_id,
                        LiveWorker {
                            session: worker.session().clone(),
                            memory_mb: 0,
                        },
                    );
                    self.workers_created.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.workers_created.inc();
                        metrics.workers_live.inc();
                    }
                    return Ok(worker);
                }
                Err(e) => {
                    warn!(
                        worker_id,
                        "Worker creation attempt {}/{} failed: {:#}",
                        attempt,
                        attempts,
                        e
                    );
                    last_error = format!("{:#}", e);
                    if attempt < attempts {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return Err(PoolError::ShuttingDown),
                            _ = tokio::time::sleep(self.config.worker_create_backoff * attempt) => {}
                        }
                    }
                }
            }
        }

        error!("Giving up on worker creation after {} attempt(s)", attempts);
        Err(PoolError::WorkerCreation {
            attempts,
            last_error,
        })
    }

    /// Stop dispatching, wait up to `grace` for in-flight fetches, then tear
    /// every worker down.
    pub async fn shutdown(&self, grace: Duration) -> PoolStats {
        self.shutdown.cancel();

        let deadline = Instant::now() + grace;
        loop {
            let remaining = self.busy.load(Ordering::SeqCst);
            if remaining == 0 {
                info!("No fetches in flight");
                break;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                warn!(
                    "Grace period of {:?} elapsed with {} fetch(es) in flight, forcing teardown",
                    grace, remaining
                );
                break;
            }
            info!("Waiting for {} fetch(es) to complete...", remaining);
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL.min(left)).await;
        }

        self.kill.cancel();

        let idle: Vec<BrowserWorker> = self.idle.lock().await.drain(..).collect();
        for worker in idle {
            self.retire(worker, RetireReason::Shutdown).await;
        }

        let stragglers: Vec<(u64, Arc<dyn RenderSession>)> = lock_live(&self.live)
            .drain()
            .map(|(id, worker)| (id, worker.session))
            .collect();
        for (worker_id, session) in stragglers {
            warn!(worker_id, "Force closing worker");
            let _ = tokio::task::spawn_blocking(move || session.close()).await;
        }

        let stats = self.stats().await;
        info!(
            "Worker pool shut down: {} created, {} recycled, {} destroyed, {} fetch(es)",
            stats.workers_created, stats.workers_recycled, stats.workers_destroyed, stats.fetches
        );
        stats
    }

    pub async fn stats(&self) -> PoolStats {
        let idle_workers = self.idle.lock().await.len();
        let (live_workers, aggregate_memory_mb) = {
            let live = lock_live(&self.live);
            (live.len(), live.values().map(|w| w.memory_mb).sum())
        };

        PoolStats {
            live_workers,
            idle_workers,
            busy_workers: self.busy.load(Ordering::SeqCst),
            peak_busy: self.peak_busy.load(Ordering::SeqCst),
            workers_created: self.workers_created.load(Ordering::Relaxed),
            workers_recycled: self.retired.recycled.load(Ordering::Relaxed),
            workers_destroyed: self.retired.destroyed.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            aggregate_memory_mb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedEngine, ScriptedPage};
    use crawl_hive_common::FailureReason;

    const PAGE: &str = "<html><body>Plenty of product detail content</body></html>";

    fn pool_config(max_workers: usize) -> PoolConfig {
        PoolConfig {
            max_workers,
            memory_threshold_mb: 1_000,
            lifecycle: WorkerLifecycle::Reusable,
            max_fetches_per_worker: 0,
            worker_create_attempts: 2,
            worker_create_timeout: Duration::from_secs(1),
            worker_create_backoff: Duration::from_millis(5),
            fetch: FetchSettings {
                navigation_timeout: Duration::from_secs(1),
                request_timeout: Duration::from_secs(5),
                post_challenge_wait: Duration::ZERO,
                min_content_length: 10,
                required_selectors: vec![],
            },
        }
    }

    fn pool(engine: &Arc<ScriptedEngine>, config: PoolConfig) -> Arc<WorkerPool> {
        let waiter = ChallengeWaiter::new(
            ChallengeSignatureRegistry::new(),
            Duration::from_millis(50),
            Duration::from_millis(10),
        );
        Arc::new(WorkerPool::new(
            engine.clone(),
            config,
            waiter,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn test_reuses_idle_worker() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(ScriptedPage::ok(PAGE));
        let pool = pool(&engine, pool_config(2));

        for i in 0..3 {
            let report = pool.submit(&format!("https://example.com/{}", i)).await.unwrap();
            assert!(report.is_success());
        }

        let stats = pool.stats().await;
        assert_eq!(stats.workers_created, 1);
        assert_eq!(stats.fetches, 3);
        assert_eq!(engine.launches(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_max_workers() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(ScriptedPage::ok(PAGE).with_delay(Duration::from_millis(20)));
        let pool = pool(&engine, pool_config(2));

        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.submit(&format!("https://example.com/{}", i)).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_success());
        }

        let stats = pool.stats().await;
        assert!(stats.peak_busy <= 2);
        assert!(engine.peak_active_sessions() <= 2);
        assert_eq!(stats.fetches, 8);
    }

    #[tokio::test]
    async fn test_memory_threshold_recycles_worker() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(ScriptedPage::ok(PAGE).with_memory(2_000));
        let pool = pool(&engine, pool_config(1));

        let report = pool.submit("https://example.com/heavy").await.unwrap();
        assert!(report.is_success());

        let stats = pool.stats().await;
        assert_eq!(stats.workers_recycled, 1);
        assert_eq!(stats.workers_created, 2);
        assert_eq!(stats.live_workers, 1);
        assert_eq!(engine.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_footprint_recycles_worker() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.script(
            "https://example.com/fast",
            ScriptedPage::ok(PAGE)
                .with_memory(600)
                .with_delay(Duration::from_millis(20)),
        );
        engine.script(
            "https://example.com/slow",
            ScriptedPage::ok(PAGE)
                .with_memory(600)
                .with_delay(Duration::from_millis(150)),
        );
        let metrics = Metrics::new().unwrap();
        let pool = Arc::new(
            WorkerPool::new(
                engine.clone(),
                pool_config(2),
                ChallengeWaiter::new(
                    ChallengeSignatureRegistry::new(),
                    Duration::from_millis(50),
                    Duration::from_millis(10),
                ),
                CancellationToken::new(),
            )
            .with_metrics(metrics.clone()),
        );

        let fast = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit("https://example.com/fast").await })
        };
        let slow = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit("https://example.com/slow").await })
        };
        assert!(fast.await.unwrap().unwrap().is_success());
        assert!(slow.await.unwrap().unwrap().is_success());

        let stats = pool.stats().await;
        assert_eq!(stats.workers_recycled, 1);
        assert_eq!(stats.workers_created, 3);
        assert_eq!(stats.live_workers, 2);
        assert_eq!(stats.aggregate_memory_mb, 600);
        assert_eq!(
            metrics
                .workers_recycled
                .with_label_values(&["aggregate_memory_exceeded"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .workers_recycled
                .with_label_values(&["memory_exceeded"])
                .get(),
            0
        );
    }

    #[tokio::test]
    async fn test_abandoned_fetch_updates_accounting() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(ScriptedPage::ok(PAGE).with_delay(Duration::from_secs(2)));
        let metrics = Metrics::new().unwrap();
        let pool = Arc::new(
            WorkerPool::new(
                engine.clone(),
                pool_config(1),
                ChallengeWaiter::new(
                    ChallengeSignatureRegistry::new(),
                    Duration::from_millis(50),
                    Duration::from_millis(10),
                ),
                CancellationToken::new(),
            )
            .with_metrics(metrics.clone()),
        );

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), pool.submit("https://example.com/a"))
                .await;
        assert!(abandoned.is_err());

        let stats = pool.stats().await;
        assert_eq!(stats.live_workers, 0);
        assert_eq!(stats.workers_destroyed, 1);
        assert_eq!(metrics.workers_live.get(), 0);
        assert_eq!(metrics.workers_busy.get(), 0);
        assert_eq!(engine.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn test_always_new_lifecycle() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(ScriptedPage::ok(PAGE));
        let mut config = pool_config(1);
        config.lifecycle = WorkerLifecycle::AlwaysNew;
        let pool = pool(&engine, config);

        pool.submit("https://example.com/a").await.unwrap();
        pool.submit("https://example.com/b").await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.workers_recycled, 2);
        assert_eq!(stats.workers_created, 3);
    }

    #[tokio::test]
    async fn test_fatal_worker_is_destroyed_not_reused() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.script("https://example.com/crash", ScriptedPage::crash());
        engine.set_default(ScriptedPage::ok(PAGE));
        let pool = pool(&engine, pool_config(1));

        let report = pool.submit("https://example.com/crash").await.unwrap();
        assert_eq!(report.failure_reason(), Some(FailureReason::WorkerCrash));

        let report = pool.submit("https://example.com/ok").await.unwrap();
        assert!(report.is_success());
        assert_ne!(report.worker_id, 1);

        let stats = pool.stats().await;
        assert_eq!(stats.workers_destroyed, 1);
        assert_eq!(stats.workers_created, 2);
    }

    #[tokio::test]
    async fn test_worker_creation_retries_then_fails() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.fail_next_launches(5);
        let pool = pool(&engine, pool_config(1));

        let err = pool.submit("https://example.com/a").await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerCreation { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_worker_creation_recovers_on_retry() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(ScriptedPage::ok(PAGE));
        engine.fail_next_launches(1);
        let pool = pool(&engine, pool_config(1));

        assert!(pool.submit("https://example.com/a").await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work_and_closes_workers() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(ScriptedPage::ok(PAGE));
        let pool = pool(&engine, pool_config(2));

        pool.submit("https://example.com/a").await.unwrap();
        let stats = pool.shutdown(Duration::from_millis(100)).await;

        assert_eq!(stats.live_workers, 0);
        assert_eq!(engine.closed_sessions(), 1);
        assert!(matches!(
            pool.submit("https://example.com/b").await,
            Err(PoolError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_grace_forces_teardown() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.set_default(ScriptedPage::ok(PAGE).with_delay(Duration::from_secs(2)));
        let pool = pool(&engine, pool_config(1));

        let in_flight = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit("https://example.com/slow").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        pool.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        let report = in_flight.await.unwrap().unwrap();
        assert_eq!(report.failure_reason(), Some(FailureReason::Cancelled));
    }
}
