//! Drives a crawl run: partition, batch, dispatch, record.

use crate::failure_log::{FailureEntry, FailureLog};
use crate::ledger::{Ledger, RecordUpdate};
use crate::output::ArtifactWriter;
use crate::stats::{spawn_aggregator, CrawlSummary, StatsEvent, StatsHandle};
use anyhow::{Context, Result};
use chrono::Utc;
use crawl_hive_common::{CrawlConfig, CrawlStatus, FailureReason, TargetUrl};
use crawl_hive_worker::{DispatchPermit, FetchFailure, Metrics, PoolError, WorkerPool};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct Orchestrator {
    config: CrawlConfig,
    pool: Arc<WorkerPool>,
    ledger: Arc<Mutex<Ledger>>,
    writer: Arc<dyn ArtifactWriter>,
    failure_log: FailureLog,
    shutdown: CancellationToken,
    metrics: Option<Metrics>,
    run_id: String,
}

impl Orchestrator {
    /// `shutdown` must be the token the pool was built with
    pub fn new(
        config: CrawlConfig,
        pool: Arc<WorkerPool>,
        ledger: Ledger,
        writer: Arc<dyn ArtifactWriter>,
        shutdown: CancellationToken,
    ) -> Self {
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            failure_log: FailureLog::new(&config.failure_log_path),
            config,
            pool,
            ledger: Arc::new(Mutex::new(ledger)),
            writer,
            shutdown,
            metrics: None,
            run_id,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn ledger(&self) -> Arc<Mutex<Ledger>> {
        self.ledger.clone()
    }

    /// Crawl `targets` to completion or until shutdown.
    ///
    /// The summary is logged on every exit path, including fatal errors.
    pub async fn run(&self, targets: Vec<TargetUrl>) -> Result<CrawlSummary> {
        let (stats, aggregator) = spawn_aggregator(self.run_id.clone(), targets.len());

        let process = self.partition(targets, &stats).await;
        info!(
            run_id = %self.run_id,
            "{} URL(s) to process in batches of {} with {} worker(s)",
            process.len(),
            self.config.batch_size,
            self.config.max_browsers
        );

        let mut started = 0;
        let (outcome, drained) = {
            let batches = self.run_batches(&process, &stats, &mut started);
            tokio::pin!(batches);
            tokio::select! {
                outcome = &mut batches => (outcome, false),
                _ = self.drain_on_shutdown() => (batches.await, true),
            }
        };
        for _ in started..process.len() {
            stats.send(StatsEvent::Interrupted);
        }

        let pool_stats = if drained {
            self.pool.stats().await
        } else {
            self.pool.shutdown(self.config.shutdown_grace).await
        };

        let snapshot = self.ledger.lock().await.snapshot_with_retry().await;
        let outcome = match (outcome, snapshot) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(anyhow::Error::new(e).context("Final ledger snapshot failed")),
            (Ok(()), Ok(())) => Ok(()),
        };

        drop(stats);
        let mut summary = aggregator.await.context("Statistics aggregator failed")?;
        summary.workers_created = pool_stats.workers_created;
        summary.workers_recycled = pool_stats.workers_recycled;
        summary.aborted = outcome.is_err();

        info!(run_id = %self.run_id, "Crawl finished: {}", summary);
        match outcome {
            Ok(()) => Ok(summary),
            Err(e) => {
                error!(run_id = %self.run_id, "Crawl aborted: {:#}", e);
                Err(e)
            }
        }
    }

    /// Once shutdown is requested, give in-flight fetches the grace period and
    /// then tear the pool down so they end as interrupted.
    async fn drain_on_shutdown(&self) {
        self.shutdown.cancelled().await;
        info!(
            run_id = %self.run_id,
            "Shutdown requested, stopping worker pool (grace {:?})",
            self.config.shutdown_grace
        );
        self.pool.shutdown(self.config.shutdown_grace).await;
    }

    /// Drop targets the ledger already records as successful
    async fn partition(&self, targets: Vec<TargetUrl>, stats: &StatsHandle) -> Vec<TargetUrl> {
        let ledger = self.ledger.lock().await;
        let mut process = Vec::with_capacity(targets.len());
        for target in targets {
            let done = ledger.lookup(target.url()) == Some(CrawlStatus::Success);
            if done && !self.config.force_recrawl {
                debug!(url = %target, "Already crawled, skipping");
                stats.send(StatsEvent::Skipped);
                if let Some(metrics) = &self.metrics {
                    metrics.urls_skipped.inc();
                }
                continue;
            }
            process.push(target);
        }
        process
    }

    async fn run_batches(
        &self,
        process: &[TargetUrl],
        stats: &StatsHandle,
        started: &mut usize,
    ) -> Result<()> {
        let batch_size = self.config.batch_size.max(1);
        let batches = process.len().div_ceil(batch_size);

        for (index, batch) in process.chunks(batch_size).enumerate() {
            if self.shutdown.is_cancelled() {
                break;
            }
            info!(
                run_id = %self.run_id,
                "Starting batch {}/{} ({} URL(s))",
                index + 1,
                batches,
                batch.len()
            );

            let mut tasks = JoinSet::new();
            for (position, target) in batch.iter().enumerate() {
                let permit = match self.pool.reserve().await {
                    Ok(permit) => permit,
                    Err(PoolError::ShuttingDown) => break,
                    Err(e) => return Err(e.into()),
                };
                *started += 1;
                tasks.spawn(self.supervised(target.clone(), stats.clone(), permit));

                if position + 1 < batch.len() && !self.pause(self.config.url_delay).await {
                    break;
                }
            }

            let mut fatal = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(run_id = %self.run_id, "Fatal error, stopping the crawl: {:#}", e);
                        self.shutdown.cancel();
                        fatal.get_or_insert(e);
                    }
                    Err(e) => error!(run_id = %self.run_id, "URL supervisor failed: {}", e),
                }
            }

            self.ledger
                .lock()
                .await
                .snapshot_with_retry()
                .await
                .context("Ledger snapshot failed")?;
            stats.send(StatsEvent::BatchCompleted {
                batch: index + 1,
                batches,
            });

            if let Some(e) = fatal {
                return Err(e);
            }
            if index + 1 < batches && !self.pause(self.config.batch_delay).await {
                break;
            }
        }
        Ok(())
    }

    /// Sleep unless shutdown arrives first; false on shutdown
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.shutdown.is_cancelled();
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Run a URL job on its own task so a panic cannot drop the URL silently:
    /// it is reset to pending and counted as interrupted.
    fn supervised(
        &self,
        target: TargetUrl,
        stats: StatsHandle,
        permit: DispatchPermit,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let job = self.job(target.clone(), stats.clone());
        let ledger = self.ledger.clone();
        let run_id = self.run_id.clone();

        async move {
            match tokio::spawn(job.run(permit)).await {
                Ok(result) => result,
                Err(e) => {
                    error!(run_id = %run_id, url = %target, "URL task failed: {}", e);
                    ledger
                        .lock()
                        .await
                        .record(target.url(), RecordUpdate::pending());
                    stats.send(StatsEvent::Interrupted);
                    Ok(())
                }
            }
        }
    }

    fn job(&self, target: TargetUrl, stats: StatsHandle) -> UrlJob {
        UrlJob {
            target,
            pool: self.pool.clone(),
            ledger: self.ledger.clone(),
            writer: self.writer.clone(),
            failure_log: self.failure_log.clone(),
            stats,
            shutdown: self.shutdown.clone(),
            max_attempts: self.config.max_attempts.max(1),
            retry_backoff: self.config.retry_backoff,
            retry_backoff_max: self.config.retry_backoff_max,
        }
    }
}

/// Exponential backoff before dispatch number `attempt + 1`
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor).min(max)
}

/// All dispatches of one URL within a run
struct UrlJob {
    target: TargetUrl,
    pool: Arc<WorkerPool>,
    ledger: Arc<Mutex<Ledger>>,
    writer: Arc<dyn ArtifactWriter>,
    failure_log: FailureLog,
    stats: StatsHandle,
    shutdown: CancellationToken,
    max_attempts: u32,
    retry_backoff: Duration,
    retry_backoff_max: Duration,
}

impl UrlJob {
    async fn run(self, first_permit: DispatchPermit) -> Result<()> {
        let url = self.target.url();
        let mut permit = Some(first_permit);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let dispatch_permit = match permit.take() {
                Some(permit) => permit,
                None => match self.pool.reserve().await {
                    Ok(permit) => permit,
                    Err(PoolError::ShuttingDown) => {
                        self.ledger.lock().await.record(url, RecordUpdate::pending());
                        self.interrupted();
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                },
            };

            self.ledger
                .lock()
                .await
                .record(url, RecordUpdate::in_progress(self.target.category()));
            self.stats.send(StatsEvent::Dispatched { retry: attempt > 1 });
            debug!(url = %url, attempt, "Dispatching");

            let report = match self.pool.dispatch(dispatch_permit, url).await {
                Ok(report) => report,
                Err(PoolError::ShuttingDown) => {
                    self.interrupted();
                    return Ok(());
                }
                Err(e) => {
                    // Not this URL's fault; leave it for the next run
                    self.ledger.lock().await.record(url, RecordUpdate::pending());
                    return Err(e.into());
                }
            };

            let failure = match report.outcome {
                Ok(content) => match self.writer.write(&self.target, &content) {
                    Ok(path) => {
                        let digest = format!("{:x}", Sha256::digest(content.as_bytes()));
                        self.ledger
                            .lock()
                            .await
                            .record(url, RecordUpdate::success(digest));
                        self.stats.send(StatsEvent::Succeeded);
                        info!(
                            url = %url,
                            attempt,
                            worker_id = report.worker_id,
                            "Crawled in {}ms, saved to {}",
                            report.elapsed.as_millis(),
                            path.display()
                        );
                        return Ok(());
                    }
                    Err(e) => FetchFailure::new(FailureReason::OutputError, format!("{:#}", e)),
                },
                Err(failure) => failure,
            };

            if failure.reason == FailureReason::Cancelled {
                self.interrupted();
                return Ok(());
            }

            if !failure.reason.is_retryable() || attempt >= self.max_attempts {
                self.fail(failure).await;
                return Ok(());
            }

            if !self.shutdown.is_cancelled() {
                let delay = retry_delay(attempt, self.retry_backoff, self.retry_backoff_max);
                warn!(
                    url = %url,
                    attempt,
                    "Attempt failed with {} ({}), redispatching in {:?}",
                    failure.reason,
                    failure.details,
                    delay
                );
                self.ledger.lock().await.record(
                    url,
                    RecordUpdate::failed(failure.reason, failure.details.clone()),
                );

                let resumed = tokio::select! {
                    _ = self.shutdown.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                };
                if resumed {
                    continue;
                }
            }

            // Attempts remain; leave the URL for the next run
            self.ledger.lock().await.record(url, RecordUpdate::pending());
            self.interrupted();
            return Ok(());
        }
    }

    /// Record a terminal failure
    async fn fail(&self, failure: FetchFailure) {
        let url = self.target.url();
        let attempts = {
            let mut ledger = self.ledger.lock().await;
            ledger
                .record(
                    url,
                    RecordUpdate::failed(failure.reason, failure.details.clone()),
                )
                .attempt_count
        };
        error!(
            url = %url,
            attempts,
            "Giving up: {} ({})",
            failure.reason,
            failure.details
        );

        let entry = FailureEntry {
            url: url.to_string(),
            reason: failure.reason,
            details: failure.details,
            attempts,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.failure_log.append(&entry) {
            warn!(url = %url, "Failed to write failure log: {:#}", e);
        }
        self.stats.send(StatsEvent::Failed(entry.reason));
    }

    fn interrupted(&self) {
        info!(url = %self.target.url(), "Interrupted by shutdown, will resume next run");
        self.stats.send(StatsEvent::Interrupted);
    }
}
