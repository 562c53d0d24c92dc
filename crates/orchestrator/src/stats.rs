//! Run statistics.
//!
//! Completed fetches report through a channel to a single aggregator task;
//! nothing else mutates the counters.

use crawl_hive_common::FailureReason;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum StatsEvent {
    Skipped,
    /// A fetch was handed to the pool; `retry` for every dispatch after the first
    Dispatched { retry: bool },
    Succeeded,
    Failed(FailureReason),
    /// Left unfinished by shutdown
    Interrupted,
    BatchCompleted { batch: usize, batches: usize },
}

/// Cloneable sender side of the aggregator
#[derive(Debug, Clone)]
pub struct StatsHandle {
    sender: mpsc::UnboundedSender<StatsEvent>,
}

impl StatsHandle {
    pub fn send(&self, event: StatsEvent) {
        // The aggregator only stops once every handle is gone
        let _ = self.sender.send(event);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CrawlSummary {
    pub run_id: String,
    pub total_targets: usize,
    /// URLs that reached a terminal status in this run
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub interrupted: usize,
    pub dispatches: usize,
    pub retried: usize,
    pub workers_created: u64,
    pub workers_recycled: u64,
    pub failures_by_reason: BTreeMap<String, usize>,
    pub success_rate: f64,
    pub urls_per_minute: f64,
    pub elapsed_secs: f64,
    pub aborted: bool,
}

impl CrawlSummary {
    fn finish(&mut self, elapsed: Duration) {
        self.processed = self.succeeded + self.failed;
        self.success_rate = if self.processed == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.processed as f64 * 100.0
        };
        self.elapsed_secs = elapsed.as_secs_f64();
        let minutes = elapsed.as_secs_f64() / 60.0;
        self.urls_per_minute = if minutes > 0.0 {
            self.processed as f64 / minutes
        } else {
            0.0
        };
    }

    fn apply(&mut self, event: &StatsEvent) {
        match event {
            StatsEvent::Skipped => self.skipped += 1,
            StatsEvent::Dispatched { retry } => {
                self.dispatches += 1;
                if *retry {
                    self.retried += 1;
                }
            }
            StatsEvent::Succeeded => self.succeeded += 1,
            StatsEvent::Failed(reason) => {
                self.failed += 1;
                *self.failures_by_reason.entry(reason.to_string()).or_default() += 1;
            }
            StatsEvent::Interrupted => self.interrupted += 1,
            StatsEvent::BatchCompleted { .. } => {}
        }
    }
}

impl fmt::Display for CrawlSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} target(s): {} succeeded, {} failed, {} skipped, {} interrupted ({} dispatches, {} retries, {} workers recycled) - {:.1}% success, {:.1} URLs/min in {:.1}s{}",
            self.total_targets,
            self.succeeded,
            self.failed,
            self.skipped,
            self.interrupted,
            self.dispatches,
            self.retried,
            self.workers_recycled,
            self.success_rate,
            self.urls_per_minute,
            self.elapsed_secs,
            if self.aborted { " [aborted]" } else { "" }
        )
    }
}

/// Start the aggregator. It returns the summary once every handle is dropped.
pub fn spawn_aggregator(run_id: String, total_targets: usize) -> (StatsHandle, JoinHandle<CrawlSummary>) {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let started = Instant::now();

    let task = tokio::spawn(async move {
        let mut summary = CrawlSummary {
            run_id,
            total_targets,
            ..Default::default()
        };

        while let Some(event) = receiver.recv().await {
            summary.apply(&event);
            if let StatsEvent::BatchCompleted { batch, batches } = event {
                let mut progress = summary.clone();
                progress.finish(started.elapsed());
                info!(
                    run_id = %progress.run_id,
                    "Batch {}/{} done: {} succeeded, {} failed, {} skipped, {:.1}% success, {:.1} URLs/min",
                    batch,
                    batches,
                    progress.succeeded,
                    progress.failed,
                    progress.skipped,
                    progress.success_rate,
                    progress.urls_per_minute
                );
            }
        }

        summary.finish(started.elapsed());
        summary
    });

    (StatsHandle { sender }, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_aggregates_events_from_many_senders() {
        let (handle, task) = spawn_aggregator("run".to_string(), 4);

        let mut senders = Vec::new();
        for i in 0..3 {
            let handle = handle.clone();
            senders.push(tokio::spawn(async move {
                handle.send(StatsEvent::Dispatched { retry: false });
                if i == 0 {
                    handle.send(StatsEvent::Dispatched { retry: true });
                    handle.send(StatsEvent::Failed(FailureReason::WorkerCrash));
                } else {
                    handle.send(StatsEvent::Succeeded);
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }
        handle.send(StatsEvent::Skipped);
        handle.send(StatsEvent::BatchCompleted { batch: 1, batches: 1 });
        drop(handle);

        let summary = task.await.unwrap();
        assert_eq!(summary.dispatches, 4);
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failures_by_reason.get("worker_crash"), Some(&1));
        assert!((summary.success_rate - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_display_mentions_counts() {
        let summary = CrawlSummary {
            total_targets: 5,
            succeeded: 3,
            skipped: 2,
            ..Default::default()
        };
        let text = summary.to_string();
        assert!(text.contains("3 succeeded"));
        assert!(text.contains("2 skipped"));
    }
}
