mod failure_log;
mod input;
mod ledger;
mod orchestrator;
mod output;
mod stats;

pub use failure_log::{FailureEntry, FailureLog};
pub use input::{parse_targets, read_targets, TargetList};
pub use ledger::{
    Ledger, LedgerCounts, LedgerError, LoadReport, RecordUpdate, LEDGER_VERSION,
    LEDGER_WRITE_ATTEMPTS,
};
pub use orchestrator::{retry_delay, Orchestrator};
pub use output::{ArtifactWriter, FsArtifactWriter};
pub use stats::{spawn_aggregator, CrawlSummary, StatsEvent, StatsHandle};

use anyhow::Result;
use crawl_hive_common::CrawlConfig;
use crawl_hive_worker::{Metrics, RenderEngine, WorkerPool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run a full crawl with the given engine
///
/// This is the main entry point. The input list is read from
/// `config.input_file`, artifacts go to `config.output_dir`, and the run
/// stops early when `shutdown` is cancelled.
///
/// # Example
///
/// ```rust,ignore
/// use crawl_hive_orchestrator::run_crawl;
/// use crawl_hive_worker::{ChromeEngine, ChromeEngineConfig, providers::NoProxyProvider};
///
/// let config = CrawlConfig::default();
/// let engine = ChromeEngine::new(ChromeEngineConfig::from_crawl_config(&config, Box::new(NoProxyProvider)));
/// let summary = run_crawl(config, Arc::new(engine), CancellationToken::new(), None).await?;
/// ```
pub async fn run_crawl(
    config: CrawlConfig,
    engine: Arc<dyn RenderEngine>,
    shutdown: CancellationToken,
    metrics: Option<Metrics>,
) -> Result<CrawlSummary> {
    let config = config.sanitized();
    info!(
        "Starting crawl of {} (output: {}, ledger: {})",
        config.input_file.display(),
        config.output_dir.display(),
        config.ledger_path().display()
    );

    let list = read_targets(
        &config.input_file,
        &config.category_prefixes,
        config.max_total_urls,
    )?;
    let ledger = Ledger::load(config.ledger_path());

    let mut pool = WorkerPool::from_crawl_config(engine, &config, shutdown.clone());
    if let Some(metrics) = &metrics {
        pool = pool.with_metrics(metrics.clone());
    }

    let writer = Arc::new(FsArtifactWriter::new(&config.output_dir));
    let mut orchestrator = Orchestrator::new(config, Arc::new(pool), ledger, writer, shutdown);
    if let Some(metrics) = metrics {
        orchestrator = orchestrator.with_metrics(metrics);
    }

    orchestrator.run(list.targets).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawl_hive_common::TargetUrl;
    use crawl_hive_worker::testing::ScriptedEngine;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_crawl_from_input_file() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("urls.txt");
        std::fs::write(
            &input,
            "# batch\nhttps://example.com/car-specs/bmw/1/m3\nhttps://example.com/car-specs/bmw/1/m3\nbogus\n",
        )
        .unwrap();

        let config = CrawlConfig {
            input_file: input,
            output_dir: dir.path().join("output"),
            failure_log_path: dir.path().join("failures.jsonl"),
            batch_delay: Duration::ZERO,
            url_delay: Duration::ZERO,
            ..CrawlConfig::default()
        };
        let engine = Arc::new(ScriptedEngine::new());

        let summary = run_crawl(config, engine.clone(), CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(summary.total_targets, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(engine.navigations().len(), 1);
        let target = TargetUrl::parse(
            "https://example.com/car-specs/bmw/1/m3",
            &CrawlConfig::default().category_prefixes,
        )
        .unwrap();
        assert!(dir
            .path()
            .join("output")
            .join("bmw")
            .join(target.artifact_name())
            .exists());
        assert!(dir.path().join("output").join("progress.json").exists());
    }
}
