// crawl-hive binary
//
// Reads configuration from the environment, launches Chrome workers and
// crawls the URL list until done or until Ctrl+C / SIGTERM.

use anyhow::Result;
use crawl_hive_common::{CrawlConfig, ResourcePolicy};
use crawl_hive_orchestrator::run_crawl;
use crawl_hive_worker::{providers, ChromeEngine, ChromeEngineConfig, Metrics};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

async fn shutdown_signal(cancellation_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C signal");
        },
        _ = terminate => {
            warn!("Received SIGTERM signal");
        },
        _ = cancellation_token.cancelled() => return,
    }

    info!("Stopping dispatch, in-flight fetches get the shutdown grace period...");
    cancellation_token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let level = env::var("CRAWL_LOG_LEVEL")
        .ok()
        .and_then(|v| Level::from_str(&v).ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config_from_env();
    let proxy_provider = providers::create_from_env()?;
    info!("Using proxy provider: {}", proxy_provider.name());

    let engine = ChromeEngine::new(ChromeEngineConfig::from_crawl_config(
        &config,
        proxy_provider,
    ));

    let cancellation_token = CancellationToken::new();
    let signal_handle = tokio::spawn(shutdown_signal(cancellation_token.clone()));

    let metrics = match config.metrics_port {
        Some(port) => {
            let metrics = Metrics::new()?;
            let server = metrics.clone();
            tokio::spawn(async move {
                if let Err(e) = server.start_server(port).await {
                    error!("Metrics server error: {}", e);
                }
            });
            Some(metrics)
        }
        None => None,
    };

    let result = run_crawl(config, Arc::new(engine), cancellation_token.clone(), metrics).await;

    // Release the signal listener
    cancellation_token.cancel();
    let _ = signal_handle.await;

    let summary = result?;
    if summary.interrupted > 0 {
        warn!(
            "{} URL(s) left unfinished, rerun to resume",
            summary.interrupted
        );
    }
    info!("Crawl complete");
    Ok(())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Accepts humantime ("90s", "500ms", "2m") or plain seconds
fn env_duration(name: &str) -> Option<Duration> {
    let raw = env::var(name).ok()?;
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }
    match humantime_serde::re::humantime::parse_duration(raw) {
        Ok(duration) => Some(duration),
        Err(e) => {
            warn!("Ignoring {}='{}': {}", name, raw, e);
            None
        }
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn load_config_from_env() -> CrawlConfig {
    let defaults = CrawlConfig::default();

    let resource_policy = ResourcePolicy {
        allow_patterns: env_list("CRAWL_ALLOW_PATTERNS")
            .unwrap_or(defaults.resource_policy.allow_patterns.clone()),
        block_patterns: env_list("CRAWL_BLOCK_PATTERNS")
            .unwrap_or(defaults.resource_policy.block_patterns.clone()),
        ..defaults.resource_policy.clone()
    };

    CrawlConfig {
        input_file: env::var("CRAWL_INPUT_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.input_file),
        output_dir: env::var("CRAWL_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir),
        ledger_path: env::var("CRAWL_LEDGER_PATH").ok().map(PathBuf::from),
        failure_log_path: env::var("CRAWL_FAILURE_LOG")
            .map(PathBuf::from)
            .unwrap_or(defaults.failure_log_path),
        max_browsers: env_parse("CRAWL_MAX_BROWSERS").unwrap_or(defaults.max_browsers),
        batch_size: env_parse("CRAWL_BATCH_SIZE").unwrap_or(defaults.batch_size),
        batch_delay: env_duration("CRAWL_BATCH_DELAY").unwrap_or(defaults.batch_delay),
        url_delay: env_duration("CRAWL_URL_DELAY").unwrap_or(defaults.url_delay),
        request_timeout: env_duration("CRAWL_REQUEST_TIMEOUT").unwrap_or(defaults.request_timeout),
        navigation_timeout: env_duration("CRAWL_NAVIGATION_TIMEOUT")
            .unwrap_or(defaults.navigation_timeout),
        turnstile_timeout: env_duration("CRAWL_TURNSTILE_TIMEOUT")
            .unwrap_or(defaults.turnstile_timeout),
        challenge_poll_interval: env_duration("CRAWL_CHALLENGE_POLL_INTERVAL")
            .unwrap_or(defaults.challenge_poll_interval),
        post_challenge_wait: env_duration("CRAWL_POST_CHALLENGE_WAIT")
            .unwrap_or(defaults.post_challenge_wait),
        memory_threshold_mb: env_parse("CRAWL_MEMORY_THRESHOLD_MB")
            .unwrap_or(defaults.memory_threshold_mb),
        max_attempts: env_parse("CRAWL_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
        retry_backoff: env_duration("CRAWL_RETRY_BACKOFF").unwrap_or(defaults.retry_backoff),
        retry_backoff_max: env_duration("CRAWL_RETRY_BACKOFF_MAX")
            .unwrap_or(defaults.retry_backoff_max),
        force_recrawl: env_parse("CRAWL_FORCE_RECRAWL").unwrap_or(defaults.force_recrawl),
        max_total_urls: env_parse("CRAWL_MAX_TOTAL_URLS").unwrap_or(defaults.max_total_urls),
        min_content_length: env_parse("CRAWL_MIN_CONTENT_LENGTH")
            .unwrap_or(defaults.min_content_length),
        required_selectors: env_list("CRAWL_REQUIRED_SELECTORS")
            .unwrap_or(defaults.required_selectors),
        category_prefixes: env_list("CRAWL_CATEGORY_PREFIXES")
            .unwrap_or(defaults.category_prefixes),
        resource_policy,
        headless: env_parse("CRAWL_HEADLESS").unwrap_or(defaults.headless),
        // Custom browser path (e.g., /usr/bin/brave-browser for Brave)
        browser_path: env::var("CRAWL_BROWSER_PATH").ok().map(PathBuf::from),
        // "always_new" or "reusable"
        worker_lifecycle: env_parse("CRAWL_WORKER_LIFECYCLE").unwrap_or_default(),
        max_fetches_per_worker: env_parse("CRAWL_MAX_FETCHES_PER_WORKER")
            .unwrap_or(defaults.max_fetches_per_worker),
        worker_create_attempts: env_parse("CRAWL_WORKER_CREATE_ATTEMPTS")
            .unwrap_or(defaults.worker_create_attempts),
        worker_create_timeout: env_duration("CRAWL_WORKER_CREATE_TIMEOUT")
            .unwrap_or(defaults.worker_create_timeout),
        shutdown_grace: env_duration("CRAWL_SHUTDOWN_GRACE").unwrap_or(defaults.shutdown_grace),
        metrics_port: env_parse("CRAWL_METRICS_PORT"),
    }
}
