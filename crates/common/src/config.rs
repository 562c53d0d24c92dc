use crate::resource_filter::ResourcePolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Upper bound for the browser concurrency cap
pub const MAX_BROWSERS_LIMIT: usize = 20;
/// Upper bound for URLs per batch
pub const MAX_BATCH_SIZE: usize = 100;
/// Memory threshold bounds (MB)
pub const MIN_MEMORY_THRESHOLD_MB: u64 = 1_000;
pub const MAX_MEMORY_THRESHOLD_MB: u64 = 65_536;

/// Crawl configuration consumed by the orchestrator, pool and workers.
///
/// The core never prompts for anything: the binary builds this from
/// environment variables, tests build it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    /// Defaults to `<output_dir>/progress.json` when unset
    pub ledger_path: Option<PathBuf>,
    pub failure_log_path: PathBuf,

    /// Concurrency cap: number of browser workers alive at once
    pub max_browsers: usize,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub batch_delay: Duration,
    /// Pause between two submissions inside a batch
    #[serde(with = "humantime_serde")]
    pub url_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub navigation_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub turnstile_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub challenge_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub post_challenge_wait: Duration,

    pub memory_threshold_mb: u64,
    /// Dispatches allowed per URL within one run
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_backoff_max: Duration,

    pub force_recrawl: bool,
    pub max_total_urls: usize,
    pub min_content_length: usize,
    /// CSS selectors that must all match the final page
    pub required_selectors: Vec<String>,
    /// Path prefixes whose next segment is used as the output category
    pub category_prefixes: Vec<String>,
    pub resource_policy: ResourcePolicy,

    pub headless: bool,
    pub browser_path: Option<PathBuf>,
    pub worker_lifecycle: WorkerLifecycle,
    /// 0 disables the fetch-count recycle trigger
    pub max_fetches_per_worker: u64,
    pub worker_create_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub worker_create_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            input_file: PathBuf::from("urls.txt"),
            output_dir: PathBuf::from("output"),
            ledger_path: None,
            failure_log_path: PathBuf::from("logs/failure_reasons.jsonl"),
            max_browsers: 2,
            batch_size: 10,
            batch_delay: Duration::from_secs(2),
            url_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(120),
            navigation_timeout: Duration::from_secs(60),
            turnstile_timeout: Duration::from_secs(20),
            challenge_poll_interval: Duration::from_millis(500),
            post_challenge_wait: Duration::from_secs(4),
            memory_threshold_mb: 49_152,
            max_attempts: 2,
            retry_backoff: Duration::from_secs(2),
            retry_backoff_max: Duration::from_secs(10),
            force_recrawl: false,
            max_total_urls: 50_000,
            min_content_length: 50,
            required_selectors: Vec::new(),
            category_prefixes: vec!["car-specs".to_string(), "motorcycles-specs".to_string()],
            resource_policy: ResourcePolicy::default(),
            headless: true,
            browser_path: None,
            worker_lifecycle: WorkerLifecycle::default(),
            max_fetches_per_worker: 0,
            worker_create_attempts: 3,
            worker_create_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            metrics_port: None,
        }
    }
}

impl CrawlConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join("progress.json"))
    }

    /// Clamp operator-supplied values into their supported ranges.
    ///
    /// Every adjusted field is logged at warn level.
    pub fn sanitized(mut self) -> Self {
        self.max_browsers = clamp_logged("max_browsers", self.max_browsers, 1, MAX_BROWSERS_LIMIT);
        self.batch_size = clamp_logged("batch_size", self.batch_size, 1, MAX_BATCH_SIZE);
        self.memory_threshold_mb = clamp_logged(
            "memory_threshold_mb",
            self.memory_threshold_mb,
            MIN_MEMORY_THRESHOLD_MB,
            MAX_MEMORY_THRESHOLD_MB,
        );
        self.max_attempts = clamp_logged("max_attempts", self.max_attempts, 1, u32::MAX);
        self.worker_create_attempts = clamp_logged(
            "worker_create_attempts",
            self.worker_create_attempts,
            1,
            u32::MAX,
        );
        if self.challenge_poll_interval.is_zero() {
            warn!("challenge_poll_interval must be positive, using 500ms");
            self.challenge_poll_interval = Duration::from_millis(500);
        }
        if self.retry_backoff_max < self.retry_backoff {
            warn!(
                "retry_backoff_max ({:?}) is below retry_backoff ({:?}), raising it",
                self.retry_backoff_max, self.retry_backoff
            );
            self.retry_backoff_max = self.retry_backoff;
        }
        self
    }
}

fn clamp_logged<T: PartialOrd + Copy + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> T {
    let clamped = if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    };
    if clamped != value {
        warn!("{} = {} is out of range [{}, {}], using {}", name, value, min, max, clamped);
    }
    clamped
}

/// Controls when a browser worker is replaced.
///
/// | Mode | Behavior |
/// |------|----------|
/// | `AlwaysNew` | Fresh browser per fetch, destroyed after |
/// | `Reusable` | Kept until memory, fetch-count or fatal error forces a recycle |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLifecycle {
    AlwaysNew,
    #[default]
    Reusable,
}

impl FromStr for WorkerLifecycle {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always_new" => Ok(Self::AlwaysNew),
            "reusable" => Ok(Self::Reusable),
            _ => Err(()),
        }
    }
}
