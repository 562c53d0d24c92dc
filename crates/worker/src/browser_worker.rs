use crate::challenge::{ChallengeError, ChallengePhase, ChallengeReport, ChallengeWaiter};
use crate::engine::{EngineError, RenderEngine, RenderSession};
use anyhow::{Context, Result};
use crawl_hive_common::{CrawlConfig, FailureReason};
use scraper::{Html, Selector};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SETTLE_SLICE: Duration = Duration::from_millis(50);

/// Per-fetch limits and content expectations
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub navigation_timeout: Duration,
    /// Hard cap for the whole fetch; the browser is closed when it fires
    pub request_timeout: Duration,
    /// Settle time after a resolved challenge before content is read
    pub post_challenge_wait: Duration,
    pub min_content_length: usize,
    pub required_selectors: Vec<String>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self::from_config(&CrawlConfig::default())
    }
}

impl FetchSettings {
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self {
            navigation_timeout: config.navigation_timeout,
            request_timeout: config.request_timeout,
            post_challenge_wait: config.post_challenge_wait,
            min_content_length: config.min_content_length,
            required_selectors: config.required_selectors.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub reason: FailureReason,
    pub details: String,
}

impl FetchFailure {
    pub fn new(reason: FailureReason, details: impl Into<String>) -> Self {
        Self {
            reason,
            details: details.into(),
        }
    }
}

impl From<EngineError> for FetchFailure {
    fn from(error: EngineError) -> Self {
        let reason = match &error {
            EngineError::Timeout(_) => FailureReason::NavigationTimeout,
            EngineError::Crashed(_) | EngineError::Other(_) => FailureReason::WorkerCrash,
            EngineError::Navigation(_) => FailureReason::NavigationError,
        };
        Self::new(reason, error.to_string())
    }
}

/// What a single fetch produced
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub url: String,
    pub worker_id: u64,
    /// Raw page content on success
    pub outcome: Result<String, FetchFailure>,
    pub status: Option<u16>,
    pub challenge: Option<ChallengeReport>,
    /// Footprint sampled after the fetch
    pub memory_mb: Option<u64>,
    pub elapsed: Duration,
}

impl FetchReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.outcome.as_ref().err().map(|f| f.reason)
    }
}

/// Result of the blocking part of a fetch
struct PageResult {
    outcome: Result<String, FetchFailure>,
    status: Option<u16>,
    challenge: Option<ChallengeReport>,
}

impl PageResult {
    fn failed(
        failure: FetchFailure,
        status: Option<u16>,
        challenge: Option<ChallengeReport>,
    ) -> Self {
        Self {
            outcome: Err(failure),
            status,
            challenge,
        }
    }
}

/// One disposable browser instance.
///
/// Owned by exactly one task at a time. After a failure that poisons the
/// worker it is never handed another URL.
pub struct BrowserWorker {
    id: u64,
    session: Arc<dyn RenderSession>,
    created_at: Instant,
    fetches: u64,
    memory_mb: Option<u64>,
    fatal: bool,
}

impl BrowserWorker {
    /// Launch a browser; bounded by `timeout`
    pub async fn create(engine: Arc<dyn RenderEngine>, id: u64, timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        let launch = tokio::task::spawn_blocking(move || engine.launch(id));

        let session = tokio::time::timeout(timeout, launch)
            .await
            .map_err(|_| anyhow::anyhow!("browser launch timed out after {:?}", timeout))?
            .context("browser launch task panicked")??;

        info!(worker_id = id, "Worker created in {}ms", start.elapsed().as_millis());

        Ok(Self {
            id,
            session,
            created_at: Instant::now(),
            fetches: 0,
            memory_mb: None,
            fatal: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fetches(&self) -> u64 {
        self.fetches
    }

    pub fn memory_mb(&self) -> Option<u64> {
        self.memory_mb
    }

    /// Set once a fetch failed in a way that leaves the browser unusable
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn session(&self) -> &Arc<dyn RenderSession> {
        &self.session
    }

    /// Navigate, wait out any challenge, validate and return the page content.
    ///
    /// Never fails: every error is folded into the report. `kill` aborts the
    /// fetch by closing the browser.
    pub async fn fetch(
        &mut self,
        url: &str,
        settings: &FetchSettings,
        waiter: &ChallengeWaiter,
        kill: &CancellationToken,
    ) -> FetchReport {
        let start = Instant::now();
        self.fetches += 1;
        debug!(worker_id = self.id, url = %url, "Fetch #{} started", self.fetches);

        let session = self.session.clone();
        let owned_url = url.to_string();
        let owned_settings = settings.clone();
        let owned_waiter = waiter.clone();
        let owned_kill = kill.clone();
        let page_task = tokio::task::spawn_blocking(move || {
            load_page(
                session.as_ref(),
                &owned_url,
                &owned_settings,
                &owned_waiter,
                &owned_kill,
            )
        });

        let page = tokio::select! {
            biased;
            joined = page_task => match joined {
                Ok(page) => page,
                Err(e) => PageResult::failed(
                    FetchFailure::new(FailureReason::WorkerCrash, format!("fetch task failed: {}", e)),
                    None,
                    None,
                ),
            },
            _ = kill.cancelled() => {
                self.session.close();
                PageResult::failed(
                    FetchFailure::new(FailureReason::Cancelled, "worker torn down by shutdown"),
                    None,
                    None,
                )
            }
            _ = tokio::time::sleep(settings.request_timeout) => {
                warn!(
                    worker_id = self.id,
                    url = %url,
                    "Fetch hard timeout after {:?} - closing browser to abort",
                    settings.request_timeout
                );
                self.session.close();
                PageResult::failed(
                    FetchFailure::new(
                        FailureReason::NavigationTimeout,
                        format!("hard timeout after {:?}", settings.request_timeout),
                    ),
                    None,
                    None,
                )
            }
        };

        if let Err(failure) = &page.outcome {
            if failure.reason.poisons_worker() {
                self.fatal = true;
            }
        }

        self.memory_mb = if self.fatal {
            None
        } else {
            let session = self.session.clone();
            tokio::task::spawn_blocking(move || session.resident_memory_mb())
                .await
                .ok()
                .flatten()
        };

        match &page.outcome {
            Ok(content) => debug!(
                worker_id = self.id,
                url = %url,
                "Fetch succeeded ({} bytes, {}ms, {:?} MB)",
                content.len(),
                start.elapsed().as_millis(),
                self.memory_mb
            ),
            Err(failure) => warn!(
                worker_id = self.id,
                url = %url,
                "Fetch failed: {} ({})",
                failure.reason,
                failure.details
            ),
        }

        FetchReport {
            url: url.to_string(),
            worker_id: self.id,
            outcome: page.outcome,
            status: page.status,
            challenge: page.challenge,
            memory_mb: self.memory_mb,
            elapsed: start.elapsed(),
        }
    }

    /// Close the browser and log the filter totals
    pub async fn destroy(self) {
        let (allowed, blocked) = self.session.filter_counts();
        let session = self.session;
        let _ = tokio::task::spawn_blocking(move || session.close()).await;
        info!(
            worker_id = self.id,
            "Worker destroyed after {} fetch(es), {:?} old (requests allowed: {}, blocked: {})",
            self.fetches,
            self.created_at.elapsed(),
            allowed,
            blocked
        );
    }
}

/// Blocking page pipeline: navigate, challenge wait, content checks
fn load_page(
    session: &dyn RenderSession,
    url: &str,
    settings: &FetchSettings,
    waiter: &ChallengeWaiter,
    kill: &CancellationToken,
) -> PageResult {
    let navigation = match session.navigate(url, settings.navigation_timeout) {
        Ok(navigation) => navigation,
        Err(e) => return PageResult::failed(e.into(), None, None),
    };
    let status = navigation.status;

    let challenge = match waiter.run(session, url, kill) {
        Ok(report) => report,
        Err(ChallengeError::Cancelled) => {
            return PageResult::failed(
                FetchFailure::new(FailureReason::Cancelled, "challenge wait cancelled"),
                status,
                None,
            )
        }
        Err(ChallengeError::Engine(e)) => return PageResult::failed(e.into(), status, None),
    };

    match challenge.phase {
        ChallengePhase::TimedOut => {
            let details = format!(
                "challenge '{}' unresolved after {:?}",
                challenge.signature.as_deref().unwrap_or("unknown"),
                challenge.elapsed
            );
            return PageResult::failed(
                FetchFailure::new(FailureReason::ChallengeTimeout, details),
                status,
                Some(challenge),
            );
        }
        ChallengePhase::Resolved if !settle(settings.post_challenge_wait, kill) => {
            return PageResult::failed(
                FetchFailure::new(FailureReason::Cancelled, "post-challenge wait cancelled"),
                status,
                Some(challenge),
            );
        }
        _ => {}
    }

    if !challenge.detected() {
        if let Some(code) = status.filter(|code| *code >= 400) {
            return PageResult::failed(
                FetchFailure::new(FailureReason::HttpError, format!("HTTP {}", code)),
                status,
                Some(challenge),
            );
        }
    }

    let page = match session.snapshot() {
        Ok(page) => page,
        Err(e) => return PageResult::failed(e.into(), status, Some(challenge)),
    };

    if let Err(details) = check_content(&page.markup, settings) {
        return PageResult::failed(
            FetchFailure::new(FailureReason::ExtractionError, details),
            status,
            Some(challenge),
        );
    }

    PageResult {
        outcome: Ok(page.markup),
        status,
        challenge: Some(challenge),
    }
}

/// Sleep for `duration` in slices; false if `kill` fired first
fn settle(duration: Duration, kill: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if kill.is_cancelled() {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        sleep(SETTLE_SLICE.min(left));
    }
}

/// Verify the final page carries the expected content
pub fn check_content(markup: &str, settings: &FetchSettings) -> Result<(), String> {
    let length = markup.trim().len();
    if length < settings.min_content_length {
        return Err(format!(
            "content length {} below minimum {}",
            length, settings.min_content_length
        ));
    }

    if settings.required_selectors.is_empty() {
        return Ok(());
    }

    let document = Html::parse_document(markup);
    let mut missing = Vec::new();
    for raw in &settings.required_selectors {
        let selector =
            Selector::parse(raw).map_err(|e| format!("invalid selector '{}': {:?}", raw, e))?;
        if document.select(&selector).next().is_none() {
            missing.push(raw.as_str());
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("missing required elements: {}", missing.join(", ")))
    }
}
