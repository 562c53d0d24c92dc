use crate::engine::{EngineError, Navigation, RenderEngine, RenderSession};
use crate::telemetry::process_tree_rss_mb;
use anyhow::{Context, Result};
use crawl_hive_common::{
    BrowserBinaryParamsMiddleware, CrawlConfig, DefaultBinaryParamsMiddleware, FilterCounters,
    PageSnapshot, ProxyProvider, ResourceFilterMiddleware, ResourcePolicy, TabInitMiddleware,
    UserAgentOverrideMiddleware,
};
use headless_chrome::browser::tab::Tab;
use headless_chrome::{Browser, LaunchOptions};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reads the main document's status from the Navigation Timing API
const RESPONSE_STATUS_SCRIPT: &str =
    "performance.getEntriesByType('navigation')[0]?.responseStatus || 0";

/// Launch settings for Chrome workers
///
/// Not serializable: the proxy provider and middlewares are trait objects.
#[derive(Clone)]
pub struct ChromeEngineConfig {
    pub headless: bool,
    /// Path to browser binary. If None, uses default Chrome/Chromium auto-detection.
    pub browser_path: Option<PathBuf>,
    pub proxy_provider: Box<dyn ProxyProvider>,
    pub resource_policy: Arc<ResourcePolicy>,
    /// Applied in order before launch
    pub binary_params_middlewares: Vec<Box<dyn BrowserBinaryParamsMiddleware>>,
    /// Applied in order to the worker's tab, after the resource filter and before navigation
    pub tab_init_middlewares: Vec<Box<dyn TabInitMiddleware>>,
}

impl std::fmt::Debug for ChromeEngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let binary_middleware_names: Vec<&str> = self
            .binary_params_middlewares
            .iter()
            .map(|m| m.name())
            .collect();
        let tab_init_middleware_names: Vec<&str> =
            self.tab_init_middlewares.iter().map(|m| m.name()).collect();

        f.debug_struct("ChromeEngineConfig")
            .field("headless", &self.headless)
            .field("browser_path", &self.browser_path)
            .field("proxy_provider", &self.proxy_provider.name())
            .field("resource_policy", &self.resource_policy)
            .field("binary_params_middlewares", &binary_middleware_names)
            .field("tab_init_middlewares", &tab_init_middleware_names)
            .finish()
    }
}

impl ChromeEngineConfig {
    /// Default middlewares, the configured resource policy and the given proxy provider
    pub fn from_crawl_config(config: &CrawlConfig, proxy_provider: Box<dyn ProxyProvider>) -> Self {
        Self {
            headless: config.headless,
            browser_path: config.browser_path.clone(),
            proxy_provider,
            resource_policy: Arc::new(config.resource_policy.clone()),
            binary_params_middlewares: vec![Box::new(DefaultBinaryParamsMiddleware)],
            tab_init_middlewares: vec![Box::new(UserAgentOverrideMiddleware::new(config.headless))],
        }
    }
}

/// Render engine backed by headless_chrome, one Chrome process per worker
#[derive(Debug)]
pub struct ChromeEngine {
    config: ChromeEngineConfig,
}

impl ChromeEngine {
    pub fn new(config: ChromeEngineConfig) -> Self {
        let binary = config
            .browser_path
            .as_deref()
            .unwrap_or_else(|| Path::new("chromium"));
        verify_browser_binary(binary);

        info!(
            "Chrome engine ready (headless: {}, proxy provider: {}, {} binary / {} tab middleware(s))",
            config.headless,
            config.proxy_provider.name(),
            config.binary_params_middlewares.len(),
            config.tab_init_middlewares.len()
        );

        Self { config }
    }
}

impl RenderEngine for ChromeEngine {
    fn launch(&self, worker_id: u64) -> Result<Arc<dyn RenderSession>> {
        let proxy_config = self.config.proxy_provider.config_for_worker(worker_id)?;
        let credentials = proxy_config.credentials();

        match &proxy_config.server {
            Some(server) if credentials.is_some() => {
                info!(worker_id, "Using proxy: {} (with authentication via Fetch API)", server)
            }
            Some(server) => info!(worker_id, "Using proxy: {} (no authentication)", server),
            None => debug!(worker_id, "No proxy configured - using direct connection"),
        }

        let mut chrome_args: Vec<&'static OsStr> = Vec::new();
        for middleware in &self.config.binary_params_middlewares {
            debug!(worker_id, "Applying binary params middleware: {}", middleware.name());
            middleware.apply_args(&mut chrome_args, self.config.headless);
        }

        let mut launch_builder = LaunchOptions::default_builder();
        launch_builder
            .headless(self.config.headless)
            .proxy_server(proxy_config.server.as_deref())
            // The default 30s idle timeout drops the CDP socket during long challenge waits
            .idle_browser_timeout(Duration::from_secs(3600))
            .args(chrome_args);

        if let Some(ref browser_path) = self.config.browser_path {
            launch_builder.path(Some(browser_path.clone()));
        }

        let launch_options = launch_builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build launch options: {}", e))?;

        let browser = Browser::new(launch_options).map_err(|e| {
            error!(
                worker_id,
                "Browser failed to launch: {}. Check that the binary exists, \
                 is executable and that --no-sandbox is set inside containers.",
                e
            );
            e
        })?;
        let pid = browser.get_process_id();

        let tab = browser
            .new_tab()
            .map_err(|e| anyhow::anyhow!("Failed to create tab: {}", e))?;

        if let Some((username, password)) = credentials.clone() {
            tab.authenticate(Some(username), Some(password))
                .context("Failed to register proxy credentials")?;
        }

        let counters = Arc::new(FilterCounters::default());
        ResourceFilterMiddleware::new(
            self.config.resource_policy.clone(),
            counters.clone(),
            credentials.is_some(),
        )
        .apply(&tab)
        .context("Failed to install resource filter")?;

        for middleware in &self.config.tab_init_middlewares {
            if let Err(e) = middleware.apply(&tab) {
                warn!(
                    worker_id,
                    "Failed to apply tab init middleware '{}': {}",
                    middleware.name(),
                    e
                );
            }
        }

        info!(worker_id, "Launched Chrome (pid: {:?})", pid);

        Ok(Arc::new(ChromeSession {
            worker_id,
            browser: Mutex::new(Some(browser)),
            tab,
            pid,
            counters,
        }))
    }

    fn name(&self) -> &str {
        "headless_chrome"
    }
}

/// A Chrome process with the single tab a worker crawls in
pub struct ChromeSession {
    worker_id: u64,
    browser: Mutex<Option<Browser>>,
    tab: Arc<Tab>,
    pid: Option<u32>,
    counters: Arc<FilterCounters>,
}

fn classify(e: anyhow::Error) -> EngineError {
    EngineError::classify(e.to_string())
}

impl RenderSession for ChromeSession {
    fn navigate(&self, url: &str, timeout: Duration) -> Result<Navigation, EngineError> {
        self.tab.set_default_timeout(timeout);
        self.tab.navigate_to(url).map_err(classify)?;
        self.tab.wait_until_navigated().map_err(classify)?;

        let status = self
            .tab
            .evaluate(RESPONSE_STATUS_SCRIPT, false)
            .ok()
            .and_then(|result| result.value)
            .and_then(|value| value.as_u64())
            .filter(|status| *status > 0)
            .and_then(|status| u16::try_from(status).ok());

        Ok(Navigation { status })
    }

    fn snapshot(&self) -> Result<PageSnapshot, EngineError> {
        let markup = self.tab.get_content().map_err(classify)?;
        Ok(PageSnapshot::new(self.tab.get_url(), markup))
    }

    fn resident_memory_mb(&self) -> Option<u64> {
        self.pid.and_then(process_tree_rss_mb)
    }

    fn filter_counts(&self) -> (u64, u64) {
        self.counters.snapshot()
    }

    fn close(&self) {
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(browser) = browser {
            let _ = self.tab.close(false);
            // Dropping the Browser kills the Chrome process
            drop(browser);
            debug!(worker_id = self.worker_id, "Chrome process released");
        }
    }
}

/// Pre-flight check: verify browser binary exists and log useful diagnostics
fn verify_browser_binary(binary_path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if !binary_path.exists() {
        warn!(
            "Browser binary not found at '{}'. headless_chrome will attempt auto-detection.",
            binary_path.display()
        );
        return;
    }

    match std::fs::metadata(binary_path) {
        Ok(metadata) => {
            let mode = metadata.permissions().mode();
            if mode & 0o111 == 0 {
                warn!(
                    "Browser binary '{}' exists but is NOT executable (mode: {:o})",
                    binary_path.display(),
                    mode
                );
            } else {
                info!("Browser binary verified: '{}'", binary_path.display());
            }
        }
        Err(e) => warn!(
            "Cannot read metadata for browser binary '{}': {}",
            binary_path.display(),
            e
        ),
    }

    let uid = unsafe { libc::getuid() };
    if uid != 0 {
        info!(
            "Running as non-root user (uid: {}). If Chrome fails to start, check the sandbox settings.",
            uid
        );
    }
}
