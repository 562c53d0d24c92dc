//! Scripted in-process engine for exercising the pool and orchestrator
//! without a browser.

use crate::engine::{EngineError, Navigation, RenderEngine, RenderSession};
use crawl_hive_common::PageSnapshot;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const CHALLENGE_PAGE: &str = r#"<html><head><title>Just a moment...</title></head><body><div class="cf-turnstile"></div></body></html>"#;

const DEFAULT_PAGE: &str = "<html><head><title>Specs</title></head><body><div class=\"ficha_specs_main\">Engine, dimensions, performance and more</div></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NavigationOutcome {
    Loaded,
    Crash,
    Timeout,
    Rejected,
}

/// What one navigation to a URL does
#[derive(Debug, Clone)]
pub struct ScriptedPage {
    outcome: NavigationOutcome,
    /// Successive snapshots; the last one repeats
    markups: Vec<String>,
    status: Option<u16>,
    memory_mb: Option<u64>,
    delay: Duration,
}

impl ScriptedPage {
    fn with_outcome(outcome: NavigationOutcome, markups: Vec<String>) -> Self {
        Self {
            outcome,
            markups,
            status: Some(200),
            memory_mb: Some(100),
            delay: Duration::ZERO,
        }
    }

    pub fn ok(markup: &str) -> Self {
        Self::with_outcome(NavigationOutcome::Loaded, vec![markup.to_string()])
    }

    pub fn crash() -> Self {
        Self::with_outcome(NavigationOutcome::Crash, vec![])
    }

    pub fn timeout() -> Self {
        Self::with_outcome(NavigationOutcome::Timeout, vec![])
    }

    pub fn rejected() -> Self {
        Self::with_outcome(NavigationOutcome::Rejected, vec![])
    }

    /// Challenge page that never clears
    pub fn challenge_forever() -> Self {
        Self::ok(CHALLENGE_PAGE).with_status(403)
    }

    /// Challenge shown for `challenge_snapshots` snapshots, then `markup`
    pub fn challenge_then(markup: &str, challenge_snapshots: usize) -> Self {
        let mut markups = vec![CHALLENGE_PAGE.to_string(); challenge_snapshots.max(1)];
        markups.push(markup.to_string());
        Self::with_outcome(NavigationOutcome::Loaded, markups).with_status(403)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_memory(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    /// Navigation blocks this long unless the session is closed first
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct EngineState {
    scripts: HashMap<String, VecDeque<ScriptedPage>>,
    default: Option<ScriptedPage>,
    navigations: Vec<String>,
    launches: u64,
    failing_launches: u32,
    active: usize,
    peak_active: usize,
    closed: u64,
}

type SharedState = Arc<Mutex<EngineState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Engine whose pages follow per-URL scripts
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    state: SharedState,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a page for `url`. Each navigation consumes one entry; the last
    /// entry is reused for any further navigation.
    pub fn script(&self, url: &str, page: ScriptedPage) {
        lock(&self.state)
            .scripts
            .entry(url.to_string())
            .or_default()
            .push_back(page);
    }

    /// Page used for URLs without a script
    pub fn set_default(&self, page: ScriptedPage) {
        lock(&self.state).default = Some(page);
    }

    pub fn fail_next_launches(&self, count: u32) {
        lock(&self.state).failing_launches = count;
    }

    pub fn launches(&self) -> u64 {
        lock(&self.state).launches
    }

    pub fn navigations(&self) -> Vec<String> {
        lock(&self.state).navigations.clone()
    }

    pub fn navigation_count(&self, url: &str) -> usize {
        lock(&self.state)
            .navigations
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }

    pub fn closed_sessions(&self) -> u64 {
        lock(&self.state).closed
    }

    pub fn active_sessions(&self) -> usize {
        lock(&self.state).active
    }

    pub fn peak_active_sessions(&self) -> usize {
        lock(&self.state).peak_active
    }

    fn next_page(&self, url: &str) -> ScriptedPage {
        let mut state = lock(&self.state);
        state.navigations.push(url.to_string());
        let scripted = match state.scripts.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        scripted
            .or_else(|| state.default.clone())
            .unwrap_or_else(|| ScriptedPage::ok(DEFAULT_PAGE))
    }
}

impl RenderEngine for ScriptedEngine {
    fn launch(&self, worker_id: u64) -> anyhow::Result<Arc<dyn RenderSession>> {
        let mut state = lock(&self.state);
        if state.failing_launches > 0 {
            state.failing_launches -= 1;
            anyhow::bail!("scripted launch failure for worker {}", worker_id);
        }
        state.launches += 1;
        state.active += 1;
        state.peak_active = state.peak_active.max(state.active);

        Ok(Arc::new(ScriptedSession {
            engine: self.clone(),
            current: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct LoadedPage {
    url: String,
    page: ScriptedPage,
    cursor: usize,
}

pub struct ScriptedSession {
    engine: ScriptedEngine,
    current: Mutex<Option<LoadedPage>>,
    closed: AtomicBool,
}

impl ScriptedSession {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Crashed("connection is closed".to_string()));
        }
        Ok(())
    }

    fn current(&self) -> MutexGuard<'_, Option<LoadedPage>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RenderSession for ScriptedSession {
    fn navigate(&self, url: &str, _timeout: Duration) -> Result<Navigation, EngineError> {
        self.ensure_open()?;
        let page = self.engine.next_page(url);

        let started = Instant::now();
        while started.elapsed() < page.delay {
            std::thread::sleep(Duration::from_millis(5));
            self.ensure_open()?;
        }

        match page.outcome {
            NavigationOutcome::Crash => {
                return Err(EngineError::Crashed("connection is closed".to_string()))
            }
            NavigationOutcome::Timeout => {
                return Err(EngineError::Timeout(
                    "The event waited for never came".to_string(),
                ))
            }
            NavigationOutcome::Rejected => {
                return Err(EngineError::Navigation(
                    "net::ERR_NAME_NOT_RESOLVED".to_string(),
                ))
            }
            NavigationOutcome::Loaded => {}
        }

        let status = page.status;
        *self.current() = Some(LoadedPage {
            url: url.to_string(),
            page,
            cursor: 0,
        });
        Ok(Navigation { status })
    }

    fn snapshot(&self) -> Result<PageSnapshot, EngineError> {
        self.ensure_open()?;
        let mut current = self.current();
        let Some(loaded) = current.as_mut() else {
            return Ok(PageSnapshot::new("about:blank", ""));
        };

        let markup = loaded
            .page
            .markups
            .get(loaded.cursor)
            .cloned()
            .unwrap_or_default();
        if loaded.cursor + 1 < loaded.page.markups.len() {
            loaded.cursor += 1;
        }
        Ok(PageSnapshot::new(loaded.url.clone(), markup))
    }

    fn resident_memory_mb(&self) -> Option<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.current().as_ref().and_then(|loaded| loaded.page.memory_mb)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = lock(&self.engine.state);
            state.active = state.active.saturating_sub(1);
            state.closed += 1;
        }
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.close();
    }
}
