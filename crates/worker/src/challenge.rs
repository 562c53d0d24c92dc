//! Per-fetch challenge state machine.
//!
//! `none → detected → waiting → {resolved | timed_out}`
//!
//! The waiter polls the page at a fixed interval for at most
//! `ceil(timeout / interval)` iterations, so it always terminates. It never
//! retries: a timed out challenge fails the fetch and the orchestrator
//! decides whether the URL goes out again on another worker.

use crate::engine::{EngineError, RenderSession};
use crawl_hive_common::ChallengeSignatureRegistry;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengePhase {
    None,
    Detected,
    Waiting,
    Resolved,
    TimedOut,
}

impl ChallengePhase {
    pub fn can_advance_to(self, next: ChallengePhase) -> bool {
        matches!(
            (self, next),
            (Self::None, Self::Detected)
                | (Self::Detected, Self::Waiting)
                | (Self::Waiting, Self::Resolved)
                | (Self::Waiting, Self::TimedOut)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Detected => "detected",
            Self::Waiting => "waiting",
            Self::Resolved => "resolved",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Transient state of one fetch's challenge handling
#[derive(Debug)]
struct ChallengeState {
    phase: ChallengePhase,
    started: Instant,
    signature: Option<String>,
    polls: u32,
}

impl ChallengeState {
    fn new() -> Self {
        Self {
            phase: ChallengePhase::None,
            started: Instant::now(),
            signature: None,
            polls: 0,
        }
    }

    fn advance(&mut self, next: ChallengePhase, url: &str) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "invalid challenge transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!(
            url = %url,
            "Challenge phase {} -> {} after {:?}",
            self.phase.as_str(),
            next.as_str(),
            self.started.elapsed()
        );
        self.phase = next;
    }

    fn into_report(self) -> ChallengeReport {
        ChallengeReport {
            phase: self.phase,
            elapsed: self.started.elapsed(),
            polls: self.polls,
            signature: self.signature,
        }
    }
}

/// Final state of a challenge wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeReport {
    pub phase: ChallengePhase,
    pub elapsed: Duration,
    pub polls: u32,
    pub signature: Option<String>,
}

impl ChallengeReport {
    pub fn detected(&self) -> bool {
        self.phase != ChallengePhase::None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("challenge wait cancelled")]
    Cancelled,
}

/// Number of polls allowed for a timeout, at least one
pub fn bounded_polls(timeout: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 1;
    }
    let polls = timeout.as_nanos().div_ceil(interval.as_nanos());
    polls.clamp(1, u32::MAX as u128) as u32
}

#[derive(Debug, Clone)]
pub struct ChallengeWaiter {
    registry: ChallengeSignatureRegistry,
    timeout: Duration,
    interval: Duration,
}

impl ChallengeWaiter {
    pub fn new(registry: ChallengeSignatureRegistry, timeout: Duration, interval: Duration) -> Self {
        Self {
            registry,
            timeout,
            interval,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_polls(&self) -> u32 {
        bounded_polls(self.timeout, self.interval)
    }

    /// Inspect the loaded page and, if a challenge shows, wait for it to resolve.
    ///
    /// Blocking; run it inside `spawn_blocking`.
    pub fn run(
        &self,
        session: &dyn RenderSession,
        url: &str,
        cancellation_token: &CancellationToken,
    ) -> Result<ChallengeReport, ChallengeError> {
        let mut state = ChallengeState::new();

        let page = session.snapshot()?;
        let Some(signature) = self.registry.detect(&page) else {
            return Ok(state.into_report());
        };

        state.signature = Some(signature.name().to_string());
        state.advance(ChallengePhase::Detected, url);
        info!(url = %url, "Challenge '{}' detected, waiting up to {:?}", signature.name(), self.timeout);
        state.advance(ChallengePhase::Waiting, url);

        let max_polls = self.max_polls();
        while state.polls < max_polls {
            if cancellation_token.is_cancelled() {
                return Err(ChallengeError::Cancelled);
            }

            let remaining = self.timeout.saturating_sub(state.started.elapsed());
            if remaining.is_zero() {
                break;
            }
            sleep(self.interval.min(remaining));
            state.polls += 1;

            let page = session.snapshot()?;
            if signature.is_resolved(&page) {
                state.advance(ChallengePhase::Resolved, url);
                info!(
                    url = %url,
                    "Challenge '{}' resolved after {:?} ({} polls)",
                    signature.name(),
                    state.started.elapsed(),
                    state.polls
                );
                return Ok(state.into_report());
            }
        }

        state.advance(ChallengePhase::TimedOut, url);
        warn!(
            url = %url,
            "Challenge '{}' not resolved within {:?} ({} polls)",
            signature.name(),
            self.timeout,
            state.polls
        );
        Ok(state.into_report())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Navigation;
    use crawl_hive_common::PageSnapshot;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const CHALLENGE: &str = r#"<html><body><div class="cf-turnstile"></div></body></html>"#;
    const CONTENT: &str = r#"<html><body><h1>Real content</h1></body></html>"#;

    /// Returns queued markups in order, repeating the last one
    struct QueuedPages(Mutex<VecDeque<&'static str>>);

    impl QueuedPages {
        fn new(pages: &[&'static str]) -> Self {
            Self(Mutex::new(pages.iter().copied().collect()))
        }
    }

    impl RenderSession for QueuedPages {
        fn navigate(&self, _url: &str, _timeout: Duration) -> Result<Navigation, EngineError> {
            Ok(Navigation::default())
        }

        fn snapshot(&self) -> Result<PageSnapshot, EngineError> {
            let mut pages = self.0.lock().unwrap();
            let markup = if pages.len() > 1 {
                pages.pop_front().unwrap()
            } else {
                *pages.front().unwrap()
            };
            Ok(PageSnapshot::new("https://example.com/page", markup))
        }

        fn resident_memory_mb(&self) -> Option<u64> {
            None
        }

        fn close(&self) {}
    }

    fn waiter(timeout_ms: u64) -> ChallengeWaiter {
        ChallengeWaiter::new(
            ChallengeSignatureRegistry::new(),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_bounded_polls() {
        assert_eq!(
            bounded_polls(Duration::from_secs(20), Duration::from_millis(500)),
            40
        );
        assert_eq!(
            bounded_polls(Duration::from_millis(1100), Duration::from_millis(500)),
            3
        );
        assert_eq!(bounded_polls(Duration::ZERO, Duration::from_millis(500)), 1);
        assert_eq!(bounded_polls(Duration::from_secs(1), Duration::ZERO), 1);
    }

    #[test]
    fn test_phase_transitions() {
        assert!(ChallengePhase::None.can_advance_to(ChallengePhase::Detected));
        assert!(ChallengePhase::Waiting.can_advance_to(ChallengePhase::TimedOut));
        assert!(!ChallengePhase::None.can_advance_to(ChallengePhase::Resolved));
        assert!(!ChallengePhase::TimedOut.can_advance_to(ChallengePhase::Resolved));
    }

    #[test]
    fn test_no_challenge_stays_none() {
        let session = QueuedPages::new(&[CONTENT]);
        let report = waiter(100)
            .run(&session, "https://example.com", &CancellationToken::new())
            .unwrap();
        assert_eq!(report.phase, ChallengePhase::None);
        assert_eq!(report.polls, 0);
        assert!(!report.detected());
    }

    #[test]
    fn test_challenge_resolves() {
        let session = QueuedPages::new(&[CHALLENGE, CHALLENGE, CONTENT]);
        let report = waiter(1_000)
            .run(&session, "https://example.com", &CancellationToken::new())
            .unwrap();
        assert_eq!(report.phase, ChallengePhase::Resolved);
        assert_eq!(report.polls, 2);
        assert_eq!(report.signature.as_deref(), Some("cloudflare_turnstile"));
    }

    #[test]
    fn test_challenge_times_out() {
        let session = QueuedPages::new(&[CHALLENGE]);
        let waiter = waiter(50);
        let report = waiter
            .run(&session, "https://example.com", &CancellationToken::new())
            .unwrap();
        assert_eq!(report.phase, ChallengePhase::TimedOut);
        assert!(report.polls <= waiter.max_polls());
        assert!(report.elapsed >= Duration::from_millis(50));
    }

    #[test]
    fn test_cancelled_wait() {
        let session = QueuedPages::new(&[CHALLENGE]);
        let token = CancellationToken::new();
        token.cancel();
        let result = waiter(1_000).run(&session, "https://example.com", &token);
        assert!(matches!(result, Err(ChallengeError::Cancelled)));
    }
}
