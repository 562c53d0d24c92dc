//! Seam between the pool and the browser automation library.
//!
//! A [`RenderEngine`] launches one browser per worker; the resulting
//! [`RenderSession`] is the worker's page handle. All methods are blocking
//! and are called from `spawn_blocking` tasks.

use crawl_hive_common::PageSnapshot;
use std::sync::Arc;
use std::time::Duration;

/// Errors surfaced by a render session
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("timed out: {0}")]
    Timeout(String),
    /// The browser process or its CDP connection is gone
    #[error("browser process is dead: {0}")]
    Crashed(String),
    /// Navigation rejected while the browser stayed healthy
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Classify an error message from the automation library
    pub fn classify(message: String) -> Self {
        if is_dead_browser_error(&message) {
            Self::Crashed(message)
        } else if is_timeout_error(&message) {
            Self::Timeout(message)
        } else if message.contains("net::ERR_") {
            Self::Navigation(message)
        } else {
            Self::Other(anyhow::anyhow!(message))
        }
    }
}

/// Check if an error indicates the browser process (or the tab's CDP session) is dead.
pub fn is_dead_browser_error(message: &str) -> bool {
    message.contains("connection is closed")
        || message.contains("No such process")
        || message.contains("No session with given id")
}

fn is_timeout_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("timeout") || lower.contains("timed out") || lower.contains("never came")
}

/// Result of a completed navigation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Navigation {
    /// HTTP status of the main document, if the engine could read it
    pub status: Option<u16>,
}

/// One live browser bound to a single worker
pub trait RenderSession: Send + Sync {
    /// Navigate and wait until the page has loaded
    fn navigate(&self, url: &str, timeout: Duration) -> Result<Navigation, EngineError>;

    /// Current URL and rendered markup
    fn snapshot(&self) -> Result<PageSnapshot, EngineError>;

    /// Resident memory of the browser process tree in MB
    fn resident_memory_mb(&self) -> Option<u64>;

    /// (allowed, blocked) request counts of the resource filter
    fn filter_counts(&self) -> (u64, u64) {
        (0, 0)
    }

    /// Abort in-flight work and release the browser. Idempotent.
    fn close(&self);
}

/// Launches browsers for workers
pub trait RenderEngine: Send + Sync {
    /// Start a browser for `worker_id` with the resource filter installed
    fn launch(&self, worker_id: u64) -> anyhow::Result<Arc<dyn RenderSession>>;

    /// Get unique identifier for this engine (used in logging)
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_errors() {
        assert!(matches!(
            EngineError::classify("Unable to make method calls because underlying connection is closed".into()),
            EngineError::Crashed(_)
        ));
        assert!(matches!(
            EngineError::classify("The event waited for never came".into()),
            EngineError::Timeout(_)
        ));
        assert!(matches!(
            EngineError::classify("Navigate failed: net::ERR_NAME_NOT_RESOLVED".into()),
            EngineError::Navigation(_)
        ));
        assert!(matches!(
            EngineError::classify("something else".into()),
            EngineError::Other(_)
        ));
    }
}
