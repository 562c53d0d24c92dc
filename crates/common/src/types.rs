use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a single URL in the progress ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    #[default]
    Pending,
    InProgress,
    Success,
    Failed,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a fetch did not produce an artifact.
///
/// Serialized in snake_case into the ledger and the failure log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[error("navigation_timeout")]
    NavigationTimeout,
    /// Navigation was rejected (DNS, TLS, connection refused) while the browser stayed healthy
    #[error("navigation_error")]
    NavigationError,
    #[error("challenge_timeout")]
    ChallengeTimeout,
    #[error("worker_crash")]
    WorkerCrash,
    /// Page loaded but the expected content is absent
    #[error("extraction_error")]
    ExtractionError,
    /// Final response status >= 400 with no challenge on the page
    #[error("http_error")]
    HttpError,
    /// The artifact writer rejected the content
    #[error("output_error")]
    OutputError,
    /// Fetch aborted by shutdown; never recorded as a terminal reason
    #[error("cancelled")]
    Cancelled,
}

impl FailureReason {
    /// A worker that produced this failure must not serve another fetch
    pub fn poisons_worker(&self) -> bool {
        matches!(
            self,
            Self::NavigationTimeout | Self::WorkerCrash | Self::Cancelled
        )
    }

    /// Whether another dispatch within the same run can change the result
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::OutputError | Self::Cancelled)
    }
}

/// Per-URL entry of the progress ledger. The URL itself is the ledger key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRecord {
    pub status: CrawlStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Number of dispatches ever made for this URL
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
}

impl CrawlRecord {
    pub fn new(status: CrawlStatus) -> Self {
        Self {
            status,
            failure_reason: None,
            details: None,
            timestamp: Utc::now(),
            attempt_count: 0,
            category: None,
            content_sha256: None,
        }
    }
}
