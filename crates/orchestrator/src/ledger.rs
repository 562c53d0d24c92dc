//! Durable per-URL crawl status.
//!
//! The ledger is the single source of truth for dedup and resumability. It
//! lives in memory during a run and is written out atomically after each
//! batch and on shutdown.

use chrono::{DateTime, Utc};
use crawl_hive_common::{CrawlRecord, CrawlStatus, FailureReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

pub const LEDGER_VERSION: u32 = 1;
/// Consecutive snapshot failures tolerated before the run is aborted
pub const LEDGER_WRITE_ATTEMPTS: u32 = 3;
const LEDGER_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist ledger {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    updated_at: DateTime<Utc>,
    records: BTreeMap<String, CrawlRecord>,
}

/// What `Ledger::load` found on disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub records: usize,
    /// `in_progress` records reset to `pending`
    pub recovered: usize,
    /// Set when the snapshot was unreadable and the ledger started empty
    pub fallback: Option<String>,
}

/// A status transition for one URL
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub status: CrawlStatus,
    pub failure_reason: Option<FailureReason>,
    pub details: Option<String>,
    pub category: Option<String>,
    pub content_sha256: Option<String>,
}

impl RecordUpdate {
    fn with_status(status: CrawlStatus) -> Self {
        Self {
            status,
            failure_reason: None,
            details: None,
            category: None,
            content_sha256: None,
        }
    }

    pub fn pending() -> Self {
        Self::with_status(CrawlStatus::Pending)
    }

    /// Marks a dispatch; bumps the record's attempt count
    pub fn in_progress(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Self::with_status(CrawlStatus::InProgress)
        }
    }

    pub fn success(content_sha256: impl Into<String>) -> Self {
        Self {
            content_sha256: Some(content_sha256.into()),
            ..Self::with_status(CrawlStatus::Success)
        }
    }

    pub fn failed(reason: FailureReason, details: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason),
            details: Some(details.into()),
            ..Self::with_status(CrawlStatus::Failed)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    records: BTreeMap<String, CrawlRecord>,
    dirty: bool,
}

impl Ledger {
    /// Empty ledger that will be written to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
            dirty: false,
        }
    }

    /// Load the last snapshot. Never fails: a missing file starts empty, an
    /// unreadable one starts empty and is logged.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self::load_report(path).0
    }

    pub fn load_report(path: impl Into<PathBuf>) -> (Self, LoadReport) {
        let path = path.into();
        let mut report = LoadReport::default();

        let records = match read_snapshot(&path) {
            Ok(Some(records)) => records,
            Ok(None) => {
                info!("No ledger at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => {
                error!("ledger_io_error: {} - starting with an empty ledger", e);
                report.fallback = Some(e.to_string());
                BTreeMap::new()
            }
        };

        let mut ledger = Self {
            path,
            records,
            dirty: false,
        };
        report.recovered = ledger.recover_in_progress();
        report.records = ledger.records.len();

        info!(
            "Ledger loaded from {}: {} record(s), {} recovered from in_progress",
            ledger.path.display(),
            report.records,
            report.recovered
        );
        (ledger, report)
    }

    /// Reset records abandoned mid-fetch to `pending`
    fn recover_in_progress(&mut self) -> usize {
        let mut recovered = 0;
        for (url, record) in self.records.iter_mut() {
            if record.status == CrawlStatus::InProgress {
                warn!(url = %url, "Resetting abandoned in_progress record to pending");
                record.status = CrawlStatus::Pending;
                record.timestamp = Utc::now();
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.dirty = true;
        }
        recovered
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, url: &str) -> Option<CrawlStatus> {
        self.records.get(url).map(|r| r.status)
    }

    pub fn get(&self, url: &str) -> Option<&CrawlRecord> {
        self.records.get(url)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &CrawlRecord)> {
        self.records.iter()
    }

    /// Apply a transition; last write wins.
    ///
    /// Fields not carried by the update are cleared except `category`,
    /// which is kept when the update has none.
    pub fn record(&mut self, url: &str, update: RecordUpdate) -> &CrawlRecord {
        let record = self
            .records
            .entry(url.to_string())
            .or_insert_with(|| CrawlRecord::new(CrawlStatus::Pending));

        if update.status == CrawlStatus::InProgress {
            record.attempt_count += 1;
        }
        record.status = update.status;
        record.failure_reason = update.failure_reason;
        record.details = update.details;
        record.content_sha256 = update.content_sha256;
        if update.category.is_some() {
            record.category = update.category;
        }
        record.timestamp = Utc::now();
        self.dirty = true;
        record
    }

    pub fn counts(&self) -> LedgerCounts {
        let mut counts = LedgerCounts::default();
        for record in self.records.values() {
            match record.status {
                CrawlStatus::Pending => counts.pending += 1,
                CrawlStatus::InProgress => counts.in_progress += 1,
                CrawlStatus::Success => counts.success += 1,
                CrawlStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Durable write: temp file in the same directory, fsync, rename
    pub fn snapshot(&mut self) -> Result<(), LedgerError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|source| LedgerError::Io {
            path: dir.clone(),
            source,
        })?;

        let file = LedgerFile {
            version: LEDGER_VERSION,
            updated_at: Utc::now(),
            records: self.records.clone(),
        };
        let body = serde_json::to_vec_pretty(&file).map_err(|source| LedgerError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };
        let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        temp.write_all(&body).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;
        temp.persist(&self.path)
            .map_err(|source| LedgerError::Persist {
                path: self.path.clone(),
                source,
            })?;

        self.dirty = false;
        Ok(())
    }

    /// Snapshot, retrying up to `LEDGER_WRITE_ATTEMPTS` times
    pub async fn snapshot_with_retry(&mut self) -> Result<(), LedgerError> {
        let mut attempt = 1;
        loop {
            match self.snapshot() {
                Ok(()) => return Ok(()),
                Err(e) if attempt < LEDGER_WRITE_ATTEMPTS => {
                    warn!(
                        "Ledger snapshot attempt {}/{} failed: {}",
                        attempt, LEDGER_WRITE_ATTEMPTS, e
                    );
                    tokio::time::sleep(LEDGER_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Ledger snapshot failed {} times in a row: {}",
                        LEDGER_WRITE_ATTEMPTS, e
                    );
                    return Err(e);
                }
            }
        }
    }
}

fn read_snapshot(path: &Path) -> Result<Option<BTreeMap<String, CrawlRecord>>, LedgerError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LedgerError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let file: LedgerFile = serde_json::from_slice(&raw).map_err(|source| LedgerError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    if file.version != LEDGER_VERSION {
        warn!(
            "Ledger {} has version {}, expected {}",
            path.display(),
            file.version,
            LEDGER_VERSION
        );
    }
    Ok(Some(file.records))
}
