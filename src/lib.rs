//! # Crawl Hive
//!
//! Crawl Hive crawls a list of URLs through a bounded pool of disposable
//! browser workers. Progress is kept in a durable ledger so an interrupted
//! run resumes where it stopped and already crawled URLs are never fetched
//! twice.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use crawl_hive::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CrawlConfig {
//!         input_file: "urls.txt".into(),
//!         max_browsers: 4,
//!         ..Default::default()
//!     };
//!
//!     let engine = ChromeEngine::new(ChromeEngineConfig::from_crawl_config(
//!         &config,
//!         Box::new(NoProxyProvider),
//!     ));
//!
//!     let summary = run_crawl(config, Arc::new(engine), CancellationToken::new(), None).await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Common**: configuration, crawl records, target URLs, resource and challenge policies
//! - **Worker**: browser workers, challenge waiter, worker pool, metrics
//! - **Orchestrator**: ledger, batching and retries, artifact output, run statistics
//!
//! ## Features
//!
//! - `worker` (default): Include worker functionality
//! - `orchestrator` (default): Include the crawl orchestrator
//!
//! Use `default-features = false` to include only what you need.

/// Re-export of common types and traits
pub use crawl_hive_common as common;

/// Re-export of worker functionality
#[cfg(feature = "worker")]
pub use crawl_hive_worker as worker;

/// Re-export of the orchestrator
#[cfg(feature = "orchestrator")]
pub use crawl_hive_orchestrator as orchestrator;

/// Convenient re-exports of commonly used types
pub mod prelude {
    // Configuration and records
    pub use crate::common::{
        CrawlConfig, CrawlRecord, CrawlStatus, FailureReason, TargetUrl, WorkerLifecycle,
    };

    // Policies and extension points
    pub use crate::common::{
        ChallengeSignature, ChallengeSignatureRegistry, ProxyConfig, ProxyProvider,
        ResourcePolicy, SelectorSignature,
    };

    // Worker functionality
    #[cfg(feature = "worker")]
    pub use crate::worker::{
        ChromeEngine, ChromeEngineConfig, Metrics, PoolConfig, RenderEngine, RenderSession,
        WorkerPool,
    };

    // Built-in proxy providers
    #[cfg(feature = "worker")]
    pub use crate::worker::providers::{NoProxyProvider, ProxyListProvider, StaticProxyProvider};

    // Orchestration
    #[cfg(feature = "orchestrator")]
    pub use crate::orchestrator::{run_crawl, CrawlSummary, Ledger, Orchestrator};

    pub use tokio_util::sync::CancellationToken;
}
