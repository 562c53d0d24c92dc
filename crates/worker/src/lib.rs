mod browser_worker;
mod challenge;
mod chrome;
mod engine;
mod metrics;
mod pool;
mod telemetry;

pub mod providers;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use browser_worker::{check_content, BrowserWorker, FetchFailure, FetchReport, FetchSettings};
pub use challenge::{bounded_polls, ChallengeError, ChallengePhase, ChallengeReport, ChallengeWaiter};
pub use chrome::{ChromeEngine, ChromeEngineConfig, ChromeSession};
pub use engine::{is_dead_browser_error, EngineError, Navigation, RenderEngine, RenderSession};
pub use metrics::Metrics;
pub use pool::{DispatchPermit, PoolConfig, PoolError, PoolStats, RetireReason, WorkerPool};
pub use telemetry::process_tree_rss_mb;
