pub mod browser_middleware;
pub mod challenge;
pub mod config;
pub mod proxy;
pub mod resource_filter;
pub mod target;
pub mod types;
pub mod utils;

pub use browser_middleware::{
    BrowserBinaryParamsMiddleware, DefaultBinaryParamsMiddleware, ResourceFilterMiddleware,
    TabInitMiddleware, UserAgentOverrideMiddleware,
};
pub use challenge::{ChallengeSignature, ChallengeSignatureRegistry, PageSnapshot, SelectorSignature};
pub use config::*;
pub use proxy::{ProxyConfig, ProxyProvider};
pub use resource_filter::{
    FilterCounters, FilterDecision, ResourceClass, ResourcePolicy, ResourceRule,
};
pub use target::{TargetUrl, TargetUrlError};
pub use types::*;
