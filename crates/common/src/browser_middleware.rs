use crate::resource_filter::{FilterCounters, FilterDecision, ResourceClass, ResourcePolicy};
use anyhow::Result;
use headless_chrome::browser::tab::{RequestPausedDecision, Tab};
use headless_chrome::browser::transport::{SessionId, Transport};
use headless_chrome::protocol::cdp::Fetch::events::RequestPausedEvent;
use headless_chrome::protocol::cdp::Fetch::FailRequest;
use headless_chrome::protocol::cdp::Network::{ErrorReason, ResourceType};
use std::ffi::OsStr;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Middleware for modifying Chrome binary launch parameters
///
/// Applied in order before each worker's browser is launched.
pub trait BrowserBinaryParamsMiddleware: Debug + Send + Sync {
    /// Push Chrome arguments
    ///
    /// # Parameters
    /// * `args` - Mutable vector of Chrome arguments (as OsStr for cross-platform support)
    /// * `headless` - Whether browser is running in headless mode
    fn apply_args(&self, args: &mut Vec<&'static OsStr>, headless: bool);

    /// Get unique identifier for this middleware (used in logging)
    fn name(&self) -> &str;

    /// Clone this middleware into a Box
    ///
    /// Standard implementation: `Box::new(self.clone())`
    fn clone_box(&self) -> Box<dyn BrowserBinaryParamsMiddleware>;
}

impl Clone for Box<dyn BrowserBinaryParamsMiddleware> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Middleware for tab initialization after creation
///
/// Executed on the worker's tab before its first navigation.
///
/// # Example
///
/// ```rust
/// use crawl_hive_common::browser_middleware::TabInitMiddleware;
/// use anyhow::Result;
///
/// #[derive(Debug, Clone)]
/// struct TimezoneOverride {
///     timezone: String,
/// }
///
/// impl TabInitMiddleware for TimezoneOverride {
///     fn apply(&self, tab: &headless_chrome::browser::tab::Tab) -> Result<()> {
///         let script = format!(
///             "Object.defineProperty(Intl.DateTimeFormat.prototype, 'resolvedOptions', {{ \
///                 value: function() {{ return {{ timeZone: '{}' }}; }} \
///             }});",
///             self.timezone
///         );
///         tab.evaluate(&script, false)?;
///         Ok(())
///     }
///
///     fn name(&self) -> &str {
///         "timezone_override"
///     }
///
///     fn clone_box(&self) -> Box<dyn TabInitMiddleware> {
///         Box::new(self.clone())
///     }
/// }
/// ```
pub trait TabInitMiddleware: Debug + Send + Sync {
    /// Apply CDP operations to a tab that has not navigated yet
    ///
    /// # Returns
    /// * `Ok(())` if middleware applied successfully
    /// * `Err` if the tab must not be used for crawling
    fn apply(&self, tab: &Tab) -> Result<()>;

    /// Get unique identifier for this middleware (used in logging)
    fn name(&self) -> &str;

    /// Standard implementation: `Box::new(self.clone())`
    fn clone_box(&self) -> Box<dyn TabInitMiddleware>;
}

impl Clone for Box<dyn TabInitMiddleware> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Standard Chrome arguments for crawling workers
///
/// - Container compatibility (--no-sandbox, --disable-dev-shm-usage)
/// - Automation markers hidden
/// - Desktop window size
/// - No background throttling (the challenge widget keeps running)
/// - Bounded JS heap
#[derive(Debug, Clone)]
pub struct DefaultBinaryParamsMiddleware;

impl BrowserBinaryParamsMiddleware for DefaultBinaryParamsMiddleware {
    fn apply_args(&self, args: &mut Vec<&'static OsStr>, headless: bool) {
        args.push(OsStr::new("--no-sandbox"));
        args.push(OsStr::new("--disable-dev-shm-usage"));

        args.push(OsStr::new("--disable-blink-features=AutomationControlled"));
        args.push(OsStr::new("--exclude-switches=enable-automation"));

        args.push(OsStr::new("--window-size=1920,1080"));

        args.push(OsStr::new("--no-first-run"));
        args.push(OsStr::new("--no-default-browser-check"));
        args.push(OsStr::new("--disable-extensions"));

        args.push(OsStr::new("--disable-background-timer-throttling"));
        args.push(OsStr::new("--disable-backgrounding-occluded-windows"));
        args.push(OsStr::new("--disable-renderer-backgrounding"));

        args.push(OsStr::new("--js-flags=--max-old-space-size=512"));

        if !headless {
            args.push(OsStr::new("--disable-infobars"));
        }
    }

    fn name(&self) -> &str {
        "default_binary_params"
    }

    fn clone_box(&self) -> Box<dyn BrowserBinaryParamsMiddleware> {
        Box::new(self.clone())
    }
}

/// Replaces "HeadlessChrome" in the User-Agent with "Chrome"
///
/// The corrected UA is detected on the first tab and reused afterwards.
/// Does nothing in headful mode.
#[derive(Debug)]
pub struct UserAgentOverrideMiddleware {
    pub headless: bool,
    corrected_user_agent: Mutex<Option<String>>,
}

impl UserAgentOverrideMiddleware {
    pub fn new(headless: bool) -> Self {
        Self {
            headless,
            corrected_user_agent: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<String> {
        self.corrected_user_agent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Clone for UserAgentOverrideMiddleware {
    fn clone(&self) -> Self {
        Self {
            headless: self.headless,
            corrected_user_agent: Mutex::new(self.cached()),
        }
    }
}

impl TabInitMiddleware for UserAgentOverrideMiddleware {
    fn apply(&self, tab: &Tab) -> Result<()> {
        if !self.headless {
            return Ok(());
        }

        let corrected_ua = match self.cached() {
            Some(ua) => ua,
            None => {
                let result = tab
                    .evaluate("navigator.userAgent", false)
                    .map_err(|e| anyhow::anyhow!("Failed to evaluate navigator.userAgent: {}", e))?;
                let original = result
                    .value
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("navigator.userAgent is not a string"))?;
                let corrected = original.replace("HeadlessChrome", "Chrome");
                tracing::debug!("Corrected UA: {}", corrected);

                *self
                    .corrected_user_agent
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(corrected.clone());
                corrected
            }
        };

        use headless_chrome::protocol::cdp::Network;

        tab.call_method(Network::SetUserAgentOverride {
            user_agent: corrected_ua,
            accept_language: None,
            platform: None,
            user_agent_metadata: None,
        })?;

        Ok(())
    }

    fn name(&self) -> &str {
        "user_agent_override"
    }

    fn clone_box(&self) -> Box<dyn TabInitMiddleware> {
        Box::new(self.clone())
    }
}

/// Installs the resource policy as a Fetch request interceptor.
///
/// Every request the tab makes for the rest of its life is paused, classified
/// and then continued or failed with `BlockedByClient`. Must run before the
/// tab's first navigation.
#[derive(Debug, Clone)]
pub struct ResourceFilterMiddleware {
    policy: Arc<ResourcePolicy>,
    counters: Arc<FilterCounters>,
    /// Also answer proxy auth challenges through the Fetch domain
    handle_auth: bool,
}

impl ResourceFilterMiddleware {
    pub fn new(policy: Arc<ResourcePolicy>, counters: Arc<FilterCounters>, handle_auth: bool) -> Self {
        Self {
            policy,
            counters,
            handle_auth,
        }
    }
}

/// Map a CDP resource type onto the policy's resource classes
pub fn resource_class(resource_type: &ResourceType) -> ResourceClass {
    match resource_type {
        ResourceType::Document => ResourceClass::Document,
        ResourceType::Stylesheet => ResourceClass::Stylesheet,
        ResourceType::Image => ResourceClass::Image,
        ResourceType::Media => ResourceClass::Media,
        ResourceType::Font => ResourceClass::Font,
        ResourceType::Script => ResourceClass::Script,
        _ => ResourceClass::Other,
    }
}

impl TabInitMiddleware for ResourceFilterMiddleware {
    fn apply(&self, tab: &Tab) -> Result<()> {
        let policy = self.policy.clone();
        let counters = self.counters.clone();

        let interceptor = Arc::new(
            move |_transport: Arc<Transport>,
                  _session_id: SessionId,
                  event: RequestPausedEvent|
                  -> RequestPausedDecision {
                let class = resource_class(&event.params.resource_Type);
                let decision = policy.evaluate(class, &event.params.request.url);
                counters.record(decision);

                match decision {
                    FilterDecision::Allow => RequestPausedDecision::Continue(None),
                    FilterDecision::Block => RequestPausedDecision::Fail(FailRequest {
                        request_id: event.params.request_id,
                        error_reason: ErrorReason::BlockedByClient,
                    }),
                }
            },
        );

        tab.enable_request_interception(interceptor)?;
        tab.enable_fetch(None, Some(self.handle_auth))?;
        Ok(())
    }

    fn name(&self) -> &str {
        "resource_filter"
    }

    fn clone_box(&self) -> Box<dyn TabInitMiddleware> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_class_mapping() {
        assert_eq!(resource_class(&ResourceType::Image), ResourceClass::Image);
        assert_eq!(resource_class(&ResourceType::Document), ResourceClass::Document);
        assert_eq!(resource_class(&ResourceType::Other), ResourceClass::Other);
    }

    #[test]
    fn test_default_binary_params() {
        let mut args = Vec::new();
        DefaultBinaryParamsMiddleware.apply_args(&mut args, true);
        assert!(args.contains(&OsStr::new("--no-sandbox")));
        assert!(!args.contains(&OsStr::new("--disable-infobars")));

        let mut headful = Vec::new();
        DefaultBinaryParamsMiddleware.apply_args(&mut headful, false);
        assert!(headful.contains(&OsStr::new("--disable-infobars")));
    }
}
