use anyhow::{Context, Result};
use std::fmt::Debug;

/// Proxy settings handed to a browser at launch
///
/// `server` is passed to Chrome's `--proxy-server` without credentials;
/// credentials are answered through the Fetch auth flow instead.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// `scheme://host:port`, None for a direct connection
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Direct connection
    pub fn direct() -> Self {
        Self::default()
    }

    /// Parse `scheme://[user:pass@]host:port`
    pub fn from_url(raw: &str) -> Result<Self> {
        let parsed = url::Url::parse(raw).with_context(|| format!("Invalid proxy URL '{}'", raw))?;
        let host = parsed
            .host_str()
            .with_context(|| format!("Proxy URL '{}' has no host", raw))?;
        let server = match parsed.port() {
            Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
            None => format!("{}://{}", parsed.scheme(), host),
        };

        let username = Some(parsed.username())
            .filter(|u| !u.is_empty())
            .map(decode_component);
        let password = parsed.password().map(decode_component);

        Ok(Self {
            server: Some(server),
            username,
            password,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.server.is_some()
    }

    /// (username, password) when both are present
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

fn decode_component(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", value.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| value.to_string())
}

/// Source of proxy settings for new workers
///
/// Called once per worker launch with the worker's id, so providers backed
/// by a list can hand successive workers different proxies. A URL that is
/// redispatched after a worker failure lands on a new worker and may
/// therefore leave through a different proxy.
pub trait ProxyProvider: Debug + Send + Sync {
    fn config_for_worker(&self, worker_id: u64) -> Result<ProxyConfig>;

    /// Get unique identifier for this provider (used in logging)
    fn name(&self) -> &str;

    /// Clone this provider into a Box
    ///
    /// Standard implementation: `Box::new(self.clone())`
    fn clone_box(&self) -> Box<dyn ProxyProvider>;
}

impl Clone for Box<dyn ProxyProvider> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
