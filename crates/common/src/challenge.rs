//! Challenge signature policy.
//!
//! A signature decides, from a snapshot of the page, whether an anti-bot
//! interstitial is showing and whether it has been resolved. Challenge
//! providers change their markup over time, so signatures are trait objects
//! kept in a registry and can be replaced without touching the waiter.

use scraper::{Html, Selector};
use std::fmt::Debug;
use std::sync::Arc;

/// Rendered state of a page at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSnapshot {
    pub url: String,
    pub markup: String,
}

impl PageSnapshot {
    pub fn new(url: impl Into<String>, markup: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            markup: markup.into(),
        }
    }
}

/// Detects a challenge screen and its resolution marker
///
/// # Example
///
/// ```rust
/// use crawl_hive_common::challenge::{ChallengeSignature, PageSnapshot};
///
/// #[derive(Debug, Clone)]
/// struct InterstitialTitle;
///
/// impl ChallengeSignature for InterstitialTitle {
///     fn detect(&self, page: &PageSnapshot) -> bool {
///         page.markup.contains("<title>Checking your browser</title>")
///     }
///
///     fn is_resolved(&self, page: &PageSnapshot) -> bool {
///         !self.detect(page)
///     }
///
///     fn name(&self) -> &str {
///         "interstitial_title"
///     }
///
///     fn clone_box(&self) -> Box<dyn ChallengeSignature> {
///         Box::new(self.clone())
///     }
/// }
/// ```
pub trait ChallengeSignature: Debug + Send + Sync {
    /// True when the page shows this challenge
    fn detect(&self, page: &PageSnapshot) -> bool;

    /// True once the challenge on the page has been solved or removed
    fn is_resolved(&self, page: &PageSnapshot) -> bool;

    /// Get unique identifier for this signature (used in logging)
    fn name(&self) -> &str;

    fn clone_box(&self) -> Box<dyn ChallengeSignature>;
}

impl Clone for Box<dyn ChallengeSignature> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Signature driven by CSS selectors and raw text markers.
///
/// Detected when any `challenge_selectors` or `challenge_texts` entry matches.
/// Resolved when any `resolved_selectors` entry matches, or when no challenge
/// marker is left on the page.
#[derive(Debug, Clone)]
pub struct SelectorSignature {
    pub name: String,
    pub challenge_selectors: Vec<String>,
    pub challenge_texts: Vec<String>,
    pub resolved_selectors: Vec<String>,
}

impl SelectorSignature {
    /// Cloudflare Turnstile widget
    pub fn turnstile() -> Self {
        Self {
            name: "cloudflare_turnstile".to_string(),
            challenge_selectors: vec![
                "div.cf-turnstile".to_string(),
                r#"iframe[src*="challenges.cloudflare.com"]"#.to_string(),
            ],
            challenge_texts: vec!["<title>Just a moment...</title>".to_string()],
            resolved_selectors: vec![
                r#"input[name="cf-turnstile-response"][value]:not([value=""])"#.to_string(),
            ],
        }
    }

    fn any_selector_matches(document: &Html, selectors: &[String]) -> bool {
        selectors.iter().any(|raw| match Selector::parse(raw) {
            Ok(selector) => document.select(&selector).next().is_some(),
            Err(e) => {
                tracing::warn!("Ignoring invalid challenge selector '{}': {:?}", raw, e);
                false
            }
        })
    }

    fn has_challenge_marker(&self, page: &PageSnapshot, document: &Html) -> bool {
        self.challenge_texts
            .iter()
            .any(|text| page.markup.contains(text.as_str()))
            || Self::any_selector_matches(document, &self.challenge_selectors)
    }
}

impl ChallengeSignature for SelectorSignature {
    fn detect(&self, page: &PageSnapshot) -> bool {
        let document = Html::parse_document(&page.markup);
        self.has_challenge_marker(page, &document)
    }

    fn is_resolved(&self, page: &PageSnapshot) -> bool {
        let document = Html::parse_document(&page.markup);
        Self::any_selector_matches(&document, &self.resolved_selectors)
            || !self.has_challenge_marker(page, &document)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn clone_box(&self) -> Box<dyn ChallengeSignature> {
        Box::new(self.clone())
    }
}

/// Ordered set of known challenge signatures
#[derive(Debug, Clone)]
pub struct ChallengeSignatureRegistry {
    signatures: Vec<Arc<dyn ChallengeSignature>>,
}

impl Default for ChallengeSignatureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeSignatureRegistry {
    /// Registry with the built-in Turnstile signature
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SelectorSignature::turnstile()));
        registry
    }

    pub fn empty() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    /// Add a signature; earlier registrations are checked first
    pub fn register(&mut self, signature: Arc<dyn ChallengeSignature>) {
        self.signatures.push(signature);
    }

    /// First signature that recognises a challenge on the page
    pub fn detect(&self, page: &PageSnapshot) -> Option<Arc<dyn ChallengeSignature>> {
        self.signatures.iter().find(|s| s.detect(page)).cloned()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &str = r#"<html><head><title>Just a moment...</title></head>
        <body><div class="cf-turnstile" data-sitekey="x"></div>
        <input type="hidden" name="cf-turnstile-response" value=""></body></html>"#;

    const TOKEN_SET: &str = r#"<html><head><title>Just a moment...</title></head>
        <body><div class="cf-turnstile" data-sitekey="x"></div>
        <input type="hidden" name="cf-turnstile-response" value="0.abc"></body></html>"#;

    const REAL_PAGE: &str =
        r#"<html><head><title>Specs</title></head><body><h3 class="posts_title">CBR</h3></body></html>"#;

    #[test]
    fn test_turnstile_detected() {
        let signature = SelectorSignature::turnstile();
        assert!(signature.detect(&PageSnapshot::new("https://example.com", CHALLENGE)));
        assert!(!signature.detect(&PageSnapshot::new("https://example.com", REAL_PAGE)));
    }

    #[test]
    fn test_turnstile_resolution_markers() {
        let signature = SelectorSignature::turnstile();
        assert!(!signature.is_resolved(&PageSnapshot::new("https://example.com", CHALLENGE)));
        assert!(signature.is_resolved(&PageSnapshot::new("https://example.com", TOKEN_SET)));
        assert!(signature.is_resolved(&PageSnapshot::new("https://example.com", REAL_PAGE)));
    }

    #[test]
    fn test_registry_detects_first_matching_signature() {
        let mut registry = ChallengeSignatureRegistry::empty();
        assert!(registry
            .detect(&PageSnapshot::new("https://example.com", CHALLENGE))
            .is_none());

        registry.register(Arc::new(SelectorSignature {
            name: "custom".to_string(),
            challenge_selectors: vec!["div.captcha-box".to_string()],
            challenge_texts: vec![],
            resolved_selectors: vec![],
        }));
        registry.register(Arc::new(SelectorSignature::turnstile()));

        let found = registry
            .detect(&PageSnapshot::new("https://example.com", CHALLENGE))
            .unwrap();
        assert_eq!(found.name(), "cloudflare_turnstile");
        assert_eq!(registry.len(), 2);
    }
}
