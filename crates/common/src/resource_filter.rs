//! Per-request allow/block policy applied to every network request a worker makes.
//!
//! The policy is a pure function of (resource class, url, policy). Counting of
//! decisions is kept separately in [`FilterCounters`] so the policy itself
//! stays stateless across requests.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Category of a network request as reported by the browser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Document,
    Stylesheet,
    Image,
    Media,
    Font,
    Script,
    Other,
}

impl FromStr for ResourceClass {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "document" => Ok(Self::Document),
            "stylesheet" => Ok(Self::Stylesheet),
            "image" => Ok(Self::Image),
            "media" => Ok(Self::Media),
            "font" => Ok(Self::Font),
            "script" => Ok(Self::Script),
            "other" => Ok(Self::Other),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDecision {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRule {
    pub class: ResourceClass,
    pub decision: FilterDecision,
}

impl ResourceRule {
    pub fn block(class: ResourceClass) -> Self {
        Self {
            class,
            decision: FilterDecision::Block,
        }
    }

    pub fn allow(class: ResourceClass) -> Self {
        Self {
            class,
            decision: FilterDecision::Allow,
        }
    }
}

/// Ordered allow/block rules with override patterns.
///
/// Evaluation order:
/// 1. `challenge_patterns` (always allowed so a challenge can render)
/// 2. `allow_patterns` (operator overrides)
/// 3. first rule whose class matches
/// 4. `block_patterns` (URL substrings, never applied to documents)
/// 5. allow
///
/// Patterns are matched as case-insensitive substrings of the request URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePolicy {
    pub rules: Vec<ResourceRule>,
    pub challenge_patterns: Vec<String>,
    pub allow_patterns: Vec<String>,
    pub block_patterns: Vec<String>,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                ResourceRule::block(ResourceClass::Stylesheet),
                ResourceRule::block(ResourceClass::Image),
                ResourceRule::block(ResourceClass::Font),
                ResourceRule::block(ResourceClass::Media),
            ],
            challenge_patterns: vec![
                "challenges.cloudflare.com".to_string(),
                "turnstile".to_string(),
            ],
            allow_patterns: vec!["/cargallery/".to_string()],
            block_patterns: [
                ".css", ".webp", ".jpg", ".jpeg", ".png", ".svg", ".gif", ".woff", ".woff2",
                ".pdf", ".zip",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

impl ResourcePolicy {
    /// A policy that lets every request through
    pub fn allow_all() -> Self {
        Self {
            rules: Vec::new(),
            challenge_patterns: Vec::new(),
            allow_patterns: Vec::new(),
            block_patterns: Vec::new(),
        }
    }

    pub fn evaluate(&self, class: ResourceClass, url: &str) -> FilterDecision {
        let url = url.to_lowercase();

        if matches_any(&self.challenge_patterns, &url) || matches_any(&self.allow_patterns, &url)
        {
            return FilterDecision::Allow;
        }

        if let Some(rule) = self.rules.iter().find(|rule| rule.class == class) {
            return rule.decision;
        }

        if class != ResourceClass::Document && matches_any(&self.block_patterns, &url) {
            return FilterDecision::Block;
        }

        FilterDecision::Allow
    }
}

fn matches_any(patterns: &[String], lowercase_url: &str) -> bool {
    patterns
        .iter()
        .any(|p| !p.is_empty() && lowercase_url.contains(&p.to_lowercase()))
}

/// Decision counters for one worker's filter
#[derive(Debug, Default)]
pub struct FilterCounters {
    allowed: AtomicU64,
    blocked: AtomicU64,
}

impl FilterCounters {
    pub fn record(&self, decision: FilterDecision) {
        match decision {
            FilterDecision::Allow => self.allowed.fetch_add(1, Ordering::Relaxed),
            FilterDecision::Block => self.blocked.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// (allowed, blocked)
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.allowed.load(Ordering::Relaxed),
            self.blocked.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_blocks_heavy_classes() {
        let policy = ResourcePolicy::default();
        for class in [
            ResourceClass::Stylesheet,
            ResourceClass::Image,
            ResourceClass::Font,
            ResourceClass::Media,
        ] {
            assert_eq!(
                policy.evaluate(class, "https://cdn.example.com/asset"),
                FilterDecision::Block
            );
        }
        assert_eq!(
            policy.evaluate(ResourceClass::Document, "https://example.com/page"),
            FilterDecision::Allow
        );
        assert_eq!(
            policy.evaluate(ResourceClass::Script, "https://example.com/app.js"),
            FilterDecision::Allow
        );
    }

    #[test]
    fn test_challenge_domains_always_allowed() {
        let policy = ResourcePolicy::default();
        assert_eq!(
            policy.evaluate(
                ResourceClass::Image,
                "https://challenges.cloudflare.com/cdn-cgi/challenge-platform/img.png"
            ),
            FilterDecision::Allow
        );
        assert_eq!(
            policy.evaluate(ResourceClass::Stylesheet, "https://example.com/TurnStile/widget.css"),
            FilterDecision::Allow
        );
    }

    #[test]
    fn test_operator_allow_pattern_overrides_rules() {
        let policy = ResourcePolicy::default();
        assert_eq!(
            policy.evaluate(ResourceClass::Image, "https://example.com/cargallery/1.jpg"),
            FilterDecision::Allow
        );
    }

    #[test]
    fn test_block_patterns_skip_documents() {
        let policy = ResourcePolicy::default();
        assert_eq!(
            policy.evaluate(ResourceClass::Other, "https://example.com/font.woff2"),
            FilterDecision::Block
        );
        assert_eq!(
            policy.evaluate(ResourceClass::Document, "https://example.com/brochure.pdf"),
            FilterDecision::Allow
        );
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = ResourcePolicy {
            rules: vec![
                ResourceRule::allow(ResourceClass::Image),
                ResourceRule::block(ResourceClass::Image),
            ],
            ..ResourcePolicy::allow_all()
        };
        assert_eq!(
            policy.evaluate(ResourceClass::Image, "https://example.com/a.png"),
            FilterDecision::Allow
        );
    }

    #[test]
    fn test_counters() {
        let counters = FilterCounters::default();
        counters.record(FilterDecision::Allow);
        counters.record(FilterDecision::Block);
        counters.record(FilterDecision::Block);
        assert_eq!(counters.snapshot(), (1, 2));
    }
}
