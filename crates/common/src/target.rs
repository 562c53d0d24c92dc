use crate::utils::{extract_domain, sanitize_segment};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex digits of the URL digest appended to every artifact name
const ARTIFACT_DIGEST_LEN: usize = 12;

/// Reasons a line of input is not accepted as a crawl target
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetUrlError {
    #[error("malformed URL: {0}")]
    Malformed(String),
    #[error("unsupported scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

/// A URL read from input together with the category its artifact is filed under.
///
/// Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetUrl {
    url: String,
    category: String,
    artifact_stem: String,
}

impl TargetUrl {
    /// Validate `raw` and derive its category.
    ///
    /// For paths shaped `/<prefix>/<category>/<rest..>` where `<prefix>` is one of
    /// `category_prefixes`, the category is the segment after the prefix and the
    /// artifact stem is `<rest>` joined with `-`. Otherwise the category is the
    /// host and the stem is built from the whole path. The stem is lossy, so
    /// the artifact name also carries a digest of the full URL.
    pub fn parse(raw: &str, category_prefixes: &[String]) -> Result<Self, TargetUrlError> {
        let raw = raw.trim();
        let parsed =
            url::Url::parse(raw).map_err(|e| TargetUrlError::Malformed(e.to_string()))?;

        match parsed.scheme() {
            "http" | "https" => {}
            other => return Err(TargetUrlError::UnsupportedScheme(other.to_string())),
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(TargetUrlError::MissingHost);
        }

        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).collect())
            .unwrap_or_default();

        let prefixed = segments.len() >= 3
            && category_prefixes.iter().any(|prefix| prefix == segments[0]);

        let (category, mut stem) = if prefixed {
            (sanitize_segment(segments[1]), join_segments(&segments[2..]))
        } else {
            let domain =
                extract_domain(raw).map_err(|e| TargetUrlError::Malformed(e.to_string()))?;
            let stem = if segments.is_empty() {
                "index".to_string()
            } else {
                join_segments(&segments)
            };
            (sanitize_segment(&domain), stem)
        };

        let bare = stem
            .strip_suffix(".html")
            .filter(|bare| !bare.is_empty())
            .map(str::to_string);
        if let Some(bare) = bare {
            stem = bare;
        }
        let digest = format!("{:x}", Sha256::digest(raw.as_bytes()));
        stem.push('-');
        stem.push_str(&digest[..ARTIFACT_DIGEST_LEN]);

        Ok(Self {
            url: raw.to_string(),
            category,
            artifact_stem: stem,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// File name for the raw artifact inside the category directory.
    ///
    /// Distinct URLs never share a name.
    pub fn artifact_name(&self) -> String {
        format!("{}.html", self.artifact_stem)
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn join_segments(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| sanitize_segment(s))
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["car-specs".to_string(), "motorcycles-specs".to_string()]
    }

    /// Artifact name without the URL digest
    fn readable(target: &TargetUrl) -> String {
        let name = target.artifact_name();
        let stem = name.trim_end_matches(".html");
        let (readable, digest) = stem.rsplit_once('-').unwrap();
        assert_eq!(digest.len(), ARTIFACT_DIGEST_LEN);
        readable.to_string()
    }

    #[test]
    fn test_prefixed_path_uses_manufacturer() {
        let target = TargetUrl::parse(
            "https://www.example.com/motorcycles-specs/honda/cbr600rr-2007",
            &prefixes(),
        )
        .unwrap();
        assert_eq!(target.category(), "honda");
        assert_eq!(readable(&target), "cbr600rr-2007");
    }

    #[test]
    fn test_car_specs_joins_remaining_segments() {
        let target = TargetUrl::parse(
            "https://example.com/car-specs/bmw/12345/m3-coupe",
            &prefixes(),
        )
        .unwrap();
        assert_eq!(target.category(), "bmw");
        assert_eq!(readable(&target), "12345-m3-coupe");

        let with_ext = TargetUrl::parse(
            "https://example.com/car-specs/bmw/12345/m3-coupe.html",
            &prefixes(),
        )
        .unwrap();
        assert_eq!(readable(&with_ext), "12345-m3-coupe");
        assert!(!with_ext.artifact_name().contains(".html-"));
        assert_ne!(with_ext.artifact_name(), target.artifact_name());
    }

    #[test]
    fn test_falls_back_to_domain() {
        let target = TargetUrl::parse("https://www.shop.example.org/", &prefixes()).unwrap();
        assert_eq!(target.category(), "shop.example.org");
        assert_eq!(readable(&target), "index");

        let short = TargetUrl::parse("https://example.org/car-specs/bmw", &prefixes()).unwrap();
        assert_eq!(short.category(), "example.org");
        assert_eq!(readable(&short), "car-specs-bmw");
    }

    #[test]
    fn test_lossy_paths_get_distinct_names() {
        let parse = |raw: &str| TargetUrl::parse(raw, &prefixes()).unwrap();
        let pairs = [
            ("https://example.com/catalog?page=1", "https://example.com/catalog?page=2"),
            ("https://example.com/a/b", "https://example.com/a-b"),
            ("https://example.com/x y", "https://example.com/x_y"),
            (
                "https://example.com/car-specs/honda/cbr",
                "https://example.com/motorcycles-specs/honda/cbr",
            ),
        ];

        for (left, right) in pairs {
            let (left, right) = (parse(left), parse(right));
            assert_eq!(left.category(), right.category());
            assert_ne!(left.artifact_name(), right.artifact_name());
        }

        let again = parse("https://example.com/catalog?page=1");
        assert_eq!(
            again.artifact_name(),
            parse("https://example.com/catalog?page=1").artifact_name()
        );
    }

    #[test]
    fn test_rejects_invalid_input() {
        assert_eq!(
            TargetUrl::parse("ftp://example.com/file", &prefixes()),
            Err(TargetUrlError::UnsupportedScheme("ftp".to_string()))
        );
        assert!(matches!(
            TargetUrl::parse("example.com/no-scheme", &prefixes()),
            Err(TargetUrlError::Malformed(_))
        ));
    }
}
