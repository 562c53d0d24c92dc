use anyhow::{Context, Result};
use crawl_hive_common::TargetUrl;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Parsed input plus what was dropped on the way
#[derive(Debug, Clone, Default)]
pub struct TargetList {
    pub targets: Vec<TargetUrl>,
    pub invalid: usize,
    pub duplicates: usize,
    pub truncated: usize,
}

/// Parse a newline-delimited URL list.
///
/// Blank lines and `#` comments are ignored, invalid URLs are logged and
/// counted, duplicates keep their first occurrence and the list is cut at
/// `max_total_urls`.
pub fn parse_targets(raw: &str, category_prefixes: &[String], max_total_urls: usize) -> TargetList {
    let mut list = TargetList::default();
    let mut seen = HashSet::new();

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let target = match TargetUrl::parse(line, category_prefixes) {
            Ok(target) => target,
            Err(e) => {
                warn!(line = index + 1, "Skipping invalid URL '{}': {}", line, e);
                list.invalid += 1;
                continue;
            }
        };

        if !seen.insert(target.url().to_string()) {
            list.duplicates += 1;
            continue;
        }

        if list.targets.len() >= max_total_urls {
            list.truncated += 1;
            continue;
        }
        list.targets.push(target);
    }

    if list.truncated > 0 {
        warn!(
            "Input truncated to {} URL(s), {} dropped",
            max_total_urls, list.truncated
        );
    }
    info!(
        "URL validation: {} valid unique URL(s), {} invalid, {} duplicate(s)",
        list.targets.len(),
        list.invalid,
        list.duplicates
    );
    list
}

pub fn read_targets(path: &Path, category_prefixes: &[String], max_total_urls: usize) -> Result<TargetList> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read URL list {}", path.display()))?;
    Ok(parse_targets(&raw, category_prefixes, max_total_urls))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        vec!["car-specs".to_string()]
    }

    #[test]
    fn test_parse_skips_noise_and_duplicates() {
        let raw = "\
# models to crawl
https://www.ultimatespecs.com/car-specs/BMW/123/m3.html

https://www.ultimatespecs.com/car-specs/BMW/123/m3.html
ftp://example.com/file
not a url
https://example.com/about
";
        let list = parse_targets(raw, &prefixes(), 100);

        assert_eq!(list.targets.len(), 2);
        assert_eq!(list.duplicates, 1);
        assert_eq!(list.invalid, 2);
        assert_eq!(list.targets[0].category(), "BMW");
        assert_eq!(list.targets[1].category(), "example.com");
    }

    #[test]
    fn test_parse_truncates() {
        let raw = (0..5)
            .map(|i| format!("https://example.com/{}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let list = parse_targets(&raw, &prefixes(), 3);

        assert_eq!(list.targets.len(), 3);
        assert_eq!(list.truncated, 2);
        assert_eq!(list.targets[2].url(), "https://example.com/2");
    }

    #[test]
    fn test_read_missing_file_errors() {
        assert!(read_targets(Path::new("/nonexistent/urls.txt"), &prefixes(), 10).is_err());
    }
}
