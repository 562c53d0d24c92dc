/// Extract the host of a URL without a leading `www.`
pub fn extract_domain(url: &str) -> anyhow::Result<String> {
    let host = url::Url::parse(url)?
        .host_str()
        .map(|h| h.to_ascii_lowercase())
        .ok_or_else(|| anyhow::anyhow!("No host in URL"))?;
    Ok(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Reduce a path segment to characters safe for a file or directory name
pub fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}
