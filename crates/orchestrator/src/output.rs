use anyhow::{Context, Result};
use crawl_hive_common::TargetUrl;
use std::path::{Path, PathBuf};

/// Receives the raw content of every successful fetch, exactly once per fetch
pub trait ArtifactWriter: Send + Sync {
    /// Store `content` for `target`; returns where it went
    fn write(&self, target: &TargetUrl, content: &str) -> Result<PathBuf>;

    fn name(&self) -> &str;
}

/// Writes `<root>/<category>/<artifact name>`
#[derive(Debug, Clone)]
pub struct FsArtifactWriter {
    root: PathBuf,
}

impl FsArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, target: &TargetUrl) -> PathBuf {
        self.root
            .join(target.category())
            .join(target.artifact_name())
    }
}

impl ArtifactWriter for FsArtifactWriter {
    fn write(&self, target: &TargetUrl, content: &str) -> Result<PathBuf> {
        let path = self.artifact_path(target);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::debug!(url = %target, "Saved {} bytes to {}", content.len(), path.display());
        Ok(path)
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}
