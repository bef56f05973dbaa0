//! File sources for the TFTP service

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Trait for providing files to the TFTP server
#[async_trait]
pub trait FileProvider: Send + Sync {
    /// Full contents of `path`, or `None` if it cannot be served
    async fn read(&self, path: &str) -> Option<Bytes>;
}

/// Serves files below a directory
#[derive(Debug, Clone)]
pub struct DirectoryFileProvider {
    root: PathBuf,
}

impl DirectoryFileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client path below the root; anything but plain components is refused
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !plain || relative.as_os_str().is_empty() {
            warn!(path = %path, "Blocked path traversal attempt");
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl FileProvider for DirectoryFileProvider {
    async fn read(&self, path: &str) -> Option<Bytes> {
        let full_path = self.resolve(path)?;
        match tokio::fs::read(&full_path).await {
            Ok(contents) => Some(Bytes::from(contents)),
            Err(e) => {
                debug!(path = %full_path.display(), error = %e, "TFTP file unavailable");
                None
            }
        }
    }
}
