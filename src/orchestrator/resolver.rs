//! Resolution of artifact references to local media files.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::OrchestratorError;

/// Turns the caller's artifact reference into the path of the media file a
/// task will read.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn resolve(&self, artifact_ref: &str) -> Result<PathBuf, OrchestratorError>;
}

/// Treats references as file paths, optionally relative to a base directory.
#[derive(Debug, Clone, Default)]
pub struct PathResolver {
    base: Option<PathBuf>,
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
        }
    }

    fn candidate(&self, artifact_ref: &str) -> PathBuf {
        let path = Path::new(artifact_ref);
        match &self.base {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl ArtifactResolver for PathResolver {
    async fn resolve(&self, artifact_ref: &str) -> Result<PathBuf, OrchestratorError> {
        let path = self.candidate(artifact_ref);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(std::path::absolute(&path).unwrap_or(path)),
            _ => Err(OrchestratorError::ArtifactNotFound(artifact_ref.to_string())),
        }
    }
}
