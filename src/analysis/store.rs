//! Artifact persistence.
//!
//! Results are committed only after every pipeline stage succeeded. The
//! filesystem store writes each file under a temporary name first and renames
//! it into place, so a reader never sees a partially written image. If a
//! rename fails, images already moved into place are removed again.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AnalysisError;

/// Directory holding equalized display images.
pub const PREPROCESSED_DIR: &str = "preprocessed-image";

/// Directory holding lesion overlays.
pub const PREDICTED_DIR: &str = "predicted-image";

/// Encoded images produced for one request.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub preprocessed_jpeg: Bytes,
    pub overlay_jpeg: Bytes,
}

/// Destination for the images of completed analyses.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist both images of a request, all or nothing.
    async fn commit(&self, request_id: Uuid, artifacts: &Artifacts) -> Result<(), AnalysisError>;
}

// =============================================================================
// Filesystem Store
// =============================================================================

/// Stores artifacts as `<root>/preprocessed-image/<uuid>.jpg` and
/// `<root>/predicted-image/<uuid>.jpg`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the output directories if they do not exist.
    pub async fn ensure_dirs(&self) -> Result<(), AnalysisError> {
        for dir in [PREPROCESSED_DIR, PREDICTED_DIR] {
            let path = self.root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|source| AnalysisError::IoFailure { path, source })?;
        }
        Ok(())
    }

    pub fn preprocessed_path(&self, request_id: Uuid) -> PathBuf {
        self.root
            .join(PREPROCESSED_DIR)
            .join(format!("{}.jpg", request_id))
    }

    pub fn predicted_path(&self, request_id: Uuid) -> PathBuf {
        self.root
            .join(PREDICTED_DIR)
            .join(format!("{}.jpg", request_id))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn commit(&self, request_id: Uuid, artifacts: &Artifacts) -> Result<(), AnalysisError> {
        let targets = [
            (self.preprocessed_path(request_id), &artifacts.preprocessed_jpeg),
            (self.predicted_path(request_id), &artifacts.overlay_jpeg),
        ];

        // Stage both files before renaming either.
        let mut staged = Vec::with_capacity(targets.len());
        for (target, data) in &targets {
            let temp = temp_path(target);
            if let Err(source) = tokio::fs::write(&temp, data.as_ref()).await {
                discard(&staged).await;
                discard(&[temp.clone()]).await;
                return Err(AnalysisError::IoFailure { path: temp, source });
            }
            staged.push(temp);
        }

        let mut committed = Vec::with_capacity(targets.len());
        for ((target, _), temp) in targets.iter().zip(&staged) {
            if let Err(source) = tokio::fs::rename(temp, target).await {
                discard(&staged).await;
                discard(&committed).await;
                return Err(AnalysisError::IoFailure {
                    path: target.clone(),
                    source,
                });
            }
            committed.push(target.clone());
        }

        debug!(request_id = %request_id, root = %self.root.display(), "Committed artifacts");
        Ok(())
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn discard(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove staged artifact");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
