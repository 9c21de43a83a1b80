//! Filesystem-backed artifact store.

use super::{ArtifactStore, StorageError, StorageRef};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Suffix of the JSON sidecar written next to every object.
const METADATA_SUFFIX: &str = ".meta.json";

/// Metadata recorded alongside a stored upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Declared MIME type.
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the content.
    pub sha256: String,
    /// Time the object was written.
    pub created_at: DateTime<Utc>,
}

/// Stores uploads as plain files under a root directory.
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        info!("Artifact store rooted at {}", root.display());
        Self { root }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read back the metadata sidecar of an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the sidecar is missing or unreadable.
    pub async fn metadata(&self, reference: &StorageRef) -> Result<ArtifactMetadata, StorageError> {
        let path = self.resolve(reference.as_str())?;
        let raw = fs::read(sidecar(&path))
            .await
            .map_err(|e| StorageError::InvalidPath(format!("metadata unavailable: {e}")))?;
        serde_json::from_slice(&raw)
            .map_err(|e| StorageError::InvalidPath(format!("metadata corrupt: {e}")))
    }

    /// Map a store-relative path to a filesystem path, refusing anything that
    /// could leave the root.
    fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let relative_path = Path::new(relative);
        let safe = !relative.is_empty()
            && relative_path
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(relative_path))
    }
}

fn sidecar(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(METADATA_SUFFIX);
    PathBuf::from(name)
}

#[async_trait]
impl ArtifactStore for LocalFsStore {
    fn backend_tag(&self) -> &'static str {
        "local-fs"
    }

    async fn save(
        &self,
        path: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<StorageRef, StorageError> {
        let target = self.resolve(path)?;
        let write_failed = |e: std::io::Error| {
            warn!("Artifact write to {} failed: {e}", target.display());
            StorageError::WriteFailed(e.to_string())
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(write_failed)?;
        }

        // Write to a temp name and rename so readers never see partial files.
        let mut partial = target.as_os_str().to_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        fs::write(&partial, &bytes).await.map_err(write_failed)?;
        if let Err(e) = fs::rename(&partial, &target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(write_failed(e));
        }

        let metadata = ArtifactMetadata {
            content_type: mime_type.to_string(),
            size: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(&bytes)),
            created_at: Utc::now(),
        };
        let encoded = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        if let Err(e) = fs::write(sidecar(&target), encoded).await {
            let _ = fs::remove_file(&target).await;
            return Err(write_failed(e));
        }

        debug!(
            "Stored {} ({} bytes, {mime_type})",
            target.display(),
            metadata.size
        );
        Ok(StorageRef::new(path))
    }

    async fn delete(&self, reference: &StorageRef) -> Result<(), StorageError> {
        let target = self.resolve(reference.as_str())?;

        match fs::remove_file(&target).await {
            Ok(()) => debug!("Deleted {}", target.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} already deleted or not found", target.display());
            }
            Err(e) => return Err(StorageError::DeleteFailed(e.to_string())),
        }

        match fs::remove_file(sidecar(&target)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(StorageError::DeleteFailed(e.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn exists(&self, reference: &StorageRef) -> Result<bool, StorageError> {
        let target = self.resolve(reference.as_str())?;
        fs::try_exists(&target)
            .await
            .map_err(|e| StorageError::InvalidPath(e.to_string()))
    }
}
