//! Durable storage for uploaded images.
//!
//! Uploads are written under a path namespaced by anonymity and subject:
//!
//! ```text
//! guestdata/<subject>/scans/<millis>_<rand>_<filename>   anonymous callers
//! userdata/<subject>/scans/<millis>_<rand>_<filename>    signed-in callers
//! ```
//!
//! `<subject>` is the id itself when it is plain ASCII, otherwise its hex
//! encoding (see [`subject_segment`]).
//!
//! A write failure aborts the request. Deletes are idempotent: removing an
//! object that is already gone is not an error.

mod local;
mod memory;

pub use local::{ArtifactMetadata, LocalFsStore};
pub use memory::MemoryStore;

use crate::auth::Subject;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// MIME type assumed when the client declares none.
pub const DEFAULT_MIME_TYPE: &str = "image/jpeg";

/// Filename used when the client sends an empty or unusable one.
const FALLBACK_FILENAME: &str = "upload";

/// Artifact store failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// The object could not be written.
    #[error("Failed to store upload: {0}")]
    WriteFailed(String),

    /// The object could not be removed.
    #[error("Failed to delete upload: {0}")]
    DeleteFailed(String),

    /// The path escapes the store root or is otherwise unusable.
    #[error("Invalid storage path: {0}")]
    InvalidPath(String),
}

/// Top-level namespace an artifact or scan belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Uploaded by an anonymous subject.
    GuestData,
    /// Uploaded by a signed-in subject.
    UserData,
}

impl Visibility {
    /// Namespace for a subject.
    #[must_use]
    pub fn for_subject(subject: &Subject) -> Self {
        if subject.is_anonymous {
            Self::GuestData
        } else {
            Self::UserData
        }
    }

    /// Path segment for this namespace.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GuestData => "guestdata",
            Self::UserData => "userdata",
        }
    }
}

/// Reference to a stored object (its store-relative path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageRef(String);

impl StorageRef {
    /// Wrap a store-relative path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The store-relative path.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An uploaded image, buffered for the duration of one request.
#[derive(Debug, Clone)]
pub struct UploadedArtifact {
    /// Raw image bytes.
    pub bytes: Bytes,
    /// Declared MIME type.
    pub mime_type: String,
    /// Filename as sent by the client.
    pub original_filename: String,
}

impl UploadedArtifact {
    /// Build an artifact, defaulting a missing MIME type to JPEG.
    #[must_use]
    pub fn new(bytes: Bytes, mime_type: Option<String>, original_filename: Option<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type
                .filter(|mime| !mime.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            original_filename: original_filename.unwrap_or_default(),
        }
    }
}

/// Path-addressed binary object store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Short backend name for logs.
    fn backend_tag(&self) -> &'static str;

    /// Write `bytes` at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::WriteFailed`] or [`StorageError::InvalidPath`].
    async fn save(&self, path: &str, bytes: Bytes, mime_type: &str)
        -> Result<StorageRef, StorageError>;

    /// Remove an object. Missing objects are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DeleteFailed`] when removal itself fails.
    async fn delete(&self, reference: &StorageRef) -> Result<(), StorageError>;

    /// Whether an object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    async fn exists(&self, reference: &StorageRef) -> Result<bool, StorageError>;
}

/// Build the storage path for an upload.
#[must_use]
pub fn artifact_path(subject: &Subject, timestamp_millis: i64, original_filename: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}/scans/{timestamp_millis}_{}_{}",
        Visibility::for_subject(subject).as_str(),
        subject_segment(&subject.id),
        &suffix[..8],
        sanitize_filename(original_filename),
    )
}

/// Reduce a client filename to a single safe path segment.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    // Keep only the last component of whatever path the client sent.
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned = sanitize_segment(base);
    if cleaned.trim_matches(['.', '_']).is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        cleaned
    }
}

/// Directory name for a subject id. Ids made only of ASCII letters, digits,
/// `-` and `_` are used as is; anything else is hex encoded behind a `~`,
/// which plain ids never contain, so distinct ids never share a directory.
#[must_use]
pub fn subject_segment(id: &str) -> String {
    let plain = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if plain {
        id.to_string()
    } else {
        format!("~{}", hex::encode(id.as_bytes()))
    }
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned == "." || cleaned == ".." || cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
