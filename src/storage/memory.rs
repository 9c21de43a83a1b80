//! In-memory artifact store for tests and local runs.

use super::{ArtifactStore, StorageError, StorageRef};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Bytes,
    mime_type: String,
}

/// Artifact store backed by a hash map, with switchable failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `save` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `delete` fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Whether an object is currently stored at `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.objects.read().contains_key(path)
    }

    /// Stored bytes and MIME type at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<(Bytes, String)> {
        self.objects
            .read()
            .get(path)
            .map(|object| (object.bytes.clone(), object.mime_type.clone()))
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Delete calls that reached the store so far.
    #[must_use]
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn save(
        &self,
        path: &str,
        bytes: Bytes,
        mime_type: &str,
    ) -> Result<StorageRef, StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed("injected write failure".into()));
        }
        if path.is_empty() || path.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        self.objects.write().insert(
            path.to_string(),
            StoredObject {
                bytes,
                mime_type: mime_type.to_string(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(StorageRef::new(path))
    }

    async fn delete(&self, reference: &StorageRef) -> Result<(), StorageError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::DeleteFailed("injected delete failure".into()));
        }
        self.objects.write().remove(reference.as_str());
        Ok(())
    }

    async fn exists(&self, reference: &StorageRef) -> Result<bool, StorageError> {
        Ok(self.contains(reference.as_str()))
    }
}
