//! In-memory scan repository.

use super::{NewScan, PersistenceError, ScanRecord, ScanRepository};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Scan records held in a hash map, with a switchable write failure.
#[derive(Debug, Default)]
pub struct MemoryScanRepository {
    records: RwLock<HashMap<String, ScanRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryScanRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `persist` fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no record is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Every record owned by `owner_id`, oldest first.
    #[must_use]
    pub fn by_owner(&self, owner_id: &str) -> Vec<ScanRecord> {
        let mut records: Vec<ScanRecord> = self
            .records
            .read()
            .values()
            .filter(|record| record.owner_id == owner_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }
}

#[async_trait]
impl ScanRepository for MemoryScanRepository {
    async fn persist(&self, scan: NewScan) -> Result<String, PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::WriteFailed(
                "injected write failure".to_string(),
            ));
        }
        let record = scan.into_record();
        let id = record.id.clone();
        self.records.write().insert(id.clone(), record);
        Ok(id)
    }

    async fn get(&self, scan_id: &str) -> Result<Option<ScanRecord>, PersistenceError> {
        Ok(self.records.read().get(scan_id).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::{StorageRef, Visibility};

    fn scan(owner: &str) -> NewScan {
        NewScan {
            owner_id: owner.to_string(),
            storage_reference: StorageRef::new(format!("guestdata/{owner}/scans/x.jpg")),
            result_text: "Pancakes".to_string(),
            backend_used: "gemini-2.0-flash".to_string(),
            visibility: Visibility::GuestData,
        }
    }

    #[tokio::test]
    async fn test_persist_then_get() {
        let repo = MemoryScanRepository::new();
        let id = repo.persist(scan("g1")).await.unwrap();

        let record = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(record.owner_id, "g1");
        assert_eq!(record.result_text, "Pancakes");
        assert!(repo.get("missing").await.unwrap().is_none());
        assert_eq!(repo.by_owner("g1").len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let repo = MemoryScanRepository::new();
        repo.fail_writes(true);
        assert!(repo.persist(scan("g1")).await.is_err());
        assert!(repo.is_empty());
    }
}
