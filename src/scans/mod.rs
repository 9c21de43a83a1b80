//! Immutable scan records.
//!
//! One record is written per successful analysis. Records are never updated
//! or deleted by the service.

mod memory;
mod redis_repo;

pub use memory::MemoryScanRepository;
pub use redis_repo::RedisScanRepository;

use crate::storage::{StorageRef, Visibility};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scan record persistence failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    /// The record could not be written.
    #[error("Failed to save scan record: {0}")]
    WriteFailed(String),

    /// The repository could not be read.
    #[error("Failed to read scan record: {0}")]
    ReadFailed(String),
}

/// A completed analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    /// Server-assigned identifier.
    pub id: String,
    /// Subject that requested the scan.
    pub owner_id: String,
    /// Where the uploaded image lives.
    pub storage_reference: StorageRef,
    /// Generated description.
    pub result_text: String,
    /// Backend that produced the description.
    pub backend_used: String,
    /// Server-assigned creation time.
    pub created_at: DateTime<Utc>,
    /// Namespace of the owner at scan time.
    pub visibility: Visibility,
}

/// Fields supplied by the caller when recording a scan.
#[derive(Debug, Clone)]
pub struct NewScan {
    /// Subject that requested the scan.
    pub owner_id: String,
    /// Where the uploaded image lives.
    pub storage_reference: StorageRef,
    /// Generated description.
    pub result_text: String,
    /// Backend that produced the description.
    pub backend_used: String,
    /// Namespace of the owner.
    pub visibility: Visibility,
}

impl NewScan {
    /// Stamp with a fresh id and the current time.
    #[must_use]
    pub fn into_record(self) -> ScanRecord {
        ScanRecord {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: self.owner_id,
            storage_reference: self.storage_reference,
            result_text: self.result_text,
            backend_used: self.backend_used,
            created_at: Utc::now(),
            visibility: self.visibility,
        }
    }
}

/// Append-only store of scan records.
#[async_trait]
pub trait ScanRepository: Send + Sync {
    /// Write a new record and return its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::WriteFailed`] if the record was not stored.
    async fn persist(&self, scan: NewScan) -> Result<String, PersistenceError>;

    /// Fetch a record by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::ReadFailed`] on backend failure.
    async fn get(&self, scan_id: &str) -> Result<Option<ScanRecord>, PersistenceError>;
}
