//! Redis-backed scan repository.
//!
//! Each record is a JSON string at `<prefix>:scan:<id>`, written with `SET NX`
//! so an existing record is never overwritten. The id is also pushed onto
//! `<prefix>:scans:<owner>` in the same transaction for per-owner listing.

use super::{NewScan, PersistenceError, ScanRecord, ScanRepository};
use crate::quota::connect_manager;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

/// Scan records stored in Redis.
pub struct RedisScanRepository {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisScanRepository {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable.
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, PersistenceError> {
        let connection = connect_manager(redis_url)
            .await
            .map_err(|e| PersistenceError::WriteFailed(e.to_string()))?;
        info!("Scan repository connected to Redis");
        Ok(Self::new(connection, prefix))
    }

    /// Build a repository over an existing connection.
    #[must_use]
    pub fn new(connection: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    fn record_key(&self, scan_id: &str) -> String {
        format!("{}:scan:{scan_id}", self.prefix)
    }

    fn owner_key(&self, owner_id: &str) -> String {
        format!("{}:scans:{owner_id}", self.prefix)
    }

    /// Ids of every scan owned by `owner_id`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::ReadFailed`] on backend failure.
    pub async fn ids_for_owner(&self, owner_id: &str) -> Result<Vec<String>, PersistenceError> {
        let mut connection = self.connection.clone();
        connection
            .lrange(self.owner_key(owner_id), 0, -1)
            .await
            .map_err(|e| PersistenceError::ReadFailed(e.to_string()))
    }
}

#[async_trait]
impl ScanRepository for RedisScanRepository {
    async fn persist(&self, scan: NewScan) -> Result<String, PersistenceError> {
        let record = scan.into_record();
        let payload = serde_json::to_string(&record)
            .map_err(|e| PersistenceError::WriteFailed(e.to_string()))?;
        let mut connection = self.connection.clone();

        let (created,): (bool,) = redis::pipe()
            .atomic()
            .set_nx(self.record_key(&record.id), payload)
            .lpush(self.owner_key(&record.owner_id), &record.id)
            .ignore()
            .query_async(&mut connection)
            .await
            .map_err(|e| {
                warn!("Scan record write failed: {e}");
                PersistenceError::WriteFailed(e.to_string())
            })?;

        if !created {
            return Err(PersistenceError::WriteFailed(format!(
                "scan id {} already exists",
                record.id
            )));
        }

        debug!("Recorded scan {} for {}", record.id, record.owner_id);
        Ok(record.id)
    }

    async fn get(&self, scan_id: &str) -> Result<Option<ScanRecord>, PersistenceError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = connection
            .get(self.record_key(scan_id))
            .await
            .map_err(|e| PersistenceError::ReadFailed(e.to_string()))?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| PersistenceError::ReadFailed(e.to_string()))
        })
        .transpose()
    }
}
