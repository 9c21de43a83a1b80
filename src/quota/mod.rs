//! Monthly scan quota.
//!
//! Each subject has one [`UsageRecord`] holding its tier, the month the count
//! belongs to and the count itself. A reservation reads the record, rolls it
//! over if the month changed, compares against the tier limit and either
//! rejects (no write) or commits `count + 1`, all in one atomic unit:
//!
//! ```text
//! reserve(subject)
//!        │
//!        ▼
//! ┌───────────────────────┐
//! │ read record (or fresh │
//! │ guest/free record)    │
//! └─────────┬─────────────┘
//!           ▼
//! ┌───────────────────────┐
//! │ month changed?        │──yes──► count := 0
//! └─────────┬─────────────┘
//!           ▼
//! ┌───────────────────────┐
//! │ count >= limit(tier)? │──yes──► Exceeded (no write)
//! └─────────┬─────────────┘
//!           ▼
//!     write count + 1
//! ```
//!
//! Reservations are never refunded, even when a later pipeline stage fails.

mod memory;
mod record;
mod redis_ledger;

pub use memory::MemoryLedger;
pub use record::{apply_reservation, period_key, Reservation, Tier, TierPolicy, UsageRecord};
pub use redis_ledger::{connect_manager, RedisLedger};

use crate::auth::Subject;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

/// Quota failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuotaError {
    /// No slot left this month.
    #[error("Quota Exceeded for {tier}. Limit: {limit}, Used: {used}")]
    Exceeded {
        /// Tier of the subject.
        tier: Tier,
        /// Tier limit.
        limit: u64,
        /// Scans already used.
        used: u64,
    },

    /// The ledger could not be reached or returned garbage.
    #[error("Quota ledger unavailable: {0}")]
    Unavailable(String),
}

/// Atomic per-subject usage ledger.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Check the subject's monthly limit and, if a slot is left, take it.
    ///
    /// Concurrent calls for the same subject are linearized.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Exceeded`] when the limit is reached.
    async fn reserve(&self, subject: &Subject) -> Result<Reservation, QuotaError>;

    /// Read a subject's record without modifying it.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Unavailable`] on backend failure.
    async fn usage(&self, subject_id: &str) -> Result<Option<UsageRecord>, QuotaError>;

    /// Set a subject's tier (billing hook). Creates the record if needed.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Unavailable`] on backend failure.
    async fn set_tier(&self, subject_id: &str, tier: Tier) -> Result<(), QuotaError>;
}

/// Source of wall-clock time for period computation.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
