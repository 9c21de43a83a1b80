//! In-process usage ledger.
//!
//! Holds one mutex per subject so reservations for different subjects never
//! contend. Only suitable for a single instance (tests, local development);
//! multi-instance deployments use [`super::RedisLedger`].

use super::record::{apply_reservation, period_key, Reservation, Tier, TierPolicy, UsageRecord};
use super::{Clock, QuotaError, QuotaLedger, SystemClock};
use crate::auth::Subject;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type Slot = Arc<Mutex<Option<UsageRecord>>>;

/// Usage ledger kept in memory.
pub struct MemoryLedger {
    slots: RwLock<HashMap<String, Slot>>,
    policy: TierPolicy,
    clock: Arc<dyn Clock>,
}

impl MemoryLedger {
    /// Create a ledger using the system clock.
    #[must_use]
    pub fn new(policy: TierPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    /// Create a ledger with an explicit clock.
    #[must_use]
    pub fn with_clock(policy: TierPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            policy,
            clock,
        }
    }

    /// Overwrite a subject's record.
    pub fn seed(&self, subject_id: &str, record: UsageRecord) {
        *self.slot(subject_id).lock() = Some(record);
    }

    fn slot(&self, subject_id: &str) -> Slot {
        if let Some(slot) = self.slots.read().get(subject_id) {
            return Arc::clone(slot);
        }
        Arc::clone(
            self.slots
                .write()
                .entry(subject_id.to_string())
                .or_default(),
        )
    }
}

#[async_trait]
impl QuotaLedger for MemoryLedger {
    async fn reserve(&self, subject: &Subject) -> Result<Reservation, QuotaError> {
        let period = period_key(self.clock.now());
        let slot = self.slot(&subject.id);
        let mut stored = slot.lock();

        let (record, reservation) =
            apply_reservation(stored.clone(), subject, &period, &self.policy)?;
        *stored = Some(record);

        debug!(
            "Reserved scan {} for {} ({})",
            reservation.new_count, subject.id, reservation.tier
        );
        Ok(reservation)
    }

    async fn usage(&self, subject_id: &str) -> Result<Option<UsageRecord>, QuotaError> {
        Ok(self
            .slots
            .read()
            .get(subject_id)
            .and_then(|slot| slot.lock().clone()))
    }

    async fn set_tier(&self, subject_id: &str, tier: Tier) -> Result<(), QuotaError> {
        let period = period_key(self.clock.now());
        let slot = self.slot(subject_id);
        let mut stored = slot.lock();
        match stored.as_mut() {
            Some(record) => record.tier = tier,
            None => {
                *stored = Some(UsageRecord {
                    tier,
                    period,
                    count: 0,
                });
            }
        }
        Ok(())
    }
}
