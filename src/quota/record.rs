//! Usage records and the monthly reservation rule.

use super::QuotaError;
use crate::auth::Subject;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Billing tier of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Anonymous session.
    Guest,
    /// Signed in, not paying.
    Free,
    /// Paying subscriber. Set by billing, never by this service.
    Paid,
}

impl Tier {
    /// Tier assigned to a subject seen for the first time.
    #[must_use]
    pub fn initial_for(subject: &Subject) -> Self {
        if subject.is_anonymous {
            Self::Guest
        } else {
            Self::Free
        }
    }

    /// Stable lowercase name used in storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Free => "free",
            Self::Paid => "paid",
        }
    }

    /// Human label used in quota messages.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Guest => "Guest",
            Self::Free => "Free Tier",
            Self::Paid => "Paid",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guest" => Ok(Self::Guest),
            "free" => Ok(Self::Free),
            "paid" => Ok(Self::Paid),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Monthly scan limits per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPolicy {
    /// Limit for anonymous subjects.
    pub guest_limit: u64,
    /// Limit for signed-in free subjects.
    pub free_limit: u64,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            guest_limit: 10,
            free_limit: 25,
        }
    }
}

impl TierPolicy {
    /// Limit for a tier; `None` means unbounded.
    #[must_use]
    pub fn limit(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Guest => Some(self.guest_limit),
            Tier::Free => Some(self.free_limit),
            Tier::Paid => None,
        }
    }
}

/// Calendar month key (`YYYY-MM`) for a point in time.
#[must_use]
pub fn period_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

/// Per-subject usage counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Billing tier.
    pub tier: Tier,
    /// Month the count belongs to.
    pub period: String,
    /// Scans used in `period`.
    pub count: u64,
}

impl UsageRecord {
    /// Zero-usage record for a subject seen for the first time.
    #[must_use]
    pub fn fresh(subject: &Subject, period: &str) -> Self {
        Self {
            tier: Tier::initial_for(subject),
            period: period.to_string(),
            count: 0,
        }
    }

    /// A guest record whose subject has since signed in moves to the free
    /// tier. Paid records are never touched.
    pub fn promote_for(&mut self, subject: &Subject) {
        if self.tier == Tier::Guest && !subject.is_anonymous {
            self.tier = Tier::Free;
        }
    }

    /// Roll the record over to `period`, resetting the count if the month
    /// changed.
    pub fn roll_to(&mut self, period: &str) {
        if self.period != period {
            self.period = period.to_string();
            self.count = 0;
        }
    }
}

/// Outcome of a granted reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Tier the slot was charged to.
    pub tier: Tier,
    /// Count after the increment.
    pub new_count: u64,
    /// Limit in force; `None` for unbounded tiers.
    pub limit: Option<u64>,
    /// Month the slot was charged to.
    pub period: String,
}

/// Apply one reservation to the stored record.
///
/// Returns the record to commit, or the rejection when the subject has no
/// slot left. Nothing should be written on rejection. The in-process ledger
/// runs this under a per-subject lock; the Redis ledger runs the same rule as
/// a server-side script.
///
/// # Errors
///
/// Returns [`QuotaError::Exceeded`] when `count >= limit`.
pub fn apply_reservation(
    stored: Option<UsageRecord>,
    subject: &Subject,
    period: &str,
    policy: &TierPolicy,
) -> Result<(UsageRecord, Reservation), QuotaError> {
    let mut record = stored.unwrap_or_else(|| UsageRecord::fresh(subject, period));
    record.promote_for(subject);
    record.roll_to(period);

    let limit = policy.limit(record.tier);
    if let Some(limit) = limit {
        if record.count >= limit {
            return Err(QuotaError::Exceeded {
                tier: record.tier,
                limit,
                used: record.count,
            });
        }
    }

    record.count += 1;
    let reservation = Reservation {
        tier: record.tier,
        new_count: record.count,
        limit,
        period: record.period.clone(),
    };
    Ok((record, reservation))
}
