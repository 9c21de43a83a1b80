//! Redis-backed usage ledger.
//!
//! Records live in one hash per subject (`<prefix>:usage:<id>` with fields
//! `tier`, `period`, `count`). A reservation is a single Lua script, so the
//! rollover, the limit check and the increment execute atomically on the
//! server and concurrent instances of the service cannot oversell a slot.

use super::record::{period_key, Reservation, Tier, TierPolicy, UsageRecord};
use super::{Clock, QuotaError, QuotaLedger, SystemClock};
use crate::auth::Subject;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// KEYS[1] = usage hash
/// ARGV = period, tier for the caller (`guest` when anonymous, `free`
/// otherwise), guest limit, free limit
const RESERVE_SCRIPT: &str = r"
local tier = redis.call('HGET', KEYS[1], 'tier')
local period = redis.call('HGET', KEYS[1], 'period')
local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
if not tier then
  tier = ARGV[2]
elseif tier == 'guest' and ARGV[2] == 'free' then
  tier = 'free'
end
if period ~= ARGV[1] then
  period = ARGV[1]
  count = 0
end
local limit = -1
if tier == 'guest' then
  limit = tonumber(ARGV[3])
elseif tier == 'free' then
  limit = tonumber(ARGV[4])
end
if limit >= 0 and count >= limit then
  return {0, tier, count, limit}
end
count = count + 1
redis.call('HSET', KEYS[1], 'tier', tier, 'period', period, 'count', count)
return {1, tier, count, limit}
";

/// Usage ledger stored in Redis.
pub struct RedisLedger {
    connection: ConnectionManager,
    prefix: String,
    policy: TierPolicy,
    clock: Arc<dyn Clock>,
    script: Script,
}

impl RedisLedger {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        policy: TierPolicy,
    ) -> Result<Self, QuotaError> {
        let connection = connect_manager(redis_url).await?;
        info!("Quota ledger connected to Redis");
        Ok(Self::new(connection, prefix, policy, Arc::new(SystemClock)))
    }

    /// Build a ledger over an existing connection.
    #[must_use]
    pub fn new(
        connection: ConnectionManager,
        prefix: impl Into<String>,
        policy: TierPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            policy,
            clock,
            script: Script::new(RESERVE_SCRIPT),
        }
    }

    fn key(&self, subject_id: &str) -> String {
        format!("{}:usage:{subject_id}", self.prefix)
    }
}

/// Open a managed, auto-reconnecting connection.
///
/// # Errors
///
/// Returns [`QuotaError::Unavailable`] if the connection cannot be made.
pub async fn connect_manager(redis_url: &str) -> Result<ConnectionManager, QuotaError> {
    let client = Client::open(redis_url).map_err(|e| QuotaError::Unavailable(e.to_string()))?;
    tokio::time::timeout(CONNECT_TIMEOUT, client.get_connection_manager())
        .await
        .map_err(|_| QuotaError::Unavailable("Redis connection timed out".to_string()))?
        .map_err(|e| QuotaError::Unavailable(e.to_string()))
}

fn unavailable(e: &redis::RedisError) -> QuotaError {
    warn!("Redis quota operation failed: {e}");
    QuotaError::Unavailable(e.to_string())
}

fn parse_tier(raw: &str) -> Result<Tier, QuotaError> {
    raw.parse::<Tier>()
        .map_err(|e: String| QuotaError::Unavailable(format!("corrupt usage record: {e}")))
}

#[async_trait]
impl QuotaLedger for RedisLedger {
    async fn reserve(&self, subject: &Subject) -> Result<Reservation, QuotaError> {
        let period = period_key(self.clock.now());
        let mut connection = self.connection.clone();

        let (allowed, tier, count, limit): (i64, String, u64, i64) = self
            .script
            .key(self.key(&subject.id))
            .arg(&period)
            .arg(Tier::initial_for(subject).as_str())
            .arg(self.policy.guest_limit)
            .arg(self.policy.free_limit)
            .invoke_async(&mut connection)
            .await
            .map_err(|e| unavailable(&e))?;

        let tier = parse_tier(&tier)?;
        let limit = u64::try_from(limit).ok();

        if allowed == 0 {
            debug!("Quota exhausted for {} ({count} used)", subject.id);
            return Err(QuotaError::Exceeded {
                tier,
                limit: limit.unwrap_or_default(),
                used: count,
            });
        }

        debug!("Reserved scan {count} for {} ({tier})", subject.id);
        Ok(Reservation {
            tier,
            new_count: count,
            limit,
            period,
        })
    }

    async fn usage(&self, subject_id: &str) -> Result<Option<UsageRecord>, QuotaError> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> = connection
            .hgetall(self.key(subject_id))
            .await
            .map_err(|e| unavailable(&e))?;

        if fields.is_empty() {
            return Ok(None);
        }

        let tier = parse_tier(fields.get("tier").map_or("", String::as_str))?;
        let count = fields
            .get("count")
            .map_or(Ok(0), |raw| raw.parse::<u64>())
            .map_err(|e| QuotaError::Unavailable(format!("corrupt usage count: {e}")))?;

        Ok(Some(UsageRecord {
            tier,
            period: fields.get("period").cloned().unwrap_or_default(),
            count,
        }))
    }

    async fn set_tier(&self, subject_id: &str, tier: Tier) -> Result<(), QuotaError> {
        let key = self.key(subject_id);
        let period = period_key(self.clock.now());
        let mut connection = self.connection.clone();

        redis::pipe()
            .atomic()
            .hset(&key, "tier", tier.as_str())
            .ignore()
            .hset_nx(&key, "period", &period)
            .ignore()
            .hset_nx(&key, "count", 0)
            .ignore()
            .query_async::<_, ()>(&mut connection)
            .await
            .map_err(|e| unavailable(&e))?;

        info!("Set tier of {subject_id} to {}", tier.as_str());
        Ok(())
    }
}
