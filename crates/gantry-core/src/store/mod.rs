//! The rate store: shared fast storage for quota counters, cached
//! credentials and short-lived portal codes.
//!
//! All cross-request mutable state lives here. The store is abstracted behind
//! the [`RateStore`] trait so the pipeline can be exercised against an
//! in-memory implementation; production uses [`RedisStore`], where the EWMA
//! calculation runs as a server-side script for atomicity.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::types::Key;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Rate limiting is an exponentially weighted moving average maintained per
/// counter. This Lua script performs the whole read-modify-write atomically
/// inside Redis.
///
/// A rejection deliberately leaves `ts`/`avg` untouched and does not refresh
/// their TTL, so sustained overage cannot extend the window indefinitely.
///
/// http://www-uxsup.csx.cam.ac.uk/~fanf2/hermes/doc/antiforgery/ratelimit-demo.html
pub(crate) const EWMA_SCRIPT: &str = r"
    local kts, kavg = unpack(KEYS)
    local now, max, period, cost = tonumber(ARGV[1]), tonumber(ARGV[2]), tonumber(ARGV[3]), tonumber(ARGV[4])

    local last = redis.call('GET', kts)
    local avg, dt

    if last ~= false then
        avg = redis.call('GET', kavg)
        if avg == false then avg = 0 else avg = tonumber(avg) end
        dt = now - tonumber(last)
    else
        avg = 0
        dt = period
    end
    if dt == 0 then dt = 1 end

    local a = math.exp(-dt/period)
    local rate = cost * period / dt
    avg = (1 - a) * rate + a * avg

    if avg > max then
        return 1
    else
        local expire = period * 2
        redis.call('SETEX', kts, expire, now)
        redis.call('SETEX', kavg, expire, avg)
        return 0
    end
";

/// Store prefix for activation codes (24 h TTL).
pub const ACTIVATION_PREFIX: &str = "activation";
/// Store prefix for password reset codes (1 h TTL).
pub const PASSWORD_RESET_PREFIX: &str = "password-reset";

pub(crate) fn auth_cache_key(key_id: &str) -> String {
    format!("auth_cache:{key_id}")
}

pub(crate) fn code_key(prefix: &str, code: &str) -> String {
    format!("{prefix}:{code}")
}

pub(crate) fn key_avg_key(key_id: &str) -> String {
    format!("quota:key:{key_id}:avg")
}

pub(crate) fn notified_key(key_id: &str) -> String {
    format!("quota:key:{key_id}:notified")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store pool error: {0}")]
    Pool(String),

    #[error("store error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("stored value is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of an atomic EWMA check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Rejected,
}

/// Client over the shared fast store.
///
/// Implementations must be safe under concurrent use; the EWMA check must be
/// atomic per counter so concurrent increments produce one well-defined
/// average trajectory.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Charges `cost` against `counter` and decides whether its smoothed rate
    /// stays within `max` per `period_secs`. On rejection the counter state is
    /// left exactly as it was.
    async fn check_rate(
        &self,
        counter: &str,
        now: i64,
        max: u32,
        period_secs: u64,
        cost: u32,
    ) -> Result<RateDecision, StoreError>;

    /// Looks up a cached credential by its public id.
    async fn cached_key(&self, key_id: &str) -> Result<Option<Key>, StoreError>;

    /// Caches a validated credential for `ttl`.
    async fn cache_key(&self, key: &Key, ttl: Duration) -> Result<(), StoreError>;

    /// Stores a short-lived code (activation, password reset) mapping to an
    /// email address.
    async fn set_code(
        &self,
        prefix: &str,
        code: &str,
        email: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Resolves a code back to its email address, if still valid.
    async fn get_code(&self, prefix: &str, code: &str) -> Result<Option<String>, StoreError>;

    /// Consumes a code.
    async fn delete_code(&self, prefix: &str, code: &str) -> Result<(), StoreError>;

    /// Current EWMA per key id, in key order. Missing counters read as 0.
    async fn key_averages(&self, key_ids: &[String]) -> Result<Vec<f64>, StoreError>;

    /// Whether a quota overage notification was sent recently for this key.
    async fn was_notified(&self, key_id: &str) -> Result<bool, StoreError>;

    /// Throttles further overage notifications for `ttl`.
    async fn mark_notified(&self, key_id: &str, ttl: Duration) -> Result<(), StoreError>;
}
