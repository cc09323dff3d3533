//! Redis-backed rate store.

use super::{
    auth_cache_key, code_key, key_avg_key, notified_key, RateDecision, RateStore, StoreError,
    EWMA_SCRIPT,
};
use crate::{config::RedisConfig, types::Key};
use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};
use redis::{AsyncCommands, Script};
use std::time::Duration;

const POOL_SIZE: usize = 16;
const BORROW_TIMEOUT: Duration = Duration::from_secs(2);

/// Rate store client over a pooled Redis connection.
///
/// Connections are drawn from a bounded pool and verified on recycle, so a
/// stale connection never serves a request. The EWMA script is loaded during
/// [`connect`](RedisStore::connect), which doubles as the startup
/// connectivity probe: an unreachable store fails the gateway fast.
pub struct RedisStore {
    pool: Pool,
    script: Script,
}

impl RedisStore {
    /// Connects to Redis, selects the configured database and loads the EWMA
    /// script.
    ///
    /// Borrows are bounded: a request waiting on the pool fails after
    /// [`BORROW_TIMEOUT`] rather than queueing forever, and connections are
    /// verified on recycle so a stale one never serves a caller.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let url = format!("redis://{}:{}/{}", config.host, config.port, config.db);
        let mut pool_config = deadpool_redis::Config::from_url(url);
        let mut bounds = PoolConfig::new(POOL_SIZE);
        bounds.timeouts.wait = Some(BORROW_TIMEOUT);
        bounds.timeouts.create = Some(BORROW_TIMEOUT);
        bounds.timeouts.recycle = Some(BORROW_TIMEOUT);
        pool_config.pool = Some(bounds);
        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        let script = Script::new(EWMA_SCRIPT);
        let store = Self { pool, script };

        let mut conn = store.conn().await?;
        store.script.prepare_invoke().load_async(&mut conn).await?;

        Ok(store)
    }

    async fn conn(&self) -> Result<Connection, StoreError> {
        self.pool.get().await.map_err(|e| StoreError::Pool(e.to_string()))
    }
}

#[async_trait]
impl RateStore for RedisStore {
    async fn check_rate(
        &self,
        counter: &str,
        now: i64,
        max: u32,
        period_secs: u64,
        cost: u32,
    ) -> Result<RateDecision, StoreError> {
        let mut conn = self.conn().await?;
        let over: i64 = self
            .script
            .key(format!("{counter}:ts"))
            .key(format!("{counter}:avg"))
            .arg(now)
            .arg(max)
            .arg(period_secs)
            .arg(cost)
            .invoke_async(&mut conn)
            .await?;

        Ok(if over == 1 { RateDecision::Rejected } else { RateDecision::Allowed })
    }

    async fn cached_key(&self, key_id: &str) -> Result<Option<Key>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(auth_cache_key(key_id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn cache_key(&self, key: &Key, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let json = serde_json::to_string(key)?;
        let _: () = conn.set_ex(auth_cache_key(&key.id), json, ttl.as_secs()).await?;
        Ok(())
    }

    async fn set_code(
        &self,
        prefix: &str,
        code: &str,
        email: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.set_ex(code_key(prefix, code), email, ttl.as_secs()).await?;
        Ok(())
    }

    async fn get_code(&self, prefix: &str, code: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        Ok(conn.get(code_key(prefix, code)).await?)
    }

    async fn delete_code(&self, prefix: &str, code: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(code_key(prefix, code)).await?;
        Ok(())
    }

    async fn key_averages(&self, key_ids: &[String]) -> Result<Vec<f64>, StoreError> {
        if key_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = key_ids.iter().map(|id| key_avg_key(id)).collect();
        let mut conn = self.conn().await?;
        let avgs: Vec<Option<f64>> = conn.mget(&keys).await?;
        Ok(avgs.into_iter().map(|avg| avg.unwrap_or(0.0)).collect())
    }

    async fn was_notified(&self, key_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let flag: Option<String> = conn.get(notified_key(key_id)).await?;
        Ok(flag.is_some())
    }

    async fn mark_notified(&self, key_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn.set_ex(notified_key(key_id), "1", ttl.as_secs()).await?;
        Ok(())
    }
}
