//! In-memory rate store for tests and local development.
//!
//! Implements the exact semantics of the Redis EWMA script, including the
//! no-update-on-rejection behavior, over a plain mutex-guarded map.

use super::{
    auth_cache_key, code_key, key_avg_key, notified_key, RateDecision, RateStore, StoreError,
};
use crate::types::Key;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock();
        entries.get(key).filter(|e| e.live()).map(|e| e.value.clone())
    }

    fn set(&self, key: String, value: String, ttl: Option<Duration>) {
        let mut entries = self.entries.lock();
        entries.insert(key, Entry { value, expires_at: ttl.map(|ttl| Instant::now() + ttl) });
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[async_trait]
impl RateStore for MemoryStore {
    async fn check_rate(
        &self,
        counter: &str,
        now: i64,
        max: u32,
        period_secs: u64,
        cost: u32,
    ) -> Result<RateDecision, StoreError> {
        let ts_key = format!("{counter}:ts");
        let avg_key = format!("{counter}:avg");
        let period = period_secs as f64;

        let mut entries = self.entries.lock();
        let read = |entries: &HashMap<String, Entry>, key: &str| {
            entries.get(key).filter(|e| e.live()).and_then(|e| e.value.parse::<f64>().ok())
        };

        let (avg, dt) = match read(&entries, &ts_key) {
            Some(last) => (read(&entries, &avg_key).unwrap_or(0.0), now as f64 - last),
            None => (0.0, period),
        };
        let dt = if dt == 0.0 { 1.0 } else { dt };

        let a = (-dt / period).exp();
        let rate = f64::from(cost) * period / dt;
        let next = (1.0 - a) * rate + a * avg;

        if next > f64::from(max) {
            return Ok(RateDecision::Rejected);
        }

        let expires_at = Some(Instant::now() + Duration::from_secs(period_secs * 2));
        entries.insert(ts_key, Entry { value: now.to_string(), expires_at });
        entries.insert(avg_key, Entry { value: next.to_string(), expires_at });
        Ok(RateDecision::Allowed)
    }

    async fn cached_key(&self, key_id: &str) -> Result<Option<Key>, StoreError> {
        match self.get(&auth_cache_key(key_id)) {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn cache_key(&self, key: &Key, ttl: Duration) -> Result<(), StoreError> {
        let json = serde_json::to_string(key)?;
        self.set(auth_cache_key(&key.id), json, Some(ttl));
        Ok(())
    }

    async fn set_code(
        &self,
        prefix: &str,
        code: &str,
        email: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.set(code_key(prefix, code), email.to_string(), Some(ttl));
        Ok(())
    }

    async fn get_code(&self, prefix: &str, code: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(&code_key(prefix, code)))
    }

    async fn delete_code(&self, prefix: &str, code: &str) -> Result<(), StoreError> {
        self.remove(&code_key(prefix, code));
        Ok(())
    }

    async fn key_averages(&self, key_ids: &[String]) -> Result<Vec<f64>, StoreError> {
        Ok(key_ids
            .iter()
            .map(|id| self.get(&key_avg_key(id)).and_then(|v| v.parse().ok()).unwrap_or(0.0))
            .collect())
    }

    async fn was_notified(&self, key_id: &str) -> Result<bool, StoreError> {
        Ok(self.get(&notified_key(key_id)).is_some())
    }

    async fn mark_notified(&self, key_id: &str, ttl: Duration) -> Result<(), StoreError> {
        self.set(notified_key(key_id), "1".to_string(), Some(ttl));
        Ok(())
    }
}
