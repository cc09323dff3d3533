//! EWMA quota enforcement per IP and per key.

use crate::{
    config::{DEFAULT_QUOTA, KEYLESS_QUOTA},
    error::GatewayError,
    mail::{ContentKind, Mailer, Recipient},
    store::{RateDecision, RateStore},
    types::{ApiContext, ApiRequest, Key, Quota},
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{error, warn};

const NOTIFY_THROTTLE: Duration = Duration::from_secs(60 * 60);

/// Checks a request against its quota policy.
///
/// The policy is named by the key (`keyless` for anonymous traffic) and
/// falls back to `default` when the name is unknown. Counters live in the
/// rate store and are charged atomically; a store outage fails open so the
/// gateway never locks users out because the limiter is down.
pub struct QuotaEnforcer {
    quotas: HashMap<String, Quota>,
    store: Arc<dyn RateStore>,
    mailer: Arc<dyn Mailer>,
}

impl QuotaEnforcer {
    pub fn new(
        quotas: HashMap<String, Quota>,
        store: Arc<dyn RateStore>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self { quotas, store, mailer }
    }

    /// Charges the request's cost against the applicable counters, aborting
    /// with 403 when a ceiling is exceeded.
    pub async fn check(&self, req: &ApiRequest, ctx: &ApiContext) -> Result<(), GatewayError> {
        if ctx.cost == 0 {
            return Ok(());
        }

        let (quota_name, key_id) = match &ctx.key {
            Some(key) => (key.quota.as_str(), key.id.as_str()),
            None => (KEYLESS_QUOTA, KEYLESS_QUOTA),
        };
        let Some(quota) = self.resolve(quota_name) else {
            return Ok(());
        };
        if quota.minutes == 0 {
            return Ok(());
        }
        let period = u64::from(quota.minutes) * 60;
        let now = chrono::Utc::now().timestamp();

        if quota.max_ip > 0 {
            let counter = format!("quota:ip:{key_id}:{}", req.client_ip());
            if self.over_quota(&counter, now, quota.max_ip, period, ctx.cost).await {
                return Err(GatewayError::abort(
                    403,
                    format!(
                        "per-IP quota exceeded ({} requests / {} minutes). Please wait before making new requests.",
                        quota.max_ip, quota.minutes
                    ),
                ));
            }
        }

        if quota.max_key > 0 && !ctx.keyless {
            let counter = format!("quota:key:{key_id}");
            if self.over_quota(&counter, now, quota.max_key, period, ctx.cost).await {
                if let Some(key) = &ctx.key {
                    if !key.owner.is_empty() {
                        self.notify_owner(key, &quota).await;
                    }
                }
                return Err(GatewayError::abort(
                    403,
                    format!(
                        "per-key quota exceeded ({} requests / {} minutes). Please wait before making new requests.",
                        quota.max_key, quota.minutes
                    ),
                ));
            }
        }

        Ok(())
    }

    fn resolve(&self, name: &str) -> Option<Quota> {
        if let Some(quota) = self.quotas.get(name) {
            return Some(*quota);
        }
        if name != KEYLESS_QUOTA {
            warn!(quota = name, "request names an unknown quota, using the default policy");
        }
        self.quotas.get(DEFAULT_QUOTA).copied()
    }

    async fn over_quota(&self, counter: &str, now: i64, max: u32, period: u64, cost: u32) -> bool {
        match self.store.check_rate(counter, now, max, period, cost).await {
            Ok(decision) => decision == RateDecision::Rejected,
            Err(e) => {
                // Fail open: a rate store outage must not lock everyone out.
                error!(error = %e, counter, "rate store unavailable, allowing request");
                false
            }
        }
    }

    /// Mails the key owner about the overage, at most once per hour per key.
    async fn notify_owner(&self, key: &Key, quota: &Quota) {
        match self.store.was_notified(&key.id).await {
            Ok(true) => {}
            Ok(false) => {
                let body = format!(
                    "This is an automated warning message. One of your API keys has exceeded its quota.\n\
                     \n\
                     Key ID: {}\n\
                     Realm : {}\n\
                     Quota : {} requests per {} minutes\n\
                     \n\
                     This warning will repeat every hour as long as the key continues to exceed its quota.\n",
                    key.id, key.realm, quota.max_key, quota.minutes
                );
                if let Err(e) = self
                    .mailer
                    .send(
                        Recipient::Address(key.owner.clone()),
                        "[WARNING] Quota exceeded",
                        ContentKind::Plain,
                        body,
                    )
                    .await
                {
                    warn!(error = %e, key_id = %key.id, "quota warning mail failed");
                }
                if let Err(e) = self.store.mark_notified(&key.id, NOTIFY_THROTTLE).await {
                    warn!(error = %e, key_id = %key.id, "could not mark key as notified");
                }
            }
            Err(e) => {
                warn!(error = %e, key_id = %key.id, "could not read notification flag");
            }
        }
    }
}
