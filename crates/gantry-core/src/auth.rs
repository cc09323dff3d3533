//! Credential resolution: detect, cache, look up, validate.

use crate::{
    error::GatewayError,
    plugin::{AuthPlugin, BackendPlugin, Detection},
    store::RateStore,
    types::{ApiContext, ApiRequest},
};
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// How long validated credentials stay in the auth cache unless overridden.
pub const DEFAULT_AUTH_CACHE: Duration = Duration::from_secs(10 * 60);

const DENIED: &str =
    "Access denied. You or your app must supply valid credentials to access this API.";

fn invalid_key(key_type: &str) -> GatewayError {
    GatewayError::abort(
        403,
        format!("Access denied. Found a key of type '{key_type}', but it is invalid."),
    )
}

/// Orchestrates authentication across Auth and Backend extensions.
///
/// Auth extensions are consulted in configured order; the first one that
/// detects a credential becomes the active scheme for the request and later
/// ones are not asked. Validation always goes back to the detecting
/// extension, even when several handle the same key type.
///
/// Validated credentials are cached in the rate store for a bounded TTL, so
/// repeat requests only pay the validation step. A failing cache read is not
/// fatal; resolution falls through to the backends.
pub struct Authenticator {
    auth: Vec<Arc<dyn AuthPlugin>>,
    backends: Vec<Arc<dyn BackendPlugin>>,
    store: Arc<dyn RateStore>,
    cache_ttl: Duration,
    allow_keyless: bool,
}

impl Authenticator {
    pub fn new(
        auth: Vec<Arc<dyn AuthPlugin>>,
        backends: Vec<Arc<dyn BackendPlugin>>,
        store: Arc<dyn RateStore>,
        cache_ttl: Duration,
        allow_keyless: bool,
    ) -> Self {
        Self { auth, backends, store, cache_ttl, allow_keyless }
    }

    /// Authenticates a request, attaching the resolved key to the context or
    /// marking it keyless. On return exactly one of `ctx.key` / `ctx.keyless`
    /// is set.
    pub async fn authenticate(
        &self,
        req: &ApiRequest,
        ctx: &mut ApiContext,
    ) -> Result<(), GatewayError> {
        let mut detected: Option<(Arc<dyn AuthPlugin>, Detection)> = None;
        for plugin in &self.auth {
            if let Some(detection) = plugin.detect(req, ctx).await? {
                detected = Some((plugin.clone(), detection));
                break;
            }
        }

        let Some((plugin, detection)) = detected else {
            return self.keyless(ctx);
        };

        // Quick path: a previously validated key in the cache only needs the
        // validation step. Store trouble degrades to a backend lookup.
        match self.store.cached_key(&detection.key_id).await {
            Ok(Some(key)) => {
                return if plugin.validate(&key, req, ctx, &detection.state).await? {
                    ctx.keyless = false;
                    ctx.key = Some(key);
                    Ok(())
                } else {
                    Err(invalid_key(&key.key_type))
                };
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, key_id = %detection.key_id, "auth cache read failed, trying backends");
            }
        }

        for backend in &self.backends {
            let Some(key) = backend.get_key(&detection.key_id, &detection.key_type).await? else {
                continue;
            };
            if !plugin.validate(&key, req, ctx, &detection.state).await? {
                return Err(invalid_key(&key.key_type));
            }
            if let Err(e) = self.store.cache_key(&key, self.cache_ttl).await {
                warn!(error = %e, key_id = %key.id, "failed to cache validated credential");
            }
            ctx.keyless = false;
            ctx.key = Some(key);
            return Ok(());
        }

        // A credential was presented but no backend knows it.
        Err(GatewayError::abort(403, DENIED))
    }

    fn keyless(&self, ctx: &mut ApiContext) -> Result<(), GatewayError> {
        if self.allow_keyless {
            ctx.keyless = true;
            ctx.key = None;
            Ok(())
        } else {
            Err(GatewayError::abort(403, DENIED))
        }
    }
}
