//! The request handler: the staged state machine every API request runs
//! through, and the builder that assembles a gateway from configuration.
//!
//! ```text
//! ENTRY -> AUTH -> POSTAUTH* -> QUOTA -> PREUPSTREAM* -> PROXY
//!       -> POSTUPSTREAM* -> RESPOND -> LOG* -> DONE
//! ```
//!
//! The first error from any stage terminates the pipeline: an `Abort`
//! becomes its status and message, anything else becomes a generic 500 plus
//! an alert mail. The logging stage runs after the response is on the wire
//! and can no longer touch it.

use crate::{
    auth::{Authenticator, DEFAULT_AUTH_CACHE},
    config::AppConfig,
    error::{ErrorEnvelope, GatewayError},
    mail::{Alerts, ContentKind, Mailer, SmtpMailer},
    plugin::{AuthPlugin, ExtensionPipeline, ManagementPlugin, PluginRegistry},
    proxy::{upstream_client, UpstreamProxy},
    quota::QuotaEnforcer,
    store::{RateStore, RedisStore},
    types::{ApiContext, ApiRequest, ApiResponse, KeyType, Quota, Upstream},
};
use http::StatusCode;
use rand::Rng;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{error, info};
use url::Url;

/// Assembles a [`Gateway`] from a validated configuration.
///
/// Production builds connect to Redis and SMTP; tests swap in the in-memory
/// store and a recording mailer.
pub struct GatewayBuilder {
    config: AppConfig,
    registry: PluginRegistry,
    store: Option<Arc<dyn RateStore>>,
    mailer: Option<Arc<dyn Mailer>>,
    auth_cache_ttl: Duration,
}

impl GatewayBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: PluginRegistry::builtin(),
            store: None,
            mailer: None,
            auth_cache_ttl: DEFAULT_AUTH_CACHE,
        }
    }

    /// Replaces the built-in plugin registry.
    pub fn registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn store(mut self, store: Arc<dyn RateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn auth_cache_ttl(mut self, ttl: Duration) -> Self {
        self.auth_cache_ttl = ttl;
        self
    }

    /// Validates configuration, builds and configures every extension,
    /// connects the rate store, and starts lifecycle plugins. Any failure
    /// here is fatal to startup.
    pub async fn build(self) -> anyhow::Result<Arc<Gateway>> {
        let mut config = self.config;
        config.validate()?;

        let pipeline = ExtensionPipeline::from_config(&self.registry, &config.plugins)?;

        let store: Arc<dyn RateStore> = match self.store {
            Some(store) => store,
            None => Arc::new(RedisStore::connect(&config.redis).await?),
        };
        let mailer: Arc<dyn Mailer> =
            self.mailer.unwrap_or_else(|| Arc::new(SmtpMailer::new(config.email.clone())));
        let alerts = Arc::new(Alerts::new(
            mailer.clone(),
            config.email.alerts_cooldown,
            !config.email.alerts_to.is_empty(),
        ));

        let mut upstreams = Vec::with_capacity(config.serve.upstreams.len());
        for address in &config.serve.upstreams {
            let base = Url::parse(address)?;
            upstreams.push(Upstream { base, client: upstream_client()? });
        }

        let authenticator = Authenticator::new(
            pipeline.auth.clone(),
            pipeline.backends.clone(),
            store.clone(),
            self.auth_cache_ttl,
            config.allow_keyless(),
        );
        let quota = QuotaEnforcer::new(config.quotas.clone(), store.clone(), mailer.clone());
        let proxy = UpstreamProxy::new(config.serve.max_body_bytes);

        pipeline.start(alerts.clone().reporter())?;
        info!(
            upstreams = upstreams.len(),
            keyless = config.allow_keyless(),
            api = %config.serve.api,
            "gateway assembled"
        );

        Ok(Arc::new(Gateway {
            pipeline,
            authenticator,
            quota,
            proxy,
            upstreams,
            alerts,
            api_prefix: config.serve.api.clone(),
            portal_prefix: config.serve.portal_api.clone(),
            signing_key: config.serve.signing_key.clone(),
            max_body_bytes: config.serve.max_body_bytes,
            quotas: config.quotas.clone(),
            store,
            mailer,
            email_from: config.email.from.clone(),
        }))
    }
}

/// The assembled gateway. Shared across all request tasks.
pub struct Gateway {
    pipeline: ExtensionPipeline,
    authenticator: Authenticator,
    quota: QuotaEnforcer,
    proxy: UpstreamProxy,
    upstreams: Vec<Upstream>,
    alerts: Arc<Alerts>,
    api_prefix: String,
    portal_prefix: String,
    signing_key: String,
    max_body_bytes: usize,
    quotas: HashMap<String, Quota>,
    store: Arc<dyn RateStore>,
    mailer: Arc<dyn Mailer>,
    email_from: String,
}

impl Gateway {
    /// Runs one request through the full pipeline and returns the client
    /// response. Never fails; errors become their JSON envelopes here.
    pub async fn handle(&self, mut req: ApiRequest) -> ApiResponse {
        let mut ctx = ApiContext::new();
        ctx.path = self.api_prefix.clone();
        ctx.upstream = self.choose_upstream();

        match self.run(&mut req, &mut ctx).await {
            Ok(response) => response,
            Err(err) => self.error_response(err).await,
        }
    }

    async fn run(
        &self,
        req: &mut ApiRequest,
        ctx: &mut ApiContext,
    ) -> Result<ApiResponse, GatewayError> {
        self.authenticator.authenticate(req, ctx).await?;

        for hook in &self.pipeline.post_auth {
            hook.post_auth(req, ctx).await?;
        }

        self.quota.check(req, ctx).await?;

        for hook in &self.pipeline.pre_upstream {
            hook.pre_upstream(req, ctx).await?;
        }

        let mut response = self.proxy.forward(req, ctx).await?;

        for hook in &self.pipeline.post_upstream {
            hook.post_upstream(req, &mut response, ctx).await?;
        }

        if response.status.is_server_error() {
            return Ok(self.upstream_failure(req, ctx, &response).await);
        }

        self.spawn_logging(req.clone(), response.clone(), std::mem::take(ctx));
        Ok(response)
    }

    fn choose_upstream(&self) -> Option<Upstream> {
        match self.upstreams.len() {
            0 => None,
            1 => Some(self.upstreams[0].clone()),
            n => {
                let index = rand::thread_rng().gen_range(0..n);
                Some(self.upstreams[index].clone())
            }
        }
    }

    /// The upstream failed hard: alert operations (cooldown-gated) and hand
    /// the client a sanitized envelope instead of the raw backend error.
    async fn upstream_failure(
        &self,
        req: &ApiRequest,
        ctx: &ApiContext,
        response: &ApiResponse,
    ) -> ApiResponse {
        let mut details = vec![
            (
                "Code",
                format!(
                    "{} - {}",
                    response.status.as_u16(),
                    response.status.canonical_reason().unwrap_or("unknown")
                ),
            ),
            (
                "Backend Server",
                ctx.upstream.as_ref().map(|u| u.base.to_string()).unwrap_or_default(),
            ),
            ("Method", req.method.to_string()),
            ("Request URI", req.uri.to_string()),
        ];
        if let Some(key) = &ctx.key {
            details.push(("Key ID", key.id.clone()));
        }
        if req.method == http::Method::POST {
            details.push(("Request Body", String::from_utf8_lossy(&req.body).into_owned()));
        }

        let mut body = String::from("<h2>Upstream server error</h2><table>");
        for (item, value) in details {
            body.push_str(&format!("<tr><th>{item}</th><td>{value}</td></tr>"));
        }
        body.push_str("</table><hr>");

        let upstream_body = String::from_utf8_lossy(&response.body);
        let is_html = response
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/html"));
        if is_html {
            body.push_str(&upstream_body);
        } else {
            body.push_str(&format!("<pre>{upstream_body}</pre>"));
        }

        self.alerts.send("[API Error] Upstream server error", ContentKind::Html, body).await;

        ApiResponse::json(
            response.status,
            &json!({
                "error": "Internal API error",
                "details": "Sorry, something went wrong on the API server. The error has been reported to technical staff.",
                "code": response.status.as_u16(),
            }),
        )
    }

    async fn error_response(&self, err: GatewayError) -> ApiResponse {
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match err {
            GatewayError::Abort { message, .. } => {
                ApiResponse::json(status, &ErrorEnvelope::new(message))
            }
            GatewayError::Internal(e) => {
                self.alerts.report(&format!("{e:#}")).await;
                ApiResponse::json(status, &ErrorEnvelope::new("internal server error"))
            }
        }
    }

    /// Runs logging extensions after the response is finished. Their errors
    /// are alerted, never written to the (already closed) client.
    fn spawn_logging(&self, req: ApiRequest, res: ApiResponse, mut ctx: ApiContext) {
        if ctx.do_not_log || self.pipeline.logging.is_empty() {
            return;
        }
        prep_log(&mut ctx, &req);

        let logging = self.pipeline.logging.clone();
        let alerts = self.alerts.clone();
        tokio::spawn(async move {
            for hook in &logging {
                if let Err(err) = hook.log(&req, &res, &mut ctx).await {
                    error!(error = %err, "logging extension failed");
                    alerts.report(&err.to_string()).await;
                    break;
                }
            }
        });
    }

    // Accessors the serving layer and portal need.

    pub fn api_prefix(&self) -> &str {
        &self.api_prefix
    }

    pub fn portal_prefix(&self) -> &str {
        &self.portal_prefix
    }

    pub fn signing_key(&self) -> &str {
        &self.signing_key
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn quotas(&self) -> &HashMap<String, Quota> {
        &self.quotas
    }

    pub fn store(&self) -> Arc<dyn RateStore> {
        self.store.clone()
    }

    pub fn mailer(&self) -> Arc<dyn Mailer> {
        self.mailer.clone()
    }

    pub fn email_from(&self) -> &str {
        &self.email_from
    }

    /// The portal's management backend, if one is configured.
    pub fn management(&self) -> Option<Arc<dyn ManagementPlugin>> {
        self.pipeline.management()
    }

    /// Key types offered across all Auth extensions, with their owning
    /// plugins.
    pub fn key_types(&self) -> (HashMap<String, KeyType>, HashMap<String, Arc<dyn AuthPlugin>>) {
        self.pipeline.key_types()
    }

    /// Stops lifecycle extensions in reverse start order. Called once the
    /// listener has drained.
    pub fn shutdown(&self) {
        self.pipeline.stop();
    }
}

/// Fills the conventional log fields every logging extension can rely on.
fn prep_log(ctx: &mut ApiContext, req: &ApiRequest) {
    ctx.log.insert("client_ip".into(), Value::String(req.client_ip()));
    ctx.log.insert("path".into(), Value::String(ctx.path.clone()));
    ctx.log.insert("keyless".into(), Value::Bool(ctx.keyless));
    if let Some(key) = &ctx.key {
        ctx.log.insert("key_id".into(), Value::String(key.id.clone()));
        ctx.log.insert("key_realm".into(), Value::String(key.realm.clone()));
        ctx.log.insert("key_type".into(), Value::String(key.key_type.clone()));
    }
}
