//! The extension contract: capability sets, construction and the per-stage
//! pipeline.
//!
//! An extension is one configured plugin instance implementing one or more
//! capability sets. Capabilities are independent traits; a single instance
//! may serve several stages (a management backend is also a plain backend,
//! an auth plugin may also own background work through
//! [`LifecyclePlugin`]).
//!
//! Construction goes through the registry: a factory closure produces a
//! fresh instance, the registry merges user configuration over the
//! plugin's defaults (type-checking each field), calls
//! [`configure`](PluginBuild::configure), and finally asks the instance for
//! its [`Extension`] capability record. No runtime reflection anywhere.

mod pipeline;
mod registry;

pub use pipeline::ExtensionPipeline;
pub use registry::{PluginInfo, PluginRegistry, RegistryError, Stage};

use crate::{
    error::GatewayError,
    mail::ErrorReporter,
    types::{ApiContext, ApiRequest, ApiResponse, Key, KeyType, User},
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Plugin configuration values, merged over the plugin's defaults.
pub type PluginConfig = Map<String, Value>;

/// What an Auth plugin found in a request: the probable key id, the key
/// type it belongs to, and scheme state carried through to validation
/// (signatures, nonces).
#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub key_id: String,
    pub key_type: String,
    pub state: Map<String, Value>,
}

/// Construction surface every plugin implements.
///
/// `default_config` returns the full set of configuration fields with their
/// default values; the registry guarantees `configure` receives a map with
/// every one of those fields present and type-matching. `into_extension`
/// hands the configured instance over as a capability record.
pub trait PluginBuild: Send + Sync {
    fn default_config(&self) -> PluginConfig {
        PluginConfig::new()
    }

    fn configure(&mut self, config: PluginConfig) -> anyhow::Result<()>;

    fn into_extension(self: Box<Self>) -> Extension;
}

/// Authentication capability: owns one or more key types.
///
/// `detect` inspects a request for credentials in any scheme this plugin
/// handles and returns `None` when it sees none. After a backend resolves
/// the full key, `validate` is called on the *same* plugin that detected it,
/// never on another one.
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    fn available_types(&self) -> Vec<KeyType>;

    /// Mints a fresh key of the given type, with scheme secrets filled in
    /// and the plugin's configured quota policy assigned.
    fn generate(&self, key_type: &str) -> Result<Key, GatewayError>;

    async fn detect(
        &self,
        req: &ApiRequest,
        ctx: &mut ApiContext,
    ) -> Result<Option<Detection>, GatewayError>;

    async fn validate(
        &self,
        key: &Key,
        req: &ApiRequest,
        ctx: &mut ApiContext,
        state: &Map<String, Value>,
    ) -> Result<bool, GatewayError>;
}

/// Key lookup capability. A backend answers `Ok(None)` for ids it does not
/// know and for key types it does not serve.
#[async_trait]
pub trait BackendPlugin: Send + Sync {
    async fn get_key(&self, key_id: &str, key_type: &str) -> Result<Option<Key>, GatewayError>;
}

/// Full user and key management on top of a backend store. The portal API
/// connects to the first configured backend with this capability.
///
/// `add_user` receives the preliminary user record; implementations persist
/// it with the given email and password and may flip `active` if the store
/// decides activation is unnecessary. `update_user` must not change email or
/// password.
#[async_trait]
pub trait ManagementPlugin: BackendPlugin {
    async fn add_user(&self, email: &str, password: &str, user: User)
        -> Result<User, GatewayError>;

    async fn get_user(&self, email: &str) -> Result<Option<User>, GatewayError>;

    async fn authenticate(&self, email: &str, password: &str)
        -> Result<Option<User>, GatewayError>;

    async fn activate_user(&self, email: &str) -> Result<(), GatewayError>;

    async fn reset_password(&self, email: &str, new_password: &str) -> Result<(), GatewayError>;

    async fn update_user(&self, email: &str, user: &User) -> Result<(), GatewayError>;

    async fn add_key(&self, email: &str, key: &Key) -> Result<(), GatewayError>;

    async fn delete_key(&self, email: &str, key_id: &str) -> Result<(), GatewayError>;

    async fn get_all_keys(&self, email: &str) -> Result<Vec<Key>, GatewayError>;
}

/// Runs after authentication, before quota. The place to restrict access or
/// adjust `ctx.cost` based on the request.
#[async_trait]
pub trait PostAuthPlugin: Send + Sync {
    async fn post_auth(&self, req: &mut ApiRequest, ctx: &mut ApiContext)
        -> Result<(), GatewayError>;
}

/// Runs after quota has been charged, right before the upstream call. The
/// caller has already paid quota here, so prefer a post-auth hook for likely
/// denials.
#[async_trait]
pub trait PreUpstreamPlugin: Send + Sync {
    async fn pre_upstream(
        &self,
        req: &mut ApiRequest,
        ctx: &mut ApiContext,
    ) -> Result<(), GatewayError>;
}

/// Runs on the upstream response before it is sent to the client; may
/// rewrite the response.
#[async_trait]
pub trait PostUpstreamPlugin: Send + Sync {
    async fn post_upstream(
        &self,
        req: &ApiRequest,
        res: &mut ApiResponse,
        ctx: &mut ApiContext,
    ) -> Result<(), GatewayError>;
}

/// Runs after the response has gone out. Logging plugins must persist the
/// entries in `ctx.log`; the response is read-only at this point.
#[async_trait]
pub trait LoggingPlugin: Send + Sync {
    async fn log(
        &self,
        req: &ApiRequest,
        res: &ApiResponse,
        ctx: &mut ApiContext,
    ) -> Result<(), GatewayError>;
}

/// Optional lifecycle hooks for extensions that own background work (flush
/// queues, timers). `start` runs after `configure` and receives a reporter
/// for runtime errors; `stop` runs at shutdown, in reverse start order, and
/// must drain before returning.
pub trait LifecyclePlugin: Send + Sync {
    fn start(&self, report: ErrorReporter) -> anyhow::Result<()>;

    fn stop(&self) -> anyhow::Result<()>;
}

/// The capability record of one configured extension instance.
#[derive(Clone, Default)]
pub struct Extension {
    pub name: String,
    pub auth: Option<Arc<dyn AuthPlugin>>,
    pub backend: Option<Arc<dyn BackendPlugin>>,
    pub management: Option<Arc<dyn ManagementPlugin>>,
    pub post_auth: Option<Arc<dyn PostAuthPlugin>>,
    pub pre_upstream: Option<Arc<dyn PreUpstreamPlugin>>,
    pub post_upstream: Option<Arc<dyn PostUpstreamPlugin>>,
    pub logging: Option<Arc<dyn LoggingPlugin>>,
    pub lifecycle: Option<Arc<dyn LifecyclePlugin>>,
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("name", &self.name)
            .field("auth", &self.auth.is_some())
            .field("backend", &self.backend.is_some())
            .field("management", &self.management.is_some())
            .field("post_auth", &self.post_auth.is_some())
            .field("pre_upstream", &self.pre_upstream.is_some())
            .field("post_upstream", &self.post_upstream.is_some())
            .field("logging", &self.logging.is_some())
            .field("lifecycle", &self.lifecycle.is_some())
            .finish()
    }
}

impl Extension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth(mut self, plugin: Arc<dyn AuthPlugin>) -> Self {
        self.auth = Some(plugin);
        self
    }

    pub fn with_backend(mut self, plugin: Arc<dyn BackendPlugin>) -> Self {
        self.backend = Some(plugin);
        self
    }

    pub fn with_management(mut self, plugin: Arc<dyn ManagementPlugin>) -> Self {
        self.management = Some(plugin);
        self
    }

    pub fn with_post_auth(mut self, plugin: Arc<dyn PostAuthPlugin>) -> Self {
        self.post_auth = Some(plugin);
        self
    }

    pub fn with_pre_upstream(mut self, plugin: Arc<dyn PreUpstreamPlugin>) -> Self {
        self.pre_upstream = Some(plugin);
        self
    }

    pub fn with_post_upstream(mut self, plugin: Arc<dyn PostUpstreamPlugin>) -> Self {
        self.post_upstream = Some(plugin);
        self
    }

    pub fn with_logging(mut self, plugin: Arc<dyn LoggingPlugin>) -> Self {
        self.logging = Some(plugin);
        self
    }

    pub fn with_lifecycle(mut self, plugin: Arc<dyn LifecyclePlugin>) -> Self {
        self.lifecycle = Some(plugin);
        self
    }
}
