//! Ordered per-stage extension lists.

use super::{
    AuthPlugin, BackendPlugin, LifecyclePlugin, LoggingPlugin, ManagementPlugin, PluginRegistry,
    PostAuthPlugin, PostUpstreamPlugin, PreUpstreamPlugin, RegistryError, Stage,
};
use crate::{config::PluginsConfig, mail::ErrorReporter, types::KeyType};
use std::{collections::HashMap, sync::Arc};
use tracing::{info, warn};

/// All configured extensions, grouped by stage in configured order.
///
/// Stages run sequentially; extensions within a stage run in the order they
/// were listed. The pipeline is built once at startup and read-only
/// afterwards; the extension instances themselves must tolerate concurrent
/// invocation.
#[derive(Default)]
pub struct ExtensionPipeline {
    pub auth: Vec<Arc<dyn AuthPlugin>>,
    pub backends: Vec<Arc<dyn BackendPlugin>>,
    pub post_auth: Vec<Arc<dyn PostAuthPlugin>>,
    pub pre_upstream: Vec<Arc<dyn PreUpstreamPlugin>>,
    pub post_upstream: Vec<Arc<dyn PostUpstreamPlugin>>,
    pub logging: Vec<Arc<dyn LoggingPlugin>>,

    management: Option<Arc<dyn ManagementPlugin>>,
    lifecycle: Vec<(String, Arc<dyn LifecyclePlugin>)>,
}

impl std::fmt::Debug for ExtensionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionPipeline")
            .field("auth", &self.auth.len())
            .field("backends", &self.backends.len())
            .field("post_auth", &self.post_auth.len())
            .field("pre_upstream", &self.pre_upstream.len())
            .field("post_upstream", &self.post_upstream.len())
            .field("logging", &self.logging.len())
            .field("management", &self.management.is_some())
            .field("lifecycle", &self.lifecycle.len())
            .finish()
    }
}

impl ExtensionPipeline {
    /// Builds every configured extension and slots it into its stage.
    ///
    /// A plugin listed in a stage whose capability it lacks fails startup
    /// with a diagnostic naming the plugin and stage. The first
    /// management-capable backend becomes the portal's store.
    pub fn from_config(
        registry: &PluginRegistry,
        config: &PluginsConfig,
    ) -> Result<Self, RegistryError> {
        let mut pipeline = Self::default();

        for entry in &config.auth {
            let ext = registry.build(entry)?;
            let plugin = ext.auth.ok_or_else(|| RegistryError::WrongStage {
                plugin: entry.plugin.clone(),
                stage: Stage::Auth,
            })?;
            pipeline.auth.push(plugin);
            pipeline.track_lifecycle(&ext.name, ext.lifecycle);
        }

        for entry in &config.backend {
            let ext = registry.build(entry)?;
            let plugin = ext.backend.ok_or_else(|| RegistryError::WrongStage {
                plugin: entry.plugin.clone(),
                stage: Stage::Backend,
            })?;
            pipeline.backends.push(plugin);
            if pipeline.management.is_none() {
                pipeline.management = ext.management;
            }
            pipeline.track_lifecycle(&ext.name, ext.lifecycle);
        }

        for entry in &config.post_auth {
            let ext = registry.build(entry)?;
            let plugin = ext.post_auth.ok_or_else(|| RegistryError::WrongStage {
                plugin: entry.plugin.clone(),
                stage: Stage::PostAuth,
            })?;
            pipeline.post_auth.push(plugin);
            pipeline.track_lifecycle(&ext.name, ext.lifecycle);
        }

        for entry in &config.pre_upstream {
            let ext = registry.build(entry)?;
            let plugin = ext.pre_upstream.ok_or_else(|| RegistryError::WrongStage {
                plugin: entry.plugin.clone(),
                stage: Stage::PreUpstream,
            })?;
            pipeline.pre_upstream.push(plugin);
            pipeline.track_lifecycle(&ext.name, ext.lifecycle);
        }

        for entry in &config.post_upstream {
            let ext = registry.build(entry)?;
            let plugin = ext.post_upstream.ok_or_else(|| RegistryError::WrongStage {
                plugin: entry.plugin.clone(),
                stage: Stage::PostUpstream,
            })?;
            pipeline.post_upstream.push(plugin);
            pipeline.track_lifecycle(&ext.name, ext.lifecycle);
        }

        for entry in &config.logging {
            let ext = registry.build(entry)?;
            let plugin = ext.logging.ok_or_else(|| RegistryError::WrongStage {
                plugin: entry.plugin.clone(),
                stage: Stage::Logging,
            })?;
            pipeline.logging.push(plugin);
            pipeline.track_lifecycle(&ext.name, ext.lifecycle);
        }

        Ok(pipeline)
    }

    fn track_lifecycle(&mut self, name: &str, lifecycle: Option<Arc<dyn LifecyclePlugin>>) {
        if let Some(plugin) = lifecycle {
            self.lifecycle.push((name.to_string(), plugin));
        }
    }

    /// The portal's management backend, if any configured backend has the
    /// capability.
    pub fn management(&self) -> Option<Arc<dyn ManagementPlugin>> {
        self.management.clone()
    }

    /// Aggregates key types over all Auth extensions, with the plugin owning
    /// each type. Later plugins win name collisions, matching their
    /// registration order.
    pub fn key_types(&self) -> (HashMap<String, KeyType>, HashMap<String, Arc<dyn AuthPlugin>>) {
        let mut types = HashMap::new();
        let mut owners: HashMap<String, Arc<dyn AuthPlugin>> = HashMap::new();
        for plugin in &self.auth {
            for key_type in plugin.available_types() {
                owners.insert(key_type.name.clone(), plugin.clone());
                types.insert(key_type.name.clone(), key_type);
            }
        }
        (types, owners)
    }

    /// Starts every lifecycle-owning extension in build order.
    pub fn start(&self, report: ErrorReporter) -> anyhow::Result<()> {
        for (name, plugin) in &self.lifecycle {
            plugin
                .start(report.clone())
                .map_err(|e| anyhow::anyhow!("error starting plugin '{name}': {e}"))?;
            info!(plugin = %name, "extension started");
        }
        Ok(())
    }

    /// Stops lifecycle-owning extensions in reverse start order. Stop errors
    /// are logged, not propagated; shutdown keeps going.
    pub fn stop(&self) {
        for (name, plugin) in self.lifecycle.iter().rev() {
            if let Err(e) = plugin.stop() {
                warn!(plugin = %name, error = %e, "error stopping plugin");
            } else {
                info!(plugin = %name, "extension stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginEntry;
    use parking_lot::Mutex;
    use serde_json::Map;

    #[derive(Default)]
    struct LifecycleProbe {
        events: Arc<Mutex<Vec<String>>>,
        name: String,
    }

    impl crate::plugin::PluginBuild for LifecycleProbe {
        fn configure(&mut self, config: crate::plugin::PluginConfig) -> anyhow::Result<()> {
            self.name = config
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("probe")
                .to_string();
            Ok(())
        }

        fn default_config(&self) -> crate::plugin::PluginConfig {
            let mut config = Map::new();
            config.insert("name".into(), "probe".into());
            config
        }

        fn into_extension(self: Box<Self>) -> crate::plugin::Extension {
            let shared = Arc::new(*self);
            crate::plugin::Extension::new()
                .with_logging(shared.clone())
                .with_lifecycle(shared)
        }
    }

    #[async_trait::async_trait]
    impl LoggingPlugin for LifecycleProbe {
        async fn log(
            &self,
            _req: &crate::types::ApiRequest,
            _res: &crate::types::ApiResponse,
            _ctx: &mut crate::types::ApiContext,
        ) -> Result<(), crate::error::GatewayError> {
            Ok(())
        }
    }

    impl LifecyclePlugin for LifecycleProbe {
        fn start(&self, _report: ErrorReporter) -> anyhow::Result<()> {
            self.events.lock().push(format!("start:{}", self.name));
            Ok(())
        }

        fn stop(&self) -> anyhow::Result<()> {
            self.events.lock().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    // The probe shares one global event sink per test through a thread local,
    // because factories are plain fn pointers.
    thread_local! {
        static EVENTS: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    }

    fn probe_factory() -> Box<dyn crate::plugin::PluginBuild> {
        let events = EVENTS.with(Arc::clone);
        Box::new(LifecycleProbe { events, name: String::new() })
    }

    fn probe_registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register(crate::plugin::PluginInfo {
            name: "probe",
            description: "records lifecycle events",
            link: "https://example.com/probe",
            factory: probe_factory,
        });
        registry
    }

    fn entry(name: &str, plugin_name: &str) -> PluginEntry {
        let mut config = Map::new();
        config.insert("name".into(), name.into());
        PluginEntry { plugin: plugin_name.into(), config }
    }

    fn noop_reporter() -> ErrorReporter {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_lifecycle_starts_in_order_and_stops_reversed() {
        EVENTS.with(|events| events.lock().clear());
        let registry = probe_registry();
        let config = PluginsConfig {
            logging: vec![entry("first", "probe"), entry("second", "probe")],
            ..Default::default()
        };

        let pipeline = ExtensionPipeline::from_config(&registry, &config).unwrap();
        pipeline.start(noop_reporter()).unwrap();
        pipeline.stop();

        let events = EVENTS.with(|events| events.lock().clone());
        assert_eq!(events, vec!["start:first", "start:second", "stop:second", "stop:first"]);
    }

    #[tokio::test]
    async fn test_wrong_stage_is_a_startup_error() {
        let registry = probe_registry();
        let config = PluginsConfig {
            auth: vec![entry("first", "probe")],
            ..Default::default()
        };

        let err = ExtensionPipeline::from_config(&registry, &config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("probe"));
        assert!(message.contains("auth"));
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_a_startup_error() {
        let registry = probe_registry();
        let config = PluginsConfig {
            logging: vec![PluginEntry { plugin: "ghost".into(), config: Map::new() }],
            ..Default::default()
        };

        let err = ExtensionPipeline::from_config(&registry, &config).unwrap_err();
        assert!(matches!(err, RegistryError::Unknown(name) if name == "ghost"));
    }
}
