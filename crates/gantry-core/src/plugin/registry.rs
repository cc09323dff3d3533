//! The plugin registry: names, metadata and factory closures.
//!
//! The registry is populated once from the composition root and read-only
//! afterwards. Building an instance merges the user's configuration over the
//! plugin's defaults, type-checks every defaulted field, runs `configure`,
//! and returns the instance's capability record.

use super::{Extension, PluginBuild, PluginConfig};
use crate::config::{PluginEntry, PluginsConfig};
use serde_json::Value;
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

/// One registered plugin: metadata for the CLI plus the factory that makes
/// fresh unconfigured instances.
pub struct PluginInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub link: &'static str,
    pub factory: fn() -> Box<dyn PluginBuild>,
}

/// The pipeline stage a plugin entry was configured into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Auth,
    Backend,
    PostAuth,
    PreUpstream,
    PostUpstream,
    Logging,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auth => "auth",
            Self::Backend => "backend",
            Self::PostAuth => "post_auth",
            Self::PreUpstream => "pre_upstream",
            Self::PostUpstream => "post_upstream",
            Self::Logging => "logging",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no plugin named '{0}' is registered")]
    Unknown(String),

    #[error("while configuring '{plugin}': field '{field}': expected a value of type {expected}")]
    TypeMismatch { plugin: String, field: String, expected: &'static str },

    #[error("while configuring '{plugin}': {source}")]
    Configure { plugin: String, source: anyhow::Error },

    #[error("plugin '{plugin}' cannot run in the {stage} stage")]
    WrongStage { plugin: String, stage: Stage },
}

/// Name-keyed plugin table. Iteration order is the sorted plugin name, which
/// the CLI listing relies on.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, PluginInfo>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in plugin registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        crate::plugins::register_builtin(&mut registry);
        registry
    }

    pub fn register(&mut self, info: PluginInfo) {
        self.plugins.insert(info.name, info);
    }

    pub fn get(&self, name: &str) -> Option<&PluginInfo> {
        self.plugins.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginInfo> {
        self.plugins.values()
    }

    /// Builds and configures one extension instance from a config entry.
    pub fn build(&self, entry: &PluginEntry) -> Result<Extension, RegistryError> {
        let info = self
            .plugins
            .get(entry.plugin.as_str())
            .ok_or_else(|| RegistryError::Unknown(entry.plugin.clone()))?;

        let mut plugin = (info.factory)();
        let merged = merge_defaults(entry.config.clone(), plugin.default_config()).map_err(
            |(field, expected)| RegistryError::TypeMismatch {
                plugin: entry.plugin.clone(),
                field,
                expected,
            },
        )?;
        plugin
            .configure(merged)
            .map_err(|source| RegistryError::Configure { plugin: entry.plugin.clone(), source })?;

        let mut extension = plugin.into_extension();
        extension.name = info.name.to_string();
        Ok(extension)
    }

    /// Places the named plugins into a plugins section with their default
    /// configurations, for generated example configs. Multi-capability
    /// plugins land in their most significant stage.
    pub fn example_entries(&self, names: &[String]) -> Result<PluginsConfig, RegistryError> {
        let mut plugins = PluginsConfig::default();
        for name in names {
            let info =
                self.plugins.get(name.as_str()).ok_or_else(|| RegistryError::Unknown(name.clone()))?;
            let instance = (info.factory)();
            let entry = PluginEntry { plugin: name.clone(), config: instance.default_config() };
            let capabilities = instance.into_extension();

            if capabilities.auth.is_some() {
                plugins.auth.push(entry);
            } else if capabilities.management.is_some() || capabilities.backend.is_some() {
                plugins.backend.push(entry);
            } else if capabilities.pre_upstream.is_some() {
                plugins.pre_upstream.push(entry);
            } else if capabilities.post_upstream.is_some() {
                plugins.post_upstream.push(entry);
            } else if capabilities.post_auth.is_some() {
                plugins.post_auth.push(entry);
            } else if capabilities.logging.is_some() {
                plugins.logging.push(entry);
            }
        }
        Ok(plugins)
    }
}

/// Merges user configuration over plugin defaults. Every default field ends
/// up present; user values must match the default's JSON type. Fields the
/// plugin never declared pass through untouched.
fn merge_defaults(
    user: PluginConfig,
    defaults: PluginConfig,
) -> Result<PluginConfig, (String, &'static str)> {
    let mut merged = user;
    for (field, default) in defaults {
        match merged.get(&field) {
            Some(value) if !same_kind(value, &default) => {
                return Err((field, kind_name(&default)));
            }
            Some(_) => {}
            None => {
                merged.insert(field, default);
            }
        }
    }
    Ok(merged)
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null) |
            (Value::Bool(_), Value::Bool(_)) |
            (Value::Number(_), Value::Number(_)) |
            (Value::String(_), Value::String(_)) |
            (Value::Array(_), Value::Array(_)) |
            (Value::Object(_), Value::Object(_))
    )
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> PluginConfig {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected a JSON object"),
        }
    }

    #[test]
    fn test_merge_fills_missing_defaults() {
        let merged = merge_defaults(
            config(json!({"quota": "gold"})),
            config(json!({"quota": "default", "header": "Authorization"})),
        )
        .unwrap();

        assert_eq!(merged["quota"], "gold");
        assert_eq!(merged["header"], "Authorization");
    }

    #[test]
    fn test_merge_rejects_type_mismatch() {
        let err = merge_defaults(
            config(json!({"minutes": "five"})),
            config(json!({"minutes": 5})),
        )
        .unwrap_err();

        assert_eq!(err.0, "minutes");
        assert_eq!(err.1, "number");
    }

    #[test]
    fn test_merge_keeps_undeclared_fields() {
        let merged = merge_defaults(
            config(json!({"extra": true})),
            config(json!({"quota": "default"})),
        )
        .unwrap();

        assert_eq!(merged["extra"], true);
        assert_eq!(merged["quota"], "default");
    }

    #[test]
    fn test_build_unknown_plugin_fails() {
        let registry = PluginRegistry::new();
        let entry = PluginEntry { plugin: "missing".into(), config: PluginConfig::new() };

        let err = registry.build(&entry).unwrap_err();
        assert!(matches!(err, RegistryError::Unknown(name) if name == "missing"));
    }

    #[test]
    fn test_builtin_registry_lists_sorted_names() {
        let registry = PluginRegistry::builtin();
        let names: Vec<&str> = registry.iter().map(|info| info.name).collect();

        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
        assert!(names.contains(&"hmac"));
        assert!(names.contains(&"memory"));
        assert!(names.contains(&"log-tracing"));
    }

    #[test]
    fn test_builtin_build_applies_user_config() {
        let registry = PluginRegistry::builtin();
        let entry = PluginEntry {
            plugin: "hmac".into(),
            config: config(json!({"quota": "gold"})),
        };

        let extension = registry.build(&entry).unwrap();
        assert_eq!(extension.name, "hmac");
        let auth = extension.auth.expect("hmac implements the auth capability");
        let key = auth.generate("HMAC").unwrap();
        assert_eq!(key.quota, "gold");
    }

    #[test]
    fn test_builtin_type_mismatch_names_field() {
        let registry = PluginRegistry::builtin();
        let entry = PluginEntry {
            plugin: "hmac".into(),
            config: config(json!({"quota": 5})),
        };

        let err = registry.build(&entry).unwrap_err().to_string();
        assert!(err.contains("hmac"));
        assert!(err.contains("quota"));
        assert!(err.contains("string"));
    }

    #[test]
    fn test_example_entries_place_plugins_by_capability() {
        let registry = PluginRegistry::builtin();
        let plugins = registry
            .example_entries(&["hmac".into(), "memory".into(), "log-tracing".into()])
            .unwrap();

        assert_eq!(plugins.auth.len(), 1);
        assert_eq!(plugins.auth[0].plugin, "hmac");
        assert_eq!(plugins.backend.len(), 1);
        assert_eq!(plugins.backend[0].plugin, "memory");
        assert_eq!(plugins.logging.len(), 1);
        assert_eq!(plugins.logging[0].plugin, "log-tracing");
    }

    #[test]
    fn test_example_entries_unknown_plugin_fails() {
        let registry = PluginRegistry::builtin();
        let err = registry.example_entries(&["nope".into()]).unwrap_err();
        assert!(matches!(err, RegistryError::Unknown(name) if name == "nope"));
    }
}
