//! Gateway configuration with layered loading.
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: serde field defaults below
//! 2. **Config file**: the YAML file named on the command line
//! 3. **Environment variables**: `GANTRY_*` overrides (`__` separates levels,
//!    e.g. `GANTRY_SERVE__PORT=8080`)
//!
//! Validation happens at load time and also normalizes the configuration:
//! path prefixes gain their trailing slash and a missing signing key is
//! generated, so the rest of the gateway never re-checks these.

use crate::{
    types::Quota,
    util::{ensure_final_slash, random_token},
};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

/// The quota policy every key falls back to. Must be configured.
pub const DEFAULT_QUOTA: &str = "default";
/// The quota policy governing anonymous traffic. Its presence enables
/// keyless access; it cannot carry a per-key maximum.
pub const KEYLESS_QUOTA: &str = "keyless";

const SIGNING_KEY_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Redis connection settings for the rate store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host. Defaults to `127.0.0.1`.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis port. Defaults to `6379`.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis database index. Defaults to `0`.
    #[serde(default)]
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { host: default_redis_host(), port: default_redis_port(), db: 0 }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

/// Outbound email settings: alert fan-out and transactional mail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Recipients of gateway error alerts. At least one is required.
    #[serde(default)]
    pub alerts_to: Vec<String>,

    /// Minimum minutes between two alert mails. Defaults to `30`.
    #[serde(default = "default_alerts_cooldown")]
    pub alerts_cooldown: u64,

    /// Sender address, e.g. `Your API <noreply@your-api.com>`.
    pub from: String,

    /// SMTP server host.
    pub server: String,

    /// SMTP server port. Defaults to `25`.
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,
}

fn default_alerts_cooldown() -> u64 {
    30
}

fn default_smtp_port() -> u16 {
    25
}

/// HTTP serving surface: listen port, API prefix, upstreams and the portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Port to listen on.
    pub port: u16,

    /// URL path prefix the gateway serves. Normalized to end with `/`.
    #[serde(default = "default_api_prefix")]
    pub api: String,

    /// Upstream base URLs the matched prefix proxies to. One is picked
    /// uniformly at random per request when several are configured.
    pub upstreams: Vec<String>,

    /// URL path prefix of the portal API. Empty disables the portal.
    #[serde(default)]
    pub portal_api: String,

    /// HS256 signing key for portal session tokens. Generated (64 random
    /// characters) when absent.
    #[serde(default)]
    pub signing_key: String,

    /// Ceiling on buffered request and response bodies, in bytes.
    /// Defaults to 1 MiB.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_api_prefix() -> String {
    "/".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Log level and format, applied at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g. "trace", "debug", "info", "warn", "error").
    /// Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty" or "json". Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// One configured plugin instance: a registered name plus its configuration
/// map, merged over the plugin's defaults at build time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginEntry {
    pub plugin: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
}

/// Plugin instances per pipeline stage, run in listed order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth: Vec<PluginEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend: Vec<PluginEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_auth: Vec<PluginEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_upstream: Vec<PluginEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_upstream: Vec<PluginEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logging: Vec<PluginEntry>,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub redis: RedisConfig,

    pub email: EmailConfig,

    pub quotas: HashMap<String, Quota>,

    pub serve: ServeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file plus `GANTRY_*` environment
    /// overrides, then validates and normalizes it.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let raw = Config::builder()
            .add_source(File::new(path, FileFormat::Yaml))
            .add_source(Environment::with_prefix("GANTRY").separator("__"))
            .build()?;

        let mut app: AppConfig = raw.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    /// Validates the configuration and normalizes prefixes and the signing
    /// key. Every failure names the offending field.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.serve.port == 0 {
            return Err(invalid("serve.port must be set"));
        }
        if self.serve.upstreams.is_empty() {
            return Err(invalid("serve.upstreams must list at least one upstream"));
        }
        for upstream in &self.serve.upstreams {
            let url = Url::parse(upstream)
                .map_err(|e| invalid(format!("invalid upstream address '{upstream}': {e}")))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(invalid(format!(
                    "upstream '{upstream}' must use an http or https scheme"
                )));
            }
        }

        if self.email.alerts_to.is_empty() {
            return Err(invalid(
                "email.alerts_to must define at least one recipient for error alerts",
            ));
        }

        if !self.quotas.contains_key(DEFAULT_QUOTA) {
            return Err(invalid("quotas must specify at least a 'default' quota"));
        }
        if let Some(keyless) = self.quotas.get(KEYLESS_QUOTA) {
            if keyless.max_key != 0 {
                return Err(invalid("the 'keyless' quota cannot set a per-key maximum"));
            }
        }

        self.serve.api = ensure_final_slash(&self.serve.api);
        if !self.serve.portal_api.is_empty() {
            self.serve.portal_api = ensure_final_slash(&self.serve.portal_api);
            if self.serve.portal_api == "/" {
                return Err(invalid("serve.portal_api cannot be the root path"));
            }
        }

        if self.serve.signing_key.is_empty() {
            self.serve.signing_key = random_token(SIGNING_KEY_LEN);
        }

        Ok(())
    }

    /// Whether anonymous access is enabled (a `keyless` quota is configured).
    pub fn allow_keyless(&self) -> bool {
        self.quotas.contains_key(KEYLESS_QUOTA)
    }

    /// An example configuration with sensible starter values, used by the
    /// `generate` CLI command. Plugin entries are filled in by the registry.
    pub fn example() -> Self {
        let mut quotas = HashMap::new();
        quotas.insert(DEFAULT_QUOTA.to_string(), Quota { minutes: 5, max_ip: 50, max_key: 5000 });
        quotas.insert(KEYLESS_QUOTA.to_string(), Quota { minutes: 5, max_ip: 20, max_key: 0 });

        Self {
            redis: RedisConfig::default(),
            email: EmailConfig {
                alerts_to: vec!["your@email.com".to_string()],
                alerts_cooldown: 30,
                from: "Your API <noreply@your-api.com>".to_string(),
                server: "localhost".to_string(),
                port: 25,
                user: String::new(),
                password: String::new(),
            },
            quotas,
            serve: ServeConfig {
                port: 5000,
                api: "/".to_string(),
                upstreams: vec!["http://your-actual-api:8000/".to_string()],
                portal_api: "/portal-api/".to_string(),
                signing_key: random_token(SIGNING_KEY_LEN),
                max_body_bytes: default_max_body_bytes(),
            },
            logging: LoggingConfig::default(),
            plugins: PluginsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::example();
        config.serve.signing_key = String::new();
        config
    }

    #[test]
    fn test_example_config_validates() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_signing_key_generated_when_absent() {
        let mut config = valid_config();
        config.validate().unwrap();
        assert_eq!(config.serve.signing_key.len(), 64);
    }

    #[test]
    fn test_prefixes_normalized() {
        let mut config = valid_config();
        config.serve.api = "/api".to_string();
        config.serve.portal_api = "/portal-api".to_string();
        config.validate().unwrap();
        assert_eq!(config.serve.api, "/api/");
        assert_eq!(config.serve.portal_api, "/portal-api/");
    }

    #[test]
    fn test_default_quota_required() {
        let mut config = valid_config();
        config.quotas.remove(DEFAULT_QUOTA);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn test_keyless_quota_cannot_limit_keys() {
        let mut config = valid_config();
        config
            .quotas
            .insert(KEYLESS_QUOTA.to_string(), Quota { minutes: 5, max_ip: 5, max_key: 10 });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keyless"));
    }

    #[test]
    fn test_alert_recipients_required() {
        let mut config = valid_config();
        config.email.alerts_to.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("alerts_to"));
    }

    #[test]
    fn test_invalid_upstream_rejected() {
        let mut config = valid_config();
        config.serve.upstreams = vec!["not a url".to_string()];
        assert!(config.validate().is_err());

        config.serve.upstreams = vec!["ftp://example.com/".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_portal_cannot_live_at_root() {
        let mut config = valid_config();
        config.serve.portal_api = "/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
redis:
  host: 127.0.0.1
  port: 6379
  db: 1
email:
  alerts_to: [ops@example.com]
  from: "Gantry <noreply@example.com>"
  server: localhost
quotas:
  default:
    minutes: 5
    max_key: 10
  keyless:
    minutes: 5
    max_ip: 5
serve:
  port: 5000
  api: /
  upstreams:
  - http://your-actual-api:8000/
  portal_api: /portal-api/
  signing_key: test-signing-key
plugins:
  auth:
  - plugin: hmac
  backend:
  - plugin: memory
"#;
        let mut config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.redis.db, 1);
        assert_eq!(config.quotas[DEFAULT_QUOTA].max_key, 10);
        assert!(config.allow_keyless());
        assert_eq!(config.plugins.auth[0].plugin, "hmac");
        assert_eq!(config.plugins.backend[0].plugin, "memory");
        assert_eq!(config.serve.max_body_bytes, 1024 * 1024);
    }
}
