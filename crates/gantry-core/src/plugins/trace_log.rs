//! Logging plugin that emits each request's log record as a structured
//! tracing event.

use crate::{
    error::GatewayError,
    plugin::{Extension, LoggingPlugin, PluginBuild, PluginConfig},
    types::{ApiContext, ApiRequest, ApiResponse},
};
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Writes `ctx.log` to the `gantry::access` tracing target.
#[derive(Debug, Default)]
pub struct TraceLogger {
    debug_level: bool,
}

impl PluginBuild for TraceLogger {
    fn default_config(&self) -> PluginConfig {
        let mut config = Map::new();
        config.insert("level".into(), Value::String("info".into()));
        config
    }

    fn configure(&mut self, config: PluginConfig) -> anyhow::Result<()> {
        let level = config.get("level").and_then(Value::as_str).unwrap_or("info");
        self.debug_level = match level {
            "info" => false,
            "debug" => true,
            other => return Err(anyhow!("'level' must be 'info' or 'debug', not '{other}'")),
        };
        Ok(())
    }

    fn into_extension(self: Box<Self>) -> Extension {
        Extension::new().with_logging(Arc::new(*self))
    }
}

#[async_trait]
impl LoggingPlugin for TraceLogger {
    async fn log(
        &self,
        req: &ApiRequest,
        res: &ApiResponse,
        ctx: &mut ApiContext,
    ) -> Result<(), GatewayError> {
        let entry = Value::Object(ctx.log.clone());
        if self.debug_level {
            debug!(
                target: "gantry::access",
                method = %req.method,
                uri = %req.uri,
                status = res.status.as_u16(),
                log = %entry,
            );
        } else {
            info!(
                target: "gantry::access",
                method = %req.method,
                uri = %req.uri,
                status = res.status.as_u16(),
                log = %entry,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode, Uri};

    #[test]
    fn test_configure_levels() {
        let mut plugin = TraceLogger::default();
        let mut config = Map::new();
        config.insert("level".into(), Value::String("debug".into()));
        plugin.configure(config).unwrap();
        assert!(plugin.debug_level);

        let mut config = Map::new();
        config.insert("level".into(), Value::String("verbose".into()));
        assert!(TraceLogger::default().configure(config).is_err());
    }

    #[tokio::test]
    async fn test_log_never_fails() {
        let mut plugin = TraceLogger::default();
        let defaults = plugin.default_config();
        plugin.configure(defaults).unwrap();

        let req = ApiRequest {
            method: Method::GET,
            uri: Uri::from_static("/x"),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: "127.0.0.1:1".parse().unwrap(),
        };
        let res = ApiResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let mut ctx = ApiContext::new();
        ctx.log.insert("client_ip".into(), Value::String("127.0.0.1".into()));

        assert!(plugin.log(&req, &res, &mut ctx).await.is_ok());
    }
}
