//! Router assembly: the portal API nested under its prefix, everything else
//! falling through to the gateway pipeline.

use crate::portal;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::{IntoResponse, Response},
    Router,
};
use gantry_core::{
    error::ErrorEnvelope,
    gateway::Gateway,
    types::{ApiRequest, ApiResponse},
};
use http::StatusCode;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};

/// Client connections get this long to produce and accept a response.
const CLIENT_DEADLINE: Duration = Duration::from_secs(10);

/// Builds the complete application router for a gateway.
///
/// Fails when a portal prefix is configured but no backend supports user
/// management.
pub fn build_router(gateway: Arc<Gateway>) -> anyhow::Result<Router> {
    let pipeline = Router::new().fallback(handle_gateway).with_state(gateway.clone());

    let mut app = Router::new();
    if !gateway.portal_prefix().is_empty() {
        let prefix = gateway.portal_prefix().trim_end_matches('/').to_string();
        app = app.nest(&prefix, portal::router(&gateway)?);
    }

    Ok(app
        .merge(pipeline)
        .layer(RequestBodyLimitLayer::new(gateway.max_body_bytes()))
        .layer(TimeoutLayer::new(CLIENT_DEADLINE)))
}

/// The catch-all gateway handler: buffers the body, runs the pipeline, and
/// converts the outcome back into an HTTP response.
async fn handle_gateway(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let (parts, body) = req.into_parts();

    if !parts.uri.path().starts_with(gateway.api_prefix()) {
        return into_response(ApiResponse::json(
            StatusCode::NOT_FOUND,
            &ErrorEnvelope::new(format!("no API is served under '{}'", parts.uri.path())),
        ));
    }

    let body = match axum::body::to_bytes(body, gateway.max_body_bytes()).await {
        Ok(body) => body,
        Err(_) => {
            return into_response(ApiResponse::json(
                StatusCode::PAYLOAD_TOO_LARGE,
                &ErrorEnvelope::new("request body exceeds the configured ceiling"),
            ));
        }
    };

    let api_req = ApiRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        remote_addr,
    };

    into_response(gateway.handle(api_req).await)
}

/// Converts a pipeline response into an axum response.
pub(crate) fn into_response(res: ApiResponse) -> Response {
    let mut builder = Response::builder().status(res.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = res.headers;
    }
    builder
        .body(Body::from(res.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{
        config::{AppConfig, EmailConfig, PluginEntry, ServeConfig},
        gateway::GatewayBuilder,
        mail::MemoryMailer,
        store::MemoryStore,
        types::Quota,
    };
    use std::collections::HashMap;

    async fn test_gateway(portal: bool) -> Arc<Gateway> {
        let mut quotas = HashMap::new();
        quotas.insert("default".to_string(), Quota { minutes: 5, max_ip: 0, max_key: 0 });
        quotas.insert("keyless".to_string(), Quota { minutes: 5, max_ip: 0, max_key: 0 });

        let config = AppConfig {
            redis: Default::default(),
            email: EmailConfig {
                alerts_to: vec!["ops@example.com".into()],
                alerts_cooldown: 30,
                from: "Gantry <noreply@example.com>".into(),
                server: "localhost".into(),
                port: 25,
                user: String::new(),
                password: String::new(),
            },
            quotas,
            serve: ServeConfig {
                port: 5000,
                api: "/".into(),
                upstreams: vec!["http://127.0.0.1:1/".into()],
                portal_api: if portal { "/portal-api/".into() } else { String::new() },
                signing_key: "test-signing-key".into(),
                max_body_bytes: 1024 * 1024,
            },
            logging: Default::default(),
            plugins: gantry_core::config::PluginsConfig {
                backend: if portal {
                    vec![PluginEntry { plugin: "memory".into(), config: Default::default() }]
                } else {
                    Vec::new()
                },
                ..Default::default()
            },
        };

        GatewayBuilder::new(config)
            .store(Arc::new(MemoryStore::new()))
            .mailer(Arc::new(MemoryMailer::new()))
            .build()
            .await
            .expect("gateway should build")
    }

    #[tokio::test]
    async fn test_router_builds_with_and_without_portal() {
        assert!(build_router(test_gateway(true).await).is_ok());
        assert!(build_router(test_gateway(false).await).is_ok());
    }

    #[tokio::test]
    async fn test_portal_without_management_backend_fails() {
        let gateway = {
            let mut quotas = HashMap::new();
            quotas.insert("default".to_string(), Quota { minutes: 5, max_ip: 0, max_key: 0 });
            let config = AppConfig {
                redis: Default::default(),
                email: EmailConfig {
                    alerts_to: vec!["ops@example.com".into()],
                    alerts_cooldown: 30,
                    from: "Gantry <noreply@example.com>".into(),
                    server: "localhost".into(),
                    port: 25,
                    user: String::new(),
                    password: String::new(),
                },
                quotas,
                serve: ServeConfig {
                    port: 5000,
                    api: "/".into(),
                    upstreams: vec!["http://127.0.0.1:1/".into()],
                    portal_api: "/portal-api/".into(),
                    signing_key: "k".into(),
                    max_body_bytes: 1024,
                },
                logging: Default::default(),
                plugins: Default::default(),
            };
            GatewayBuilder::new(config)
                .store(Arc::new(MemoryStore::new()))
                .mailer(Arc::new(MemoryMailer::new()))
                .build()
                .await
                .unwrap()
        };

        let err = build_router(gateway).unwrap_err().to_string();
        assert!(err.contains("user management"), "unexpected error: {err}");
    }
}
