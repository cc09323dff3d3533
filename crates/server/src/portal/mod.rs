//! The self-service portal API.
//!
//! JSON-in/JSON-out routes for account registration, email activation,
//! login, password reset and credential management, backed by the first
//! configured management-capable backend. Sessions are compact HS256 JWTs
//! signed with the gateway's signing key.

mod handlers;
mod middleware;

pub use middleware::SessionEmail;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use gantry_core::{
    gateway::Gateway,
    mail::Mailer,
    plugin::{AuthPlugin, ManagementPlugin},
    store::RateStore,
    types::{KeyType, Quota},
};
use std::{collections::HashMap, sync::Arc};

/// Everything the portal handlers need, cloned per request by axum.
#[derive(Clone)]
pub struct PortalState {
    pub management: Arc<dyn ManagementPlugin>,
    pub key_types: HashMap<String, KeyType>,
    pub key_plugins: HashMap<String, Arc<dyn AuthPlugin>>,
    pub store: Arc<dyn RateStore>,
    pub mailer: Arc<dyn Mailer>,
    pub signing_key: String,
    pub quotas: HashMap<String, Quota>,
}

/// Builds the portal router for a gateway.
///
/// Fails when no configured backend supports user management -- the portal
/// cannot exist without one.
pub fn router(gateway: &Arc<Gateway>) -> anyhow::Result<Router> {
    let management = gateway.management().ok_or_else(|| {
        anyhow::anyhow!(
            "cannot serve the portal API: no configured backend plugin supports user management"
        )
    })?;
    let (key_types, key_plugins) = gateway.key_types();

    let state = PortalState {
        management,
        key_types,
        key_plugins,
        store: gateway.store(),
        mailer: gateway.mailer(),
        signing_key: gateway.signing_key().to_string(),
        quotas: gateway.quotas().clone(),
    };

    let public = Router::new()
        .route("/account", post(handlers::create_account))
        .route("/account/activate/:code", get(handlers::activate_account))
        .route("/account/token", post(handlers::issue_token))
        .route("/account/request", post(handlers::request_password_reset))
        .route("/account/reset", post(handlers::reset_password));

    let protected = Router::new()
        .route("/account/update", post(handlers::update_profile))
        .route("/keys/types", get(handlers::list_key_types))
        .route("/keys", get(handlers::list_keys).post(handlers::create_key))
        .route("/keys/delete", post(handlers::delete_key))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_session));

    Ok(public
        .merge(protected)
        .layer(axum_middleware::from_fn(middleware::require_json_body))
        .with_state(state))
}
