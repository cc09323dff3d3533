//! Portal middleware: JSON content-type enforcement and JWT sessions.

use super::PortalState;
use crate::router::into_response;
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use gantry_core::{error::ErrorEnvelope, types::ApiResponse};
use http::{Method, StatusCode};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// The authenticated user's email, inserted into request extensions by
/// [`require_session`].
#[derive(Debug, Clone)]
pub struct SessionEmail(pub String);

/// Claims carried by portal session tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub email: String,
    pub exp: i64,
}

pub(crate) fn abort(status: StatusCode, message: impl Into<String>) -> Response {
    into_response(ApiResponse::json(status, &ErrorEnvelope::new(message)))
}

/// Non-GET portal requests must declare a JSON body.
pub async fn require_json_body(req: Request<Body>, next: Next) -> Response {
    if req.method() != Method::GET {
        let json = req
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));
        if !json {
            return abort(
                StatusCode::BAD_REQUEST,
                "portal requests must carry a Content-Type of application/json",
            );
        }
    }
    next.run(req).await
}

/// Validates the `Authorization: Bearer` session token and makes the
/// session email available to handlers.
///
/// Only HS256 under the gateway's signing key is acceptable; any other
/// algorithm (including `none`), a bad signature or an expired token is a
/// 403.
pub async fn require_session(
    State(state): State<PortalState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(token) = token else {
        return abort(
            StatusCode::FORBIDDEN,
            "Access denied: please authenticate using a valid token.",
        );
    };

    let validation = Validation::new(Algorithm::HS256);
    let decoded = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.signing_key.as_bytes()),
        &validation,
    );

    match decoded {
        Ok(data) if !data.claims.email.is_empty() => {
            req.extensions_mut().insert(SessionEmail(data.claims.email));
            next.run(req).await
        }
        Ok(_) => abort(
            StatusCode::FORBIDDEN,
            "Access denied: user token did not supply a valid user.",
        ),
        Err(e) => abort(
            StatusCode::FORBIDDEN,
            format!("Access denied: {e} -- please authenticate using a valid token."),
        ),
    }
}
