//! Portal route handlers.

use super::{
    middleware::{abort, Claims},
    PortalState, SessionEmail,
};
use crate::router::into_response;
use axum::{
    extract::{Path, State},
    response::Response,
    Extension,
};
use bytes::Bytes;
use gantry_core::{
    config::DEFAULT_QUOTA,
    mail::{ContentKind, Recipient},
    store::{ACTIVATION_PREFIX, PASSWORD_RESET_PREFIX},
    types::{ApiResponse, Key, Quota, User},
    util::random_token,
};
use http::StatusCode;
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::warn;

const CODE_LEN: usize = 48;
const ACTIVATION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const RESET_TTL: Duration = Duration::from_secs(60 * 60);
const SESSION_TTL_HOURS: i64 = 12;

fn ok_json<T: Serialize>(body: &T) -> Response {
    into_response(ApiResponse::json(StatusCode::OK, body))
}

/// Parses a JSON request body, turning malformed input into the given 400.
fn parse<T: for<'de> Deserialize<'de>>(body: &Bytes, usage: &str) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|_| abort(StatusCode::BAD_REQUEST, usage))
}

/// A key enriched with its resolved quota policy and current average, as
/// listed and returned by the key routes.
#[derive(Debug, Serialize)]
struct KeyWithQuota {
    key: Key,
    quota: Quota,
    avg: f64,
}

fn resolve_quota(state: &PortalState, name: &str) -> Quota {
    state
        .quotas
        .get(name)
        .or_else(|| state.quotas.get(DEFAULT_QUOTA))
        .copied()
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct NewAccount {
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    profile: Map<String, Value>,
    #[serde(default)]
    link: String,
}

/// `POST /account`: registers an inactive account and mails the activation
/// link. The caller supplies a link template containing `CODE`.
pub async fn create_account(State(state): State<PortalState>, body: Bytes) -> Response {
    const USAGE: &str =
        "Request a new account by supplying email, name, password and a template for an activation link.";
    let new: NewAccount = match parse(&body, USAGE) {
        Ok(new) => new,
        Err(res) => return res,
    };
    if new.email.is_empty() || new.name.is_empty() || new.password.is_empty() || new.link.is_empty()
    {
        return abort(StatusCode::BAD_REQUEST, USAGE);
    }

    let user = User {
        email: new.email.clone(),
        name: new.name.clone(),
        active: false,
        profile: new.profile,
    };
    let user = match state.management.add_user(&new.email, &new.password, user).await {
        Ok(user) => user,
        Err(e) => {
            return abort(StatusCode::BAD_REQUEST, format!("Could not create new account: {e}"));
        }
    };

    // The backend may have activated the account on its own; only unactivated
    // accounts go through email verification.
    if !user.active {
        let code = random_token(CODE_LEN);
        if let Err(e) = state
            .store
            .set_code(ACTIVATION_PREFIX, &code, &user.email, ACTIVATION_TTL)
            .await
        {
            return abort(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
        let link = new.link.replacen("CODE", &code, 1);
        let mail = state
            .mailer
            .send(
                Recipient::Address(user.email.clone()),
                "Activate your account",
                ContentKind::Plain,
                format!(
                    "Hi {},\n\nplease activate your developer account by visiting this link:\n{}\n",
                    user.name, link
                ),
            )
            .await;
        if let Err(e) = mail {
            warn!(error = %e, email = %user.email, "activation mail failed");
        }
    }

    ok_json(&user)
}

/// `GET /account/activate/{code}`: redeems an activation code. Codes are
/// consumed on success, so a second redemption is a 403.
pub async fn activate_account(
    State(state): State<PortalState>,
    Path(code): Path<String>,
) -> Response {
    let email = match state.store.get_code(ACTIVATION_PREFIX, &code).await {
        Ok(Some(email)) => email,
        Ok(None) => return abort(StatusCode::FORBIDDEN, "Invalid or expired activation code."),
        Err(e) => return abort(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    if let Err(e) = state.management.activate_user(&email).await {
        return abort(StatusCode::INTERNAL_SERVER_ERROR, format!("Could not activate account: {e}"));
    }
    if let Err(e) = state.store.delete_code(ACTIVATION_PREFIX, &code).await {
        warn!(error = %e, "could not consume activation code");
    }

    ok_json(&json!({"success": "Activation successful. Please return to the login page."}))
}

#[derive(Deserialize)]
struct Login {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

/// `POST /account/token`: verifies credentials and issues an HS256 session
/// token valid for twelve hours. Only active accounts get sessions.
pub async fn issue_token(State(state): State<PortalState>, body: Bytes) -> Response {
    const USAGE: &str = "Log in by supplying your email and password.";
    let login: Login = match parse(&body, USAGE) {
        Ok(login) => login,
        Err(res) => return res,
    };
    if login.email.is_empty() || login.password.is_empty() {
        return abort(StatusCode::BAD_REQUEST, USAGE);
    }

    let user = match state.management.authenticate(&login.email, &login.password).await {
        Ok(Some(user)) => user,
        Ok(None) => return abort(StatusCode::FORBIDDEN, "Wrong email/password combination."),
        Err(e) => return abort(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    if !user.active {
        return abort(StatusCode::FORBIDDEN, "This account has not been activated yet.");
    }

    let claims = Claims {
        email: user.email.clone(),
        exp: (chrono::Utc::now() + chrono::Duration::hours(SESSION_TTL_HOURS)).timestamp(),
    };
    let token = match jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.signing_key.as_bytes()),
    ) {
        Ok(token) => token,
        Err(e) => {
            return abort(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not create authentication token: {e}"),
            );
        }
    };

    ok_json(&json!({"name": user.name, "email": user.email, "token": token}))
}

#[derive(Deserialize)]
struct ProfileUpdate {
    #[serde(default)]
    name: String,
    #[serde(default)]
    profile: Map<String, Value>,
}

/// `POST /account/update`: merges a new name and/or profile into the
/// session user.
pub async fn update_profile(
    State(state): State<PortalState>,
    Extension(SessionEmail(email)): Extension<SessionEmail>,
    body: Bytes,
) -> Response {
    const USAGE: &str = "Supply a new name, a new profile, or both.";
    let update: ProfileUpdate = match parse(&body, USAGE) {
        Ok(update) => update,
        Err(res) => return res,
    };

    let mut user = match state.management.get_user(&email).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return abort(StatusCode::NOT_FOUND, "Your user was not found. Please log in again.");
        }
        Err(e) => return abort(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    if !update.name.is_empty() {
        user.name = update.name;
    }
    if !update.profile.is_empty() {
        user.profile = update.profile;
    }
    if let Err(e) = state.management.update_user(&email, &user).await {
        return abort(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Couldn't update user profile: {e}"),
        );
    }

    ok_json(&user)
}

#[derive(Deserialize)]
struct ResetRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    link: String,
}

/// `POST /account/request`: requests a password reset link. Responds the
/// same whether or not the account exists; mail only goes to known
/// addresses.
pub async fn request_password_reset(State(state): State<PortalState>, body: Bytes) -> Response {
    const USAGE: &str =
        "Request a password reset by supplying your email and a template for a reset link.";
    let request: ResetRequest = match parse(&body, USAGE) {
        Ok(request) => request,
        Err(res) => return res,
    };
    if request.email.is_empty() || request.link.is_empty() {
        return abort(StatusCode::BAD_REQUEST, USAGE);
    }

    let user = match state.management.get_user(&request.email).await {
        Ok(user) => user,
        Err(e) => return abort(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    if let Some(user) = user {
        let code = random_token(CODE_LEN);
        if let Err(e) = state
            .store
            .set_code(PASSWORD_RESET_PREFIX, &code, &user.email, RESET_TTL)
            .await
        {
            return abort(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
        let link = request.link.replacen("CODE", &code, 1);
        let mail = state
            .mailer
            .send(
                Recipient::Address(user.email.clone()),
                "Reset your password",
                ContentKind::Plain,
                format!(
                    "Hi {},\n\na password reset was requested for your account. Visit this link to choose a new password:\n{}\n\nIf you did not request this, you can ignore this message.\n",
                    user.name, link
                ),
            )
            .await;
        if let Err(e) = mail {
            warn!(error = %e, email = %user.email, "password reset mail failed");
        }
    }

    ok_json(&json!({"success": "If the address exists, a password reset link has been sent."}))
}

#[derive(Deserialize)]
struct PasswordReset {
    #[serde(default)]
    code: String,
    #[serde(default)]
    password: String,
}

/// `POST /account/reset`: consumes a reset code and sets the new password.
pub async fn reset_password(State(state): State<PortalState>, body: Bytes) -> Response {
    const USAGE: &str = "Reset your password by supplying the reset code and a new password.";
    let reset: PasswordReset = match parse(&body, USAGE) {
        Ok(reset) => reset,
        Err(res) => return res,
    };
    if reset.code.is_empty() || reset.password.is_empty() {
        return abort(StatusCode::BAD_REQUEST, USAGE);
    }

    let email = match state.store.get_code(PASSWORD_RESET_PREFIX, &reset.code).await {
        Ok(Some(email)) => email,
        Ok(None) => return abort(StatusCode::FORBIDDEN, "Invalid or expired reset code."),
        Err(e) => return abort(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    if let Err(e) = state.management.reset_password(&email, &reset.password).await {
        return abort(StatusCode::INTERNAL_SERVER_ERROR, format!("Could not reset password: {e}"));
    }
    if let Err(e) = state.store.delete_code(PASSWORD_RESET_PREFIX, &reset.code).await {
        warn!(error = %e, "could not consume reset code");
    }

    ok_json(&json!({"success": "Password reset. You can now log in with your new password."}))
}

/// `GET /keys/types`: the key types offered across all Auth extensions.
pub async fn list_key_types(
    State(state): State<PortalState>,
    Extension(SessionEmail(_)): Extension<SessionEmail>,
) -> Response {
    ok_json(&state.key_types)
}

/// `GET /keys`: the session user's keys, each with its resolved quota and
/// current usage average from the rate store.
pub async fn list_keys(
    State(state): State<PortalState>,
    Extension(SessionEmail(email)): Extension<SessionEmail>,
) -> Response {
    let keys = match state.management.get_all_keys(&email).await {
        Ok(keys) => keys,
        Err(e) => return abort(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let ids: Vec<String> = keys.iter().map(|key| key.id.clone()).collect();
    let avgs = match state.store.key_averages(&ids).await {
        Ok(avgs) => avgs,
        Err(e) => return abort(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let results: Vec<KeyWithQuota> = keys
        .into_iter()
        .zip(avgs)
        .map(|(key, avg)| {
            let quota = resolve_quota(&state, &key.quota);
            KeyWithQuota { key, quota, avg }
        })
        .collect();

    ok_json(&results)
}

#[derive(Deserialize)]
struct NewKey {
    #[serde(rename = "type", default)]
    key_type: String,
    #[serde(default)]
    realm: String,
}

/// `POST /keys`: asks the Auth extension owning the requested type to mint
/// a key, then stores it for the session user.
pub async fn create_key(
    State(state): State<PortalState>,
    Extension(SessionEmail(email)): Extension<SessionEmail>,
    body: Bytes,
) -> Response {
    const USAGE: &str = "Specify a key type.";
    let new: NewKey = match parse(&body, USAGE) {
        Ok(new) => new,
        Err(res) => return res,
    };
    if new.key_type.is_empty() {
        return abort(StatusCode::BAD_REQUEST, USAGE);
    }

    let Some(plugin) = state.key_plugins.get(&new.key_type) else {
        return abort(
            StatusCode::BAD_REQUEST,
            "The requested key type is not available for creation.",
        );
    };

    let mut key = match plugin.generate(&new.key_type) {
        Ok(key) => key,
        Err(e) => {
            return abort(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not create {} key: {e}", new.key_type),
            );
        }
    };
    key.realm = new.realm;

    if let Err(e) = state.management.add_key(&email, &key).await {
        return abort(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("The new key could not be stored: {e}"),
        );
    }
    key.owner = email;

    let quota = resolve_quota(&state, &key.quota);
    ok_json(&KeyWithQuota { key, quota, avg: 0.0 })
}

#[derive(Deserialize)]
struct DeleteKey {
    #[serde(default)]
    key_id: String,
}

/// `POST /keys/delete`: revokes one of the session user's keys.
pub async fn delete_key(
    State(state): State<PortalState>,
    Extension(SessionEmail(email)): Extension<SessionEmail>,
    body: Bytes,
) -> Response {
    const USAGE: &str = "Specify a key_id to delete.";
    let delete: DeleteKey = match parse(&body, USAGE) {
        Ok(delete) => delete,
        Err(res) => return res,
    };
    if delete.key_id.is_empty() {
        return abort(StatusCode::BAD_REQUEST, USAGE);
    }

    if let Err(e) = state.management.delete_key(&email, &delete.key_id).await {
        return abort(StatusCode::INTERNAL_SERVER_ERROR, format!("Could not delete key: {e}"));
    }

    ok_json(&json!({"deleted": delete.key_id}))
}
