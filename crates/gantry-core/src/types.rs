//! Core data model shared by every pipeline stage and plugin.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, net::SocketAddr};
use url::Url;

/// Description of a key type that an Auth plugin can issue and validate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyType {
    pub name: String,
    pub description: String,
}

/// A credential presented by API clients.
///
/// A key has a unique public `id`, a user-defined `key_type` (like "HMAC"), an
/// assigned quota policy name, and scheme-specific secrets in `data` (for HMAC,
/// the shared signing secret).
///
/// The key's `realm` is either an app identifier (for native apps) or a web
/// origin checked against the Referer header by plugins that care.
///
/// The `owner` is the email of the owning user. Ownerless keys work fine but
/// never trigger quota overage notifications. The owner is part of the cached
/// serialization so overage mail also works on auth-cache hits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Key {
    pub id: String,
    #[serde(default)]
    pub realm: String,
    #[serde(default)]
    pub quota: String,
    #[serde(rename = "type")]
    pub key_type: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// A developer who can create and use keys through the portal.
///
/// Users are uniquely identified by their lowercase email. Arbitrary profile
/// data goes into `profile`, as long as it serializes to JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub email: String,
    pub name: String,
    pub active: bool,
    #[serde(default)]
    pub profile: Map<String, Value>,
}

/// A named quota policy. `minutes` is the EWMA decay window; a window of zero
/// disables the policy. Zero maximums mean unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Quota {
    pub minutes: u32,
    #[serde(default)]
    pub max_ip: u32,
    #[serde(default)]
    pub max_key: u32,
}

/// One upstream backend: its base address and a pooled HTTP client.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub base: Url,
    pub client: reqwest::Client,
}

/// A buffered inbound request as seen by the pipeline.
///
/// Bodies are read fully up front so every extension can inspect them; the
/// configured body ceiling bounds the memory this costs.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: SocketAddr,
}

impl ApiRequest {
    /// Returns a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The client IP used for quota accounting: the first token of
    /// `X-Forwarded-For` when present, otherwise the transport peer address.
    pub fn client_ip(&self) -> String {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        self.remote_addr.ip().to_string()
    }
}

/// A buffered HTTP response: what comes back from an upstream and, after the
/// post-upstream stage, what goes to the client.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    /// Builds a JSON response with the gateway's canonical content type.
    pub fn json<T: Serialize>(status: StatusCode, body: &T) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json;charset=utf-8"),
        );
        let body = serde_json::to_vec(body).unwrap_or_default();
        Self { status, headers, body: Bytes::from(body) }
    }
}

/// Per-request context threaded through every pipeline stage.
///
/// Exactly one of the following holds at any point past authentication:
/// `keyless == true && key.is_none()`, or `keyless == false && key.is_some()`.
///
/// `log` is the record that logging plugins must persist; by convention it
/// stays JSON-serializable. `data` is a free-form scratchpad for plugins to
/// pass values down the chain.
#[derive(Debug, Clone)]
pub struct ApiContext {
    pub keyless: bool,
    pub key: Option<Key>,
    pub cost: u32,
    pub path: String,
    pub upstream: Option<Upstream>,
    pub do_not_log: bool,
    pub log: Map<String, Value>,
    pub data: HashMap<String, Value>,
}

impl ApiContext {
    pub fn new() -> Self {
        Self {
            keyless: false,
            key: None,
            cost: 1,
            path: String::new(),
            upstream: None,
            do_not_log: false,
            log: Map::new(),
            data: HashMap::new(),
        }
    }
}

impl Default for ApiContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_from(addr: &str) -> ApiRequest {
        ApiRequest {
            method: Method::GET,
            uri: Uri::from_static("/"),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: addr.parse().unwrap(),
        }
    }

    #[test]
    fn test_client_ip_from_peer_address() {
        let req = request_from("192.0.2.7:4711");
        assert_eq!(req.client_ip(), "192.0.2.7");
    }

    #[test]
    fn test_client_ip_prefers_first_forwarded_token() {
        let mut req = request_from("192.0.2.7:4711");
        req.headers
            .insert("x-forwarded-for", "10.0.0.1, 172.16.0.2".parse().unwrap());
        assert_eq!(req.client_ip(), "10.0.0.1");
    }

    #[test]
    fn test_client_ip_ignores_empty_forwarded_header() {
        let mut req = request_from("192.0.2.7:4711");
        req.headers.insert("x-forwarded-for", "".parse().unwrap());
        assert_eq!(req.client_ip(), "192.0.2.7");
    }

    #[test]
    fn test_key_serialization_keeps_owner_and_renames_type() {
        let mut key = Key {
            id: "K1".into(),
            realm: "example.org".into(),
            quota: "default".into(),
            key_type: "HMAC".into(),
            owner: "dev@example.org".into(),
            data: Map::new(),
        };
        key.data.insert("secret".into(), Value::String("s".into()));

        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["type"], "HMAC");
        assert_eq!(json["owner"], "dev@example.org");

        let back: Key = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_context_defaults() {
        let ctx = ApiContext::new();
        assert!(!ctx.keyless);
        assert!(ctx.key.is_none());
        assert_eq!(ctx.cost, 1);
        assert!(!ctx.do_not_log);
        assert!(ctx.log.is_empty());
    }

    #[test]
    fn test_json_response_sets_content_type() {
        let res = ApiResponse::json(StatusCode::FORBIDDEN, &serde_json::json!({"error": "nope"}));
        assert_eq!(res.status, StatusCode::FORBIDDEN);
        assert_eq!(
            res.headers.get(http::header::CONTENT_TYPE).unwrap(),
            "application/json;charset=utf-8"
        );
        assert!(String::from_utf8_lossy(&res.body).contains("nope"));
    }
}
