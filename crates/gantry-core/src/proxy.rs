//! The upstream reverse proxy: request rewrite, forwarding and buffered
//! response capture.

use crate::{
    error::GatewayError,
    types::{ApiContext, ApiRequest, ApiResponse, Upstream},
};
use anyhow::anyhow;
use http::{header, HeaderMap, HeaderValue};
use std::time::Duration;
use url::Url;

/// Hop-by-hop headers (RFC 2616 §13). Removed from the forwarded request and
/// again from the upstream response.
pub const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Builds the pooled HTTP client an upstream uses. No overall request
/// deadline: upstream calls inherit none unless an extension sets one.
pub fn upstream_client() -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .tcp_nodelay(true)
        .build()
        .map_err(|e| GatewayError::Internal(anyhow!("upstream HTTP client build failed: {e}")))
}

pub struct UpstreamProxy {
    max_body_bytes: usize,
}

impl UpstreamProxy {
    pub fn new(max_body_bytes: usize) -> Self {
        Self { max_body_bytes }
    }

    /// Forwards the request to the upstream chosen for this context and
    /// returns the buffered response, hop-by-hop headers stripped on both
    /// legs.
    pub async fn forward(
        &self,
        req: &ApiRequest,
        ctx: &ApiContext,
    ) -> Result<ApiResponse, GatewayError> {
        let upstream = ctx
            .upstream
            .as_ref()
            .ok_or_else(|| anyhow!("request to '{}' has no upstream backend set", ctx.path))?;

        let url = rewrite_url(upstream, &ctx.path, req)?;
        let headers = outbound_headers(req);

        let response = upstream
            .client
            .request(req.method.clone(), url.clone())
            .headers(headers)
            .body(req.body.clone())
            .send()
            .await
            .map_err(|e| anyhow!("upstream request to {url} failed: {e}"))?;

        let status = response.status();
        let mut headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| anyhow!("reading upstream response body failed: {e}"))?;
        if body.len() > self.max_body_bytes {
            return Err(GatewayError::Internal(anyhow!(
                "upstream response body of {} bytes exceeds the configured ceiling of {}",
                body.len(),
                self.max_body_bytes
            )));
        }

        for name in HOP_HEADERS {
            headers.remove(name);
        }

        Ok(ApiResponse { status, headers, body })
    }
}

/// Clones the inbound headers, strips hop-by-hop entries and appends the
/// client to the `X-Forwarded-For` chain. The `Host` header is dropped so
/// the client library sets the upstream's.
fn outbound_headers(req: &ApiRequest) -> HeaderMap {
    let mut headers = req.headers.clone();
    for name in HOP_HEADERS {
        headers.remove(name);
    }
    headers.remove(header::HOST);

    let peer = req.remote_addr.ip().to_string();
    let forwarded = match req.header("x-forwarded-for") {
        Some(prior) => format!("{prior}, {peer}"),
        None => peer,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert("x-forwarded-for", value);
    }

    headers
}

/// Swaps scheme and host for the upstream's and replaces the matched API
/// prefix in the path with the upstream's path prefix.
fn rewrite_url(upstream: &Upstream, api_prefix: &str, req: &ApiRequest) -> Result<Url, GatewayError> {
    let path = req.uri.path();
    let rewritten = path.replacen(api_prefix, upstream.base.path(), 1);

    let mut url = upstream.base.clone();
    url.set_path(&rewritten);
    url.set_query(req.uri.query());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Method, Uri};

    fn upstream(base: &str) -> Upstream {
        Upstream { base: Url::parse(base).unwrap(), client: upstream_client().unwrap() }
    }

    fn request(uri: &'static str) -> ApiRequest {
        ApiRequest {
            method: Method::GET,
            uri: Uri::from_static(uri),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: "192.0.2.7:4711".parse().unwrap(),
        }
    }

    #[test]
    fn test_rewrite_replaces_api_prefix() {
        let up = upstream("http://backend:8000/v2/");
        let url = rewrite_url(&up, "/api/", &request("/api/users/42?page=3")).unwrap();
        assert_eq!(url.as_str(), "http://backend:8000/v2/users/42?page=3");
    }

    #[test]
    fn test_rewrite_with_root_prefixes() {
        let up = upstream("http://backend:8000/");
        let url = rewrite_url(&up, "/", &request("/users")).unwrap();
        assert_eq!(url.as_str(), "http://backend:8000/users");
    }

    #[test]
    fn test_hop_by_hop_headers_stripped_from_forwarded_request() {
        let mut req = request("/");
        for name in HOP_HEADERS {
            req.headers.insert(name, "x".parse().unwrap());
        }
        req.headers.insert("x-custom", "kept".parse().unwrap());

        let headers = outbound_headers(&req);
        for name in HOP_HEADERS {
            assert!(!headers.contains_key(name), "{name} should be stripped");
        }
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn test_forwarded_for_starts_chain_with_peer() {
        let headers = outbound_headers(&request("/"));
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "192.0.2.7");
    }

    #[test]
    fn test_forwarded_for_preserves_prior_chain() {
        let mut req = request("/");
        req.headers
            .insert("x-forwarded-for", "10.0.0.1, 172.16.0.9".parse().unwrap());

        let headers = outbound_headers(&req);
        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "10.0.0.1, 172.16.0.9, 192.0.2.7"
        );
    }

    #[test]
    fn test_host_header_not_forwarded() {
        let mut req = request("/");
        req.headers.insert(header::HOST, "public.example.com".parse().unwrap());

        let headers = outbound_headers(&req);
        assert!(!headers.contains_key(header::HOST));
    }

    #[tokio::test]
    async fn test_missing_upstream_is_internal_error() {
        let proxy = UpstreamProxy::new(1024);
        let mut ctx = ApiContext::new();
        ctx.path = "/api/".into();

        let err = proxy.forward(&request("/api/x"), &ctx).await.unwrap_err();
        assert!(!err.is_abort());
        assert_eq!(err.status(), 500);
    }
}
