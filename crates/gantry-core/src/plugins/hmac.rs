//! HMAC signature authentication.
//!
//! Clients sign the `Date` header with a shared secret and present the
//! result as:
//!
//! ```text
//! Authorization: Signature keyId="K1",algorithm="hmac-sha1",signature="<base64>"
//! ```

use crate::{
    error::GatewayError,
    plugin::{AuthPlugin, Detection, Extension, PluginBuild, PluginConfig},
    types::{ApiContext, ApiRequest, Key, KeyType},
    util::random_token,
};
use anyhow::anyhow;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha1::Sha1;
use std::{collections::HashMap, sync::Arc};
use subtle::ConstantTimeEq;

pub const KEY_TYPE: &str = "HMAC";

const KEY_ID_LEN: usize = 24;
const SECRET_LEN: usize = 40;

/// Auth plugin for the `HMAC` key type.
#[derive(Debug, Default)]
pub struct HmacKeyAuth {
    quota: String,
}

impl PluginBuild for HmacKeyAuth {
    fn default_config(&self) -> PluginConfig {
        let mut config = Map::new();
        config.insert("quota".into(), Value::String("default".into()));
        config
    }

    fn configure(&mut self, config: PluginConfig) -> anyhow::Result<()> {
        self.quota = config
            .get("quota")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("'quota' must be a quota policy name"))?
            .to_string();
        Ok(())
    }

    fn into_extension(self: Box<Self>) -> Extension {
        Extension::new().with_auth(Arc::new(*self))
    }
}

/// Splits `k="v"` pairs out of the Signature header parameters.
fn parse_params(raw: &str) -> HashMap<&str, &str> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.trim(), value.trim().trim_matches('"')))
        })
        .collect()
}

#[async_trait]
impl AuthPlugin for HmacKeyAuth {
    fn available_types(&self) -> Vec<KeyType> {
        vec![KeyType {
            name: KEY_TYPE.into(),
            description: "HMAC-SHA1 request signatures over the Date header".into(),
        }]
    }

    fn generate(&self, key_type: &str) -> Result<Key, GatewayError> {
        if key_type != KEY_TYPE {
            return Err(GatewayError::Internal(anyhow!(
                "hmac plugin cannot generate keys of type '{key_type}'"
            )));
        }
        let mut data = Map::new();
        data.insert("secret".into(), Value::String(random_token(SECRET_LEN)));
        Ok(Key {
            id: random_token(KEY_ID_LEN),
            realm: String::new(),
            quota: self.quota.clone(),
            key_type: KEY_TYPE.into(),
            owner: String::new(),
            data,
        })
    }

    async fn detect(
        &self,
        req: &ApiRequest,
        _ctx: &mut ApiContext,
    ) -> Result<Option<Detection>, GatewayError> {
        let Some(header) = req.header("authorization") else {
            return Ok(None);
        };
        let Some(raw) = header.strip_prefix("Signature ") else {
            return Ok(None);
        };

        let params = parse_params(raw);
        let Some(key_id) = params.get("keyId").filter(|id| !id.is_empty()) else {
            return Ok(None);
        };

        let mut state = Map::new();
        state.insert(
            "algorithm".into(),
            Value::String(params.get("algorithm").unwrap_or(&"").to_string()),
        );
        state.insert(
            "signature".into(),
            Value::String(params.get("signature").unwrap_or(&"").to_string()),
        );

        Ok(Some(Detection {
            key_id: (*key_id).to_string(),
            key_type: KEY_TYPE.into(),
            state,
        }))
    }

    async fn validate(
        &self,
        key: &Key,
        req: &ApiRequest,
        _ctx: &mut ApiContext,
        state: &Map<String, Value>,
    ) -> Result<bool, GatewayError> {
        let algorithm = state.get("algorithm").and_then(Value::as_str).unwrap_or("");
        if !algorithm.eq_ignore_ascii_case("hmac-sha1") {
            return Ok(false);
        }
        let Some(presented) = state.get("signature").and_then(Value::as_str) else {
            return Ok(false);
        };
        let Some(secret) = key.data.get("secret").and_then(Value::as_str) else {
            return Ok(false);
        };

        let date = req.header("date").unwrap_or("");
        let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow!("hmac key setup failed: {e}"))?;
        mac.update(date.as_bytes());
        let expected = BASE64.encode(mac.finalize().into_bytes());

        Ok(expected.as_bytes().ct_eq(presented.as_bytes()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method, Uri};

    fn plugin() -> HmacKeyAuth {
        let mut plugin = HmacKeyAuth::default();
        let defaults = plugin.default_config();
        plugin.configure(defaults).unwrap();
        plugin
    }

    fn sign(secret: &str, date: &str) -> String {
        let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(date.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    fn signed_request(key_id: &str, secret: &str, date: &str) -> ApiRequest {
        let mut headers = HeaderMap::new();
        if !date.is_empty() {
            headers.insert("date", date.parse().unwrap());
        }
        let auth = format!(
            "Signature keyId=\"{key_id}\",algorithm=\"hmac-sha1\",signature=\"{}\"",
            sign(secret, date)
        );
        headers.insert("authorization", auth.parse().unwrap());
        ApiRequest {
            method: Method::GET,
            uri: Uri::from_static("/"),
            headers,
            body: Bytes::new(),
            remote_addr: "127.0.0.1:1234".parse().unwrap(),
        }
    }

    fn hmac_key(id: &str, secret: &str) -> Key {
        let mut data = Map::new();
        data.insert("secret".into(), Value::String(secret.into()));
        Key {
            id: id.into(),
            quota: "default".into(),
            key_type: KEY_TYPE.into(),
            data,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_detect_extracts_key_id_and_state() {
        let plugin = plugin();
        let req = signed_request("K1", "s3cret", "Tue, 04 Jun 2024 10:00:00 GMT");
        let mut ctx = ApiContext::new();

        let detection = plugin.detect(&req, &mut ctx).await.unwrap().unwrap();
        assert_eq!(detection.key_id, "K1");
        assert_eq!(detection.key_type, KEY_TYPE);
        assert_eq!(detection.state["algorithm"], "hmac-sha1");
        assert!(!detection.state["signature"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detect_ignores_other_schemes() {
        let plugin = plugin();
        let mut req = signed_request("K1", "s", "");
        req.headers
            .insert("authorization", "Bearer some.jwt.token".parse().unwrap());
        let mut ctx = ApiContext::new();

        assert!(plugin.detect(&req, &mut ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_detect_without_header_sees_nothing() {
        let plugin = plugin();
        let mut req = signed_request("K1", "s", "");
        req.headers.remove("authorization");
        let mut ctx = ApiContext::new();

        assert!(plugin.detect(&req, &mut ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validate_accepts_correct_signature() {
        let plugin = plugin();
        let req = signed_request("K1", "s3cret", "Tue, 04 Jun 2024 10:00:00 GMT");
        let mut ctx = ApiContext::new();
        let detection = plugin.detect(&req, &mut ctx).await.unwrap().unwrap();

        let valid = plugin
            .validate(&hmac_key("K1", "s3cret"), &req, &mut ctx, &detection.state)
            .await
            .unwrap();
        assert!(valid);
    }

    #[tokio::test]
    async fn test_validate_signs_empty_date_when_header_missing() {
        let plugin = plugin();
        let req = signed_request("K1", "s3cret", "");
        let mut ctx = ApiContext::new();
        let detection = plugin.detect(&req, &mut ctx).await.unwrap().unwrap();

        let valid = plugin
            .validate(&hmac_key("K1", "s3cret"), &req, &mut ctx, &detection.state)
            .await
            .unwrap();
        assert!(valid);
    }

    #[tokio::test]
    async fn test_validate_rejects_tampered_signature() {
        let plugin = plugin();
        let req = signed_request("K1", "s3cret", "Tue, 04 Jun 2024 10:00:00 GMT");
        let mut ctx = ApiContext::new();
        let mut detection = plugin.detect(&req, &mut ctx).await.unwrap().unwrap();

        let original = detection.state["signature"].as_str().unwrap().to_string();
        detection.state.insert("signature".into(), Value::String(format!("dummy{original}")));

        let valid = plugin
            .validate(&hmac_key("K1", "s3cret"), &req, &mut ctx, &detection.state)
            .await
            .unwrap();
        assert!(!valid);
    }

    #[tokio::test]
    async fn test_validate_rejects_wrong_secret() {
        let plugin = plugin();
        let req = signed_request("K1", "s3cret", "x");
        let mut ctx = ApiContext::new();
        let detection = plugin.detect(&req, &mut ctx).await.unwrap().unwrap();

        let valid = plugin
            .validate(&hmac_key("K1", "other"), &req, &mut ctx, &detection.state)
            .await
            .unwrap();
        assert!(!valid);
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_algorithm() {
        let plugin = plugin();
        let req = signed_request("K1", "s3cret", "x");
        let mut ctx = ApiContext::new();
        let mut detection = plugin.detect(&req, &mut ctx).await.unwrap().unwrap();
        detection.state.insert("algorithm".into(), Value::String("hmac-md5".into()));

        let valid = plugin
            .validate(&hmac_key("K1", "s3cret"), &req, &mut ctx, &detection.state)
            .await
            .unwrap();
        assert!(!valid);
    }

    #[test]
    fn test_generate_mints_unique_keys_with_secret() {
        let plugin = plugin();
        let a = plugin.generate(KEY_TYPE).unwrap();
        let b = plugin.generate(KEY_TYPE).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(a.key_type, KEY_TYPE);
        assert_eq!(a.quota, "default");
        assert_eq!(a.data["secret"].as_str().unwrap().len(), SECRET_LEN);
        assert_ne!(a.data["secret"], b.data["secret"]);
    }

    #[test]
    fn test_generate_rejects_foreign_type() {
        let plugin = plugin();
        assert!(plugin.generate("OAuth2").is_err());
    }

    #[test]
    fn test_configured_quota_assigned_to_new_keys() {
        let mut plugin = HmacKeyAuth::default();
        let mut config = Map::new();
        config.insert("quota".into(), Value::String("gold".into()));
        plugin.configure(config).unwrap();

        assert_eq!(plugin.generate(KEY_TYPE).unwrap().quota, "gold");
    }
}
