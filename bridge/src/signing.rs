//! Signed-URL handshake: a compact `header.payload.signature` token
//! appended as the `jwt` query parameter on the WebSocket connect URL.
//!
//! `serde_json::Value::Object` here is backed by a `BTreeMap` (this
//! workspace never enables serde_json's `preserve_order` feature), so key
//! order in the encoded JSON is always the sorted key order — which is what
//! makes the token byte-identical for identical inputs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use uuid::Uuid;

use lib_common::Settings;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("client secret is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("HMAC key of invalid length")]
    InvalidKeyLength,
}

/// Inputs held fixed across calls so the token is reproducible: the
/// current time and a fresh nonce are supplied by the caller rather than
/// read from the clock inside this function.
pub struct SignedUrlInputs {
    pub now_unix: i64,
    pub nonce: Uuid,
}

impl SignedUrlInputs {
    pub fn now() -> Self {
        Self {
            now_unix: chrono::Utc::now().timestamp(),
            nonce: Uuid::new_v4(),
        }
    }
}

/// Builds `host + path + "?" + urlencode({"jwt": token})`, the connect URL
/// for the WebSocket handler.
pub fn build_signed_url(settings: &Settings, inputs: &SignedUrlInputs) -> Result<String, SigningError> {
    let token = build_token(settings, inputs)?;
    let query: String = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("jwt", &token)
        .finish();
    Ok(format!("{}{}?{}", settings.ws_api_host, settings.ws_api_uri, query))
}

/// Builds the three-part `header.payload.signature` token.
pub fn build_token(settings: &Settings, inputs: &SignedUrlInputs) -> Result<String, SigningError> {
    let header = encode_segment(&header_value());
    let payload = encode_segment(&payload_value(settings, inputs));
    let signature = sign(&settings.ws_client_secret_hex, &format!("{header}.{payload}"))?;
    Ok(format!("{header}.{payload}.{signature}"))
}

fn header_value() -> Value {
    json!({ "alg": "HS256", "typ": "JWT" })
}

fn payload_value(settings: &Settings, inputs: &SignedUrlInputs) -> Value {
    json!({
        "iss": settings.ws_client_id,
        "kid": settings.ws_client_id,
        "client_id": settings.ws_client_id,
        "exp": inputs.now_unix + 300,
        "nbf": inputs.now_unix - 60,
        "iat": inputs.now_unix - 60,
        "region": settings.jwt_region,
        "method": "GET",
        "path": settings.ws_api_uri,
        "host": settings.ws_api_host,
        "nonce": inputs.nonce.to_string(),
        "connection_expiry": inputs.now_unix + 300,
    })
}

fn encode_segment(value: &Value) -> String {
    URL_SAFE_NO_PAD.encode(value.to_string().into_bytes())
}

fn sign(client_secret_hex: &str, message: &str) -> Result<String, SigningError> {
    let key_bytes = hex::decode(client_secret_hex)?;
    let mut mac = HmacSha256::new_from_slice(&key_bytes).map_err(|_| SigningError::InvalidKeyLength)?;
    mac.update(message.as_bytes());
    let digest = mac.finalize().into_bytes();
    Ok(URL_SAFE_NO_PAD.encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> Settings {
        Settings {
            mq_broker_id: String::new(),
            mq_port: 0,
            mq_userid: String::new(),
            mq_password: String::new(),
            mq_region: String::new(),
            mq_qname_to_ws: "q_in".into(),
            mq_qname_from_ws: "q_out".into(),
            mq_ttl_from_ws_secs: 300,
            mq_consumer_tag: "mqhandler".into(),
            mq_max_retries: 5,
            ws_api_host: "wss://h".into(),
            ws_api_uri: "/x".into(),
            ws_client_id: "cid".into(),
            ws_client_secret_hex: "00ff".into(),
            ws_ping_interval: 30,
            ws_max_connect_attempts: 5,
            ws_attempt_window_secs: 300,
            jwt_region: "ny".into(),
            cw_region: None,
            cw_log_group: None,
            cw_log_stream: None,
            cw_retention_days: 30,
            cw_metrics_namespace: None,
            cw_metrics_resolution: 60,
        }
    }

    #[test]
    fn token_is_deterministic_for_fixed_inputs() {
        let settings = test_settings();
        let inputs = SignedUrlInputs {
            now_unix: 1_700_000_000,
            nonce: Uuid::parse_str("00000000-0000-0000-0000-000000000000").unwrap(),
        };

        let first = build_token(&settings, &inputs).unwrap();
        let second = build_token(&settings, &inputs).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.matches('.').count(), 2);
    }

    #[test]
    fn token_changes_with_nonce() {
        let settings = test_settings();
        let a = SignedUrlInputs {
            now_unix: 1_700_000_000,
            nonce: Uuid::parse_str("00000000-0000-0000-0000-000000000000").unwrap(),
        };
        let b = SignedUrlInputs {
            now_unix: 1_700_000_000,
            nonce: Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap(),
        };
        assert_ne!(build_token(&settings, &a).unwrap(), build_token(&settings, &b).unwrap());
    }

    #[test]
    fn rejects_non_hex_secret() {
        let mut settings = test_settings();
        settings.ws_client_secret_hex = "not-hex".into();
        let inputs = SignedUrlInputs { now_unix: 0, nonce: Uuid::nil() };
        assert!(build_token(&settings, &inputs).is_err());
    }
}
