//! Hierarchical parameter store access.
//!
//! No crate in the surrounding workspace speaks the AWS Systems Manager
//! wire protocol, so this is built as a remote, optionally-encrypted
//! configuration fetch over plain `reqwest` against an HTTPS JSON
//! endpoint. The [`ParamStore`] trait keeps the engine's dependency on
//! that endpoint narrow and swappable, the same way the rest of the
//! bridge treats external collaborators (log sink, metrics sink) as
//! pluggable interfaces.

use std::time::Duration;

use crate::errors::ConfigError;

/// A hierarchical key/value store keyed by slash-separated paths, the shape
/// `/mq2wsbridge/<section>/<key>` expects.
#[allow(async_fn_in_trait)]
pub trait ParamStore {
    /// Fetch a parameter, decrypting it if the backing store supports it.
    async fn get_parameter(&self, path: &str) -> Result<String, ConfigError>;

    /// Write (or overwrite) a parameter as a SecureString.
    async fn put_parameter(&self, path: &str, value: &str) -> Result<(), ConfigError>;
}

/// An SSM-compatible parameter store reached over HTTPS.
///
/// Requests are plain JSON GET/PUT against `{endpoint}/parameters{path}`,
/// not a signed SigV4 call.
pub struct HttpParamStore {
    endpoint: String,
    region: String,
    client: reqwest::Client,
}

impl HttpParamStore {
    pub fn new(endpoint: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            region: region.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
        }
    }

    /// The SSM region this store was constructed against.
    pub fn region(&self) -> &str {
        &self.region
    }
}

impl ParamStore for HttpParamStore {
    async fn get_parameter(&self, path: &str) -> Result<String, ConfigError> {
        let url = format!("{}/parameters{}", self.endpoint, path);
        let resp = self
            .client
            .get(&url)
            .query(&[("withDecryption", "true")])
            .send()
            .await
            .map_err(|e| ConfigError::ParamStore(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ConfigError::ParamStore(format!(
                "GET {path} returned {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ConfigError::ParamStore(e.to_string()))?;
        body.get("value")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ConfigError::ParamStore(format!("malformed response for {path}")))
    }

    async fn put_parameter(&self, path: &str, value: &str) -> Result<(), ConfigError> {
        let url = format!("{}/parameters{}", self.endpoint, path);
        let resp = self
            .client
            .put(&url)
            .json(&serde_json::json!({
                "type": "SecureString",
                "value": value,
                "overwrite": true,
                "keyId": "alias/aws/ssm",
            }))
            .send()
            .await
            .map_err(|e| ConfigError::ParamStore(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ConfigError::ParamStore(format!(
                "PUT {path} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
