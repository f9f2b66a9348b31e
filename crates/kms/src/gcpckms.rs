//! GCP Cloud KMS wrapping provider.
//!
//! Calls the `cryptoKeys:encrypt` / `cryptoKeys:decrypt` REST operations
//! with a bearer token from the provider config. The blob stored in the
//! keystore record is the raw ciphertext returned by the service.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use zeroize::Zeroizing;

use crate::{
    config::{PROVIDER_GCP_CKMS, require},
    error::{KmsError, Result},
    wrapper::KekWrapper,
};

const DEFAULT_ENDPOINT: &str = "https://cloudkms.googleapis.com";

/// KEK wrapper backed by GCP Cloud KMS.
pub struct GcpCkmsKekWrapper {
    client: Client,
    endpoint: String,
    key_path: String,
    access_token: String,
}

impl std::fmt::Debug for GcpCkmsKekWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpCkmsKekWrapper")
            .field("endpoint", &self.endpoint)
            .field("key_path", &self.key_path)
            .field("access_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct CkmsResponse {
    #[serde(default)]
    ciphertext: Option<String>,
    #[serde(default)]
    plaintext: Option<String>,
}

impl GcpCkmsKekWrapper {
    /// Builds a wrapper from a provider config map.
    ///
    /// Required fields: `project`, `region`, `key_ring`, `crypto_key`,
    /// `access_token`. Optional: `endpoint`.
    pub fn from_config(config: &HashMap<String, String>) -> Result<Self> {
        let project = require(config, PROVIDER_GCP_CKMS, "project")?;
        let region = require(config, PROVIDER_GCP_CKMS, "region")?;
        let key_ring = require(config, PROVIDER_GCP_CKMS, "key_ring")?;
        let crypto_key = require(config, PROVIDER_GCP_CKMS, "crypto_key")?;

        Ok(Self {
            client: Client::new(),
            endpoint: config
                .get("endpoint")
                .filter(|e| !e.is_empty())
                .map(|e| e.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            key_path: format!(
                "projects/{project}/locations/{region}/keyRings/{key_ring}/cryptoKeys/{crypto_key}"
            ),
            access_token: require(config, PROVIDER_GCP_CKMS, "access_token")?.to_string(),
        })
    }

    async fn call(&self, action: &str, body: serde_json::Value) -> Result<CkmsResponse> {
        let url = format!("{}/v1/{}:{action}", self.endpoint, self.key_path);
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| KmsError::remote_transport(PROVIDER_GCP_CKMS, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(KmsError::remote_status(PROVIDER_GCP_CKMS, status, &body));
        }
        resp.json().await.map_err(|e| KmsError::remote_transport(PROVIDER_GCP_CKMS, e))
    }
}

#[async_trait]
impl KekWrapper for GcpCkmsKekWrapper {
    fn provider(&self) -> &str {
        PROVIDER_GCP_CKMS
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let resp =
            self.call("encrypt", json!({ "plaintext": STANDARD.encode(plaintext) })).await?;
        let ciphertext = resp.ciphertext.ok_or_else(|| KmsError::Remote {
            provider: PROVIDER_GCP_CKMS,
            message: "encrypt response missing ciphertext".into(),
            source: None,
        })?;
        STANDARD.decode(ciphertext).map_err(|e| KmsError::Remote {
            provider: PROVIDER_GCP_CKMS,
            message: format!("ciphertext base64 decode: {e}"),
            source: None,
        })
    }

    async fn unwrap(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let resp =
            self.call("decrypt", json!({ "ciphertext": STANDARD.encode(ciphertext) })).await?;
        let plaintext = resp.plaintext.ok_or_else(|| KmsError::Remote {
            provider: PROVIDER_GCP_CKMS,
            message: "decrypt response missing plaintext".into(),
            source: None,
        })?;
        let decoded = STANDARD.decode(plaintext).map_err(|e| KmsError::Remote {
            provider: PROVIDER_GCP_CKMS,
            message: format!("plaintext base64 decode: {e}"),
            source: None,
        })?;
        Ok(Zeroizing::new(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_the_key_path() {
        let config: HashMap<String, String> = [
            ("project", "rafter-prod"),
            ("region", "us-east1"),
            ("key_ring", "orchestrator"),
            ("crypto_key", "keyring-kek"),
            ("access_token", "ya29.token"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let wrapper = GcpCkmsKekWrapper::from_config(&config).unwrap();
        assert_eq!(
            wrapper.key_path,
            "projects/rafter-prod/locations/us-east1/keyRings/orchestrator/cryptoKeys/keyring-kek"
        );
        assert_eq!(wrapper.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn missing_project_is_rejected() {
        let err = GcpCkmsKekWrapper::from_config(&HashMap::new()).unwrap_err();
        assert!(matches!(err, KmsError::MissingConfig { field: "project", .. }));
    }
}
