//! Transit secrets-engine wrapping provider.
//!
//! Speaks the transit encrypt/decrypt HTTP API. The wrapped blob is the
//! engine's ciphertext envelope (`vault:v1:...`) as UTF-8 bytes; the KEK
//! stays inside the secrets engine.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use zeroize::Zeroizing;

use crate::{
    config::{PROVIDER_TRANSIT, require},
    error::{KmsError, Result},
    wrapper::KekWrapper,
};

/// KEK wrapper backed by a transit secrets engine.
pub struct TransitKekWrapper {
    client: Client,
    address: String,
    token: String,
    mount: String,
    key_name: String,
    namespace: Option<String>,
}

impl std::fmt::Debug for TransitKekWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitKekWrapper")
            .field("address", &self.address)
            .field("mount", &self.mount)
            .field("key_name", &self.key_name)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TransitResponse {
    data: TransitData,
}

#[derive(Debug, Deserialize)]
struct TransitData {
    #[serde(default)]
    ciphertext: Option<String>,
    #[serde(default)]
    plaintext: Option<String>,
}

impl TransitKekWrapper {
    /// Builds a wrapper from a provider config map.
    ///
    /// Required fields: `address`, `token`, `key_name`. Optional:
    /// `mount` (default `transit`), `namespace`.
    pub fn from_config(config: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            address: require(config, PROVIDER_TRANSIT, "address")?
                .trim_end_matches('/')
                .to_string(),
            token: require(config, PROVIDER_TRANSIT, "token")?.to_string(),
            key_name: require(config, PROVIDER_TRANSIT, "key_name")?.to_string(),
            mount: config
                .get("mount")
                .filter(|m| !m.is_empty())
                .cloned()
                .unwrap_or_else(|| "transit".to_string()),
            namespace: config.get("namespace").filter(|n| !n.is_empty()).cloned(),
        })
    }

    async fn call(&self, operation: &str, body: serde_json::Value) -> Result<TransitData> {
        let url =
            format!("{}/v1/{}/{}/{}", self.address, self.mount, operation, self.key_name);

        let mut req = self.client.post(url).header("X-Vault-Token", &self.token).json(&body);
        if let Some(ns) = &self.namespace {
            req = req.header("X-Vault-Namespace", ns);
        }

        let resp = req.send().await.map_err(|e| KmsError::remote_transport(PROVIDER_TRANSIT, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(KmsError::remote_status(PROVIDER_TRANSIT, status, &body));
        }

        let parsed: TransitResponse =
            resp.json().await.map_err(|e| KmsError::remote_transport(PROVIDER_TRANSIT, e))?;
        Ok(parsed.data)
    }
}

#[async_trait]
impl KekWrapper for TransitKekWrapper {
    fn provider(&self) -> &str {
        PROVIDER_TRANSIT
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let data =
            self.call("encrypt", json!({ "plaintext": STANDARD.encode(plaintext) })).await?;
        let ciphertext = data.ciphertext.ok_or_else(|| KmsError::Remote {
            provider: PROVIDER_TRANSIT,
            message: "encrypt response missing ciphertext".into(),
            source: None,
        })?;
        Ok(ciphertext.into_bytes())
    }

    async fn unwrap(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let envelope = std::str::from_utf8(ciphertext).map_err(|_| KmsError::Remote {
            provider: PROVIDER_TRANSIT,
            message: "stored ciphertext is not a transit envelope".into(),
            source: None,
        })?;

        let data = self.call("decrypt", json!({ "ciphertext": envelope })).await?;
        let plaintext = data.plaintext.ok_or_else(|| KmsError::Remote {
            provider: PROVIDER_TRANSIT,
            message: "decrypt response missing plaintext".into(),
            source: None,
        })?;
        let decoded = STANDARD.decode(plaintext).map_err(|e| KmsError::Remote {
            provider: PROVIDER_TRANSIT,
            message: format!("plaintext base64 decode: {e}"),
            source: None,
        })?;
        Ok(Zeroizing::new(decoded))
    }
}
