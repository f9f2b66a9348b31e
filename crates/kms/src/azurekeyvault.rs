//! Azure Key Vault wrapping provider.
//!
//! Uses the Key Vault `wrapkey` / `unwrapkey` operations with RSA-OAEP-256
//! and a bearer token from the provider config. Key Vault exchanges
//! base64url payloads; the keystore record stores the decoded bytes.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use zeroize::Zeroizing;

use crate::{
    config::{PROVIDER_AZURE_KEY_VAULT, require},
    error::{KmsError, Result},
    wrapper::KekWrapper,
};

const API_VERSION: &str = "7.4";
const WRAP_ALGORITHM: &str = "RSA-OAEP-256";

/// KEK wrapper backed by Azure Key Vault.
pub struct AzureKeyVaultKekWrapper {
    client: Client,
    endpoint: String,
    key_name: String,
    key_version: String,
    access_token: String,
}

impl std::fmt::Debug for AzureKeyVaultKekWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureKeyVaultKekWrapper")
            .field("endpoint", &self.endpoint)
            .field("key_name", &self.key_name)
            .field("key_version", &self.key_version)
            .field("access_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct KeyOperationResponse {
    value: String,
}

impl AzureKeyVaultKekWrapper {
    /// Builds a wrapper from a provider config map.
    ///
    /// Required fields: `vault_name`, `key_name`, `access_token`.
    /// Optional: `key_version` (defaults to the current version) and
    /// `endpoint` (defaults to `https://{vault_name}.vault.azure.net`).
    pub fn from_config(config: &HashMap<String, String>) -> Result<Self> {
        let vault_name = require(config, PROVIDER_AZURE_KEY_VAULT, "vault_name")?;

        Ok(Self {
            client: Client::new(),
            endpoint: config
                .get("endpoint")
                .filter(|e| !e.is_empty())
                .map(|e| e.trim_end_matches('/').to_string())
                .unwrap_or_else(|| format!("https://{vault_name}.vault.azure.net")),
            key_name: require(config, PROVIDER_AZURE_KEY_VAULT, "key_name")?.to_string(),
            key_version: config.get("key_version").cloned().unwrap_or_default(),
            access_token: require(config, PROVIDER_AZURE_KEY_VAULT, "access_token")?.to_string(),
        })
    }

    async fn call(&self, operation: &str, value: &[u8]) -> Result<Vec<u8>> {
        // Without a pinned version, Key Vault resolves the current one.
        let url = if self.key_version.is_empty() {
            format!("{}/keys/{}/{operation}?api-version={API_VERSION}", self.endpoint, self.key_name)
        } else {
            format!(
                "{}/keys/{}/{}/{operation}?api-version={API_VERSION}",
                self.endpoint, self.key_name, self.key_version
            )
        };

        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&json!({ "alg": WRAP_ALGORITHM, "value": URL_SAFE_NO_PAD.encode(value) }))
            .send()
            .await
            .map_err(|e| KmsError::remote_transport(PROVIDER_AZURE_KEY_VAULT, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(KmsError::remote_status(PROVIDER_AZURE_KEY_VAULT, status, &body));
        }

        let parsed: KeyOperationResponse = resp
            .json()
            .await
            .map_err(|e| KmsError::remote_transport(PROVIDER_AZURE_KEY_VAULT, e))?;
        URL_SAFE_NO_PAD.decode(parsed.value).map_err(|e| KmsError::Remote {
            provider: PROVIDER_AZURE_KEY_VAULT,
            message: format!("response base64url decode: {e}"),
            source: None,
        })
    }
}

#[async_trait]
impl KekWrapper for AzureKeyVaultKekWrapper {
    fn provider(&self) -> &str {
        PROVIDER_AZURE_KEY_VAULT
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.call("wrapkey", plaintext).await
    }

    async fn unwrap(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.call("unwrapkey", ciphertext).await.map(Zeroizing::new)
    }
}
