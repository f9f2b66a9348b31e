//! AWS KMS wrapping provider.
//!
//! Calls the KMS JSON API (`TrentService.Encrypt` / `TrentService.Decrypt`)
//! with SigV4-signed requests. Credentials come from the provider config;
//! the blob stored in the keystore record is the decoded `CiphertextBlob`.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use zeroize::Zeroizing;

use crate::{
    config::{PROVIDER_AWS_KMS, require},
    error::{KmsError, Result},
    sigv4::{self, SigningParams},
    wrapper::KekWrapper,
};

/// KEK wrapper backed by AWS KMS.
pub struct AwsKmsKekWrapper {
    client: Client,
    endpoint: String,
    host: String,
    region: String,
    kms_key_id: String,
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl std::fmt::Debug for AwsKmsKekWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsKmsKekWrapper")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("kms_key_id", &self.kms_key_id)
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct KmsApiResponse {
    #[serde(rename = "CiphertextBlob", default)]
    ciphertext_blob: Option<String>,
    #[serde(rename = "Plaintext", default)]
    plaintext: Option<String>,
}

impl AwsKmsKekWrapper {
    /// Builds a wrapper from a provider config map.
    ///
    /// Required fields: `region`, `kms_key_id`, `access_key`,
    /// `secret_key`. Optional: `session_token` and `endpoint` (defaults
    /// to `https://kms.{region}.amazonaws.com`).
    pub fn from_config(config: &HashMap<String, String>) -> Result<Self> {
        let region = require(config, PROVIDER_AWS_KMS, "region")?.to_string();
        let endpoint = config
            .get("endpoint")
            .filter(|e| !e.is_empty())
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://kms.{region}.amazonaws.com"));
        let host = endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string();

        Ok(Self {
            client: Client::new(),
            kms_key_id: require(config, PROVIDER_AWS_KMS, "kms_key_id")?.to_string(),
            access_key: require(config, PROVIDER_AWS_KMS, "access_key")?.to_string(),
            secret_key: require(config, PROVIDER_AWS_KMS, "secret_key")?.to_string(),
            session_token: config.get("session_token").filter(|t| !t.is_empty()).cloned(),
            endpoint,
            host,
            region,
        })
    }

    async fn call(&self, target: &str, body: serde_json::Value) -> Result<KmsApiResponse> {
        let payload = serde_json::to_vec(&body).map_err(|e| KmsError::Remote {
            provider: PROVIDER_AWS_KMS,
            message: format!("request encode: {e}"),
            source: None,
        })?;

        let signed = sigv4::sign_request(
            &SigningParams {
                access_key: &self.access_key,
                secret_key: &self.secret_key,
                session_token: self.session_token.as_deref(),
                region: &self.region,
                service: "kms",
            },
            &self.host,
            target,
            &payload,
            Utc::now(),
        );

        let mut req = self
            .client
            .post(format!("{}/", self.endpoint))
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("X-Amz-Target", target)
            .header("X-Amz-Date", &signed.amz_date)
            .header("Authorization", &signed.authorization)
            .body(payload);
        if let Some(token) = &self.session_token {
            req = req.header("X-Amz-Security-Token", token);
        }

        let resp = req.send().await.map_err(|e| KmsError::remote_transport(PROVIDER_AWS_KMS, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(KmsError::remote_status(PROVIDER_AWS_KMS, status, &body));
        }
        resp.json().await.map_err(|e| KmsError::remote_transport(PROVIDER_AWS_KMS, e))
    }
}

#[async_trait]
impl KekWrapper for AwsKmsKekWrapper {
    fn provider(&self) -> &str {
        PROVIDER_AWS_KMS
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let resp = self
            .call(
                "TrentService.Encrypt",
                json!({ "KeyId": self.kms_key_id, "Plaintext": STANDARD.encode(plaintext) }),
            )
            .await?;
        let blob = resp.ciphertext_blob.ok_or_else(|| KmsError::Remote {
            provider: PROVIDER_AWS_KMS,
            message: "Encrypt response missing CiphertextBlob".into(),
            source: None,
        })?;
        STANDARD.decode(blob).map_err(|e| KmsError::Remote {
            provider: PROVIDER_AWS_KMS,
            message: format!("CiphertextBlob base64 decode: {e}"),
            source: None,
        })
    }

    async fn unwrap(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let resp = self
            .call(
                "TrentService.Decrypt",
                json!({ "CiphertextBlob": STANDARD.encode(ciphertext) }),
            )
            .await?;
        let plaintext = resp.plaintext.ok_or_else(|| KmsError::Remote {
            provider: PROVIDER_AWS_KMS,
            message: "Decrypt response missing Plaintext".into(),
            source: None,
        })?;
        let decoded = STANDARD.decode(plaintext).map_err(|e| KmsError::Remote {
            provider: PROVIDER_AWS_KMS,
            message: format!("Plaintext base64 decode: {e}"),
            source: None,
        })?;
        Ok(Zeroizing::new(decoded))
    }
}
