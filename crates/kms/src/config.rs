//! Provider configuration registry.
//!
//! Each wrapping provider instance is identified by a `(provider, name)`
//! pair and parameterized by an opaque string map. The enclosing server
//! enumerates all configured providers ahead of time; the keyring looks
//! wrappers up here whenever it saves or loads a keystore record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    aead::AeadKekWrapper,
    awskms::AwsKmsKekWrapper,
    azurekeyvault::AzureKeyVaultKekWrapper,
    error::{KmsError, Result},
    gcpckms::GcpCkmsKekWrapper,
    transit::TransitKekWrapper,
    wrapper::KekWrapper,
};

/// The built-in AEAD provider type.
pub const PROVIDER_AEAD: &str = "aead";
/// The AWS KMS provider type.
pub const PROVIDER_AWS_KMS: &str = "awskms";
/// The Azure Key Vault provider type.
pub const PROVIDER_AZURE_KEY_VAULT: &str = "azurekeyvault";
/// The GCP Cloud KMS provider type.
pub const PROVIDER_GCP_CKMS: &str = "gcpckms";
/// The transit secrets-engine provider type.
pub const PROVIDER_TRANSIT: &str = "transit";

/// Configuration for one wrapping provider instance.
///
/// A deployment may configure several instances of the same provider
/// type under distinct names (for example two transit mounts), and a
/// single key may be wrapped under all of them, one keystore file each.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KekProviderConfig {
    /// Provider type string (`"aead"`, `"awskms"`, ...). Empty means the
    /// built-in AEAD provider.
    #[serde(default)]
    pub provider: String,

    /// Instance name, to distinguish multiple configs of one type.
    #[serde(default)]
    pub name: String,

    /// Provider-specific configuration (endpoint, key name, credentials
    /// source). Opaque to the keyring.
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl KekProviderConfig {
    /// Configuration for the built-in AEAD provider.
    #[must_use]
    pub fn aead() -> Self {
        Self { provider: PROVIDER_AEAD.to_string(), ..Self::default() }
    }

    /// The registry key for this instance.
    #[must_use]
    pub fn id(&self) -> String {
        provider_id(&self.provider, &self.name)
    }
}

fn provider_id(provider: &str, name: &str) -> String {
    format!("{provider}/{name}")
}

/// Process-wide registry of provider configurations.
///
/// Constructs [`KekWrapper`] instances on demand. Handles are not
/// pooled; every wrap or unwrap gets a fresh one.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfigs {
    configs: HashMap<String, KekProviderConfig>,
}

impl ProviderConfigs {
    /// Builds a registry from the configured provider instances.
    #[must_use]
    pub fn new(providers: impl IntoIterator<Item = KekProviderConfig>) -> Self {
        let configs = providers.into_iter().map(|p| (p.id(), p)).collect();
        Self { configs }
    }

    /// Returns the configuration for a `(provider, name)` pair, if any.
    #[must_use]
    pub fn get(&self, provider: &str, name: &str) -> Option<&KekProviderConfig> {
        self.configs.get(&provider_id(provider, name))
    }

    /// Constructs the wrapper for a `(provider, name)` pair.
    ///
    /// `key_id` is the ID of the key being wrapped; the built-in AEAD
    /// provider binds it as additional authenticated data. `kek` must be
    /// supplied for the AEAD provider and is ignored by every external
    /// provider, whose key material lives with the remote service.
    ///
    /// # Errors
    ///
    /// - [`KmsError::UnknownProvider`] for an unrecognized type string.
    /// - [`KmsError::MissingKek`] for the AEAD provider without a KEK.
    /// - [`KmsError::MissingConfig`] when a remote provider's
    ///   configuration is absent or incomplete.
    pub fn wrapper(
        &self,
        provider: &str,
        name: &str,
        key_id: &str,
        kek: Option<&Zeroizing<Vec<u8>>>,
    ) -> Result<Box<dyn KekWrapper>> {
        match provider {
            "" | PROVIDER_AEAD => {
                let kek = kek
                    .ok_or_else(|| KmsError::MissingKek { provider: PROVIDER_AEAD.to_string() })?;
                Ok(Box::new(AeadKekWrapper::new(kek, key_id)?))
            }
            PROVIDER_AWS_KMS => {
                Ok(Box::new(AwsKmsKekWrapper::from_config(self.config_map(provider, name))?))
            }
            PROVIDER_AZURE_KEY_VAULT => {
                Ok(Box::new(AzureKeyVaultKekWrapper::from_config(self.config_map(provider, name))?))
            }
            PROVIDER_GCP_CKMS => {
                Ok(Box::new(GcpCkmsKekWrapper::from_config(self.config_map(provider, name))?))
            }
            PROVIDER_TRANSIT => {
                Ok(Box::new(TransitKekWrapper::from_config(self.config_map(provider, name))?))
            }
            other => Err(KmsError::UnknownProvider {
                provider: other.to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn config_map(&self, provider: &str, name: &str) -> &HashMap<String, String> {
        static EMPTY: std::sync::OnceLock<HashMap<String, String>> = std::sync::OnceLock::new();
        self.get(provider, name)
            .map(|c| &c.config)
            .unwrap_or_else(|| EMPTY.get_or_init(HashMap::new))
    }
}

/// Fetches a required, non-empty field from a provider config map.
pub(crate) fn require<'a>(
    config: &'a HashMap<String, String>,
    provider: &'static str,
    field: &'static str,
) -> Result<&'a str> {
    config
        .get(field)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or(KmsError::MissingConfig { provider, field })
}
