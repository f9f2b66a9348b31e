//! Key material and metadata types.
//!
//! [`KeyMeta`] is the small, public record replicated through the
//! cluster's log; [`RootKey`] is the secret material that never leaves a
//! node except wrapped ([`WrappedRootKey`]) or over the peer replication
//! RPC. [`KeyringPublicKey`] is the verification half handed to token
//! consumers.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::RngCore;
use rsa::pkcs1::EncodeRsaPrivateKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use rafter_kms::KekProviderConfig;

use crate::error::{KeyringError, Result};

/// Length of the data encryption key in bytes.
pub const DEK_LEN: usize = 32;

/// RSA modulus size for newly generated signing keys.
const RSA_KEY_BITS: usize = 2048;

/// Unique identifier of a root key.
///
/// The `Display` form is the hyphenated UUID; its UTF-8 bytes are what
/// encrypt binds into the ciphertext as additional authenticated data,
/// so the textual form is part of the wire contract.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(Uuid);

impl KeyId {
    /// Generates a fresh random key ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil key ID, used only as a sentinel in validation.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns `true` for the nil sentinel.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Parses a hyphenated UUID string, returning `None` when the input
    /// is not a well-formed UUID.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::try_parse(s).ok().map(Self)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.0.hyphenated())
    }
}

impl FromStr for KeyId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::try_parse(s).map(Self)
    }
}

impl From<Uuid> for KeyId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Symmetric encryption algorithm of a root key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    /// AES-256 in GCM mode. The only algorithm currently supported.
    #[default]
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aes256Gcm => f.write_str("aes256-gcm"),
        }
    }
}

/// Lifecycle state of a key.
///
/// Exactly one key per region is `Active` at any log index. `Inactive`
/// keys still decrypt and verify; `Deprecated` keys are scheduled for
/// removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    /// New encrypt and sign operations use this key.
    Active,
    /// Usable for decrypt and verify only.
    Inactive,
    /// Scheduled for removal.
    Deprecated,
}

/// Replicated key metadata.
///
/// Small and public: it travels through the cluster log, while the
/// material it describes is replicated lazily node-to-node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMeta {
    /// Unique, immutable identifier.
    pub key_id: KeyId,
    /// Symmetric algorithm of the data encryption key.
    pub algorithm: EncryptionAlgorithm,
    /// Wall-clock creation time.
    pub create_time: DateTime<Utc>,
    /// Lifecycle state.
    pub state: KeyState,
    /// Wrapping providers the material is stored under, one keystore
    /// file each.
    #[serde(default)]
    pub kek_providers: Vec<KekProviderConfig>,
    /// Log index at the last mutation of this record.
    pub modify_index: u64,
}

impl KeyMeta {
    /// Creates metadata for a fresh active key.
    #[must_use]
    pub fn new(kek_providers: Vec<KekProviderConfig>) -> Self {
        Self {
            key_id: KeyId::generate(),
            algorithm: EncryptionAlgorithm::default(),
            create_time: Utc::now(),
            state: KeyState::Active,
            kek_providers,
            modify_index: 0,
        }
    }

    /// Checks the structural validity of the record.
    pub fn validate(&self) -> Result<()> {
        if self.key_id.is_nil() {
            return Err(KeyringError::MissingMetadata);
        }
        Ok(())
    }

    /// Returns `true` when this is the region's active key.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == KeyState::Active
    }

    /// The wrapping providers for this key, defaulting to the built-in
    /// AEAD provider when none are configured.
    #[must_use]
    pub fn effective_providers(&self) -> Vec<KekProviderConfig> {
        if self.kek_providers.is_empty() {
            vec![KekProviderConfig::aead()]
        } else {
            self.kek_providers.clone()
        }
    }
}

/// Root key material: the data encryption key and, for newer keys, an
/// RSA signing key.
///
/// Never replicated through the log; held in memory and, wrapped, in the
/// per-node keystore. Secret fields are zeroized on drop and redacted
/// from `Debug` output.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    /// The replicated metadata for this key.
    #[zeroize(skip)]
    pub meta: KeyMeta,

    /// The 32-byte symmetric data encryption key. The first 32 bytes
    /// also seed the derived Ed25519 signing key, so this value is part
    /// of the token compatibility surface.
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,

    /// PKCS#1 DER-encoded RSA private key. Present only on keys created
    /// by newer versions; selects RS256 signing when present.
    #[serde(with = "base64_bytes_opt", default, skip_serializing_if = "Option::is_none")]
    pub rsa_key: Option<Vec<u8>>,
}

impl RootKey {
    /// Generates a root key with a fresh random DEK and no RSA key.
    #[must_use]
    pub fn generate(meta: KeyMeta) -> Self {
        let mut key = vec![0u8; DEK_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { meta, key, rsa_key: None }
    }

    /// Generates a root key with a fresh random DEK and a 2048-bit RSA
    /// signing key.
    ///
    /// # Errors
    ///
    /// Returns [`KeyringError::BadRsaKey`] if RSA key generation or
    /// PKCS#1 encoding fails.
    pub fn generate_with_rsa(meta: KeyMeta) -> Result<Self> {
        let mut root = Self::generate(meta);
        let private = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_KEY_BITS)
            .map_err(|e| KeyringError::BadRsaKey(e.to_string()))?;
        let der = private.to_pkcs1_der().map_err(|e| KeyringError::BadRsaKey(e.to_string()))?;
        root.rsa_key = Some(der.as_bytes().to_vec());
        Ok(root)
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootKey")
            .field("meta", &self.meta)
            .field("key", &"[REDACTED]")
            .field("rsa_key", &self.rsa_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// The on-disk record: a root key wrapped by one provider.
///
/// A single key may appear under several providers, one file each; any
/// one intact record suffices to restore the key.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedRootKey {
    /// The replicated metadata, embedded for self-description.
    pub meta: KeyMeta,

    /// Ciphertext of the DEK under the wrapping provider.
    #[serde(with = "base64_bytes")]
    pub encrypted_data_encryption_key: Vec<u8>,

    /// Ciphertext of the RSA key, empty when the key has none.
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub encrypted_rsa_key: Vec<u8>,

    /// The raw KEK bytes — non-empty if and only if the provider is the
    /// built-in AEAD provider. External providers hold their key
    /// material remotely.
    #[serde(with = "base64_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub key_encryption_key: Vec<u8>,

    /// Wrapping provider type.
    #[serde(default)]
    pub provider: String,

    /// Wrapping provider instance name.
    #[serde(default)]
    pub provider_name: String,
}

impl fmt::Debug for WrappedRootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedRootKey")
            .field("meta", &self.meta)
            .field("provider", &self.provider)
            .field("provider_name", &self.provider_name)
            .field("key_encryption_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Signing algorithm of a published public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicKeyAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    #[serde(rename = "RS256")]
    Rs256,
    /// Ed25519.
    #[serde(rename = "EdDSA")]
    EdDsa,
}

impl PublicKeyAlgorithm {
    /// The algorithm name as it appears in token headers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::EdDsa => "EdDSA",
        }
    }
}

impl fmt::Display for PublicKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intended use of a published public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicKeyUse {
    /// Signature verification.
    #[serde(rename = "sig")]
    Signature,
}

/// The public half of a keyset, as served to token verifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyringPublicKey {
    /// ID of the key that signs with this material.
    pub key_id: KeyId,
    /// Signing algorithm; verifiers must select by this, never by
    /// guessing from the key bytes.
    pub algorithm: PublicKeyAlgorithm,
    /// PKCS#1 DER for RS256, the raw 32-byte public key for EdDSA.
    #[serde(with = "base64_bytes")]
    pub public_key: Vec<u8>,
    /// Creation time of the underlying root key.
    pub create_time: DateTime<Utc>,
    /// Intended use.
    pub key_use: PublicKeyUse,
}

/// Serde adapter encoding byte fields as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional byte fields.
pub(crate) mod base64_bytes_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded.map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom)).transpose()
    }
}
