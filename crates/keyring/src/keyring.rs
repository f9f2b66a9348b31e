//! The keyring service.
//!
//! [`Keyring`] is the public face of the subsystem: encrypt and decrypt
//! cluster variables, sign and verify workload identity tokens, publish
//! public keys, and install or remove key material. It composes the
//! keyset cache, the on-disk keystore, and the replicated key metadata
//! store.

use std::{path::PathBuf, sync::Arc, time::Duration};

use aes_gcm::{Nonce, aead::{Aead, Payload}};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, errors::ErrorKind};
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rafter_kms::{KekProviderConfig, ProviderConfigs};

use crate::{
    claims::IdentityClaims,
    error::{KeyringError, Result},
    keyset::{Keyset, KeysetCache, NONCE_LEN, TAG_LEN},
    keystore::Keystore,
    state::KeyMetaStore,
    types::{KeyId, KeyringPublicKey, PublicKeyAlgorithm, RootKey},
};

/// How long a signing request will wait for the active key's material to
/// arrive after a leadership transition.
const SIGN_RETRY_BUDGET: Duration = Duration::from_secs(5);

/// Poll interval while waiting for the active keyset.
const SIGN_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for opening a [`Keyring`].
#[derive(Debug, Clone)]
pub struct KeyringConfig {
    keystore_path: PathBuf,
    issuer: Option<String>,
    providers: Vec<KekProviderConfig>,
    shutdown: CancellationToken,
}

#[bon::bon]
impl KeyringConfig {
    /// Creates a keyring configuration.
    #[builder]
    pub fn new(
        /// Directory holding the per-node wrapped key files.
        #[builder(into)]
        keystore_path: PathBuf,
        /// Issuer claim stamped onto signed identities, when configured.
        #[builder(into)]
        issuer: Option<String>,
        /// KEK wrapping provider configurations.
        #[builder(default)]
        providers: Vec<KekProviderConfig>,
        /// Cancellation handle tied to process shutdown.
        #[builder(default)]
        shutdown: CancellationToken,
    ) -> Self {
        Self { keystore_path, issuer, providers, shutdown }
    }
}

/// The keyring for encrypting variables and signing workload identities.
///
/// Shared between RPC handlers and the replicator; all methods take
/// `&self`. The in-memory keyset map is guarded by a single
/// readers/writer lock, and no disk or network I/O ever happens while it
/// is held.
pub struct Keyring {
    state: Arc<dyn KeyMetaStore>,
    keystore: Keystore,
    cache: KeysetCache,
    issuer: Option<String>,
    shutdown: CancellationToken,
}

impl Keyring {
    /// Opens the keystore directory and rehydrates the in-memory keyring
    /// from it.
    ///
    /// Any key file that exists but cannot be restored fails the open:
    /// starting with a silently smaller keyring would present as data
    /// loss later, when a variable no longer decrypts.
    pub async fn open(config: KeyringConfig, state: Arc<dyn KeyMetaStore>) -> Result<Arc<Self>> {
        let providers = ProviderConfigs::new(config.providers);
        let keystore = Keystore::open(config.keystore_path, providers).await?;

        let keyring = Self {
            state,
            keystore,
            cache: KeysetCache::default(),
            issuer: config.issuer,
            shutdown: config.shutdown,
        };

        let keys = keyring.keystore.load().await?;
        let count = keys.len();
        for key in keys {
            keyring.cache.add(key)?;
        }
        debug!(keys = count, path = %keyring.keystore.dir().display(), "loaded keystore");

        Ok(Arc::new(keyring))
    }

    /// Encrypts `cleartext` with the active key.
    ///
    /// Returns `nonce || sealed` (the nonce is prefixed so ciphertext
    /// and nonce always travel together) and the ID of the key used.
    /// The key ID is bound into the AEAD as additional authenticated
    /// data, so the returned pair is tamper-evident as a unit.
    ///
    /// # Errors
    ///
    /// [`KeyringError::NotInitialized`] (retryable) when no key is
    /// active yet, or when the active key's material has not reached
    /// this node.
    pub async fn encrypt(&self, cleartext: &[u8]) -> Result<(Vec<u8>, KeyId)> {
        let keyset = self.active_keyset().await?;
        let key_id = keyset.key_id();

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let aad = key_id.to_string();
        let sealed = keyset
            .cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: cleartext, aad: aad.as_bytes() })
            .map_err(|_| KeyringError::Internal("seal failed".into()))?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce);
        ciphertext.extend_from_slice(&sealed);
        Ok((ciphertext, key_id))
    }

    /// Decrypts a `nonce || sealed` buffer produced by
    /// [`encrypt`](Self::encrypt) under the named key.
    ///
    /// Decrypt is by explicit ID, not by state: ciphertexts produced
    /// before a rotation keep decrypting after it. Never retried
    /// internally: the AAD binds the key ID, so retrying with a
    /// different one cannot succeed.
    pub fn decrypt(&self, ciphertext: &[u8], key_id: &KeyId) -> Result<Vec<u8>> {
        let keyset = self.cache.get(key_id)?;

        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(KeyringError::CiphertextInvalid(format!(
                "ciphertext of {} bytes cannot carry a nonce and tag",
                ciphertext.len()
            )));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);

        let aad = key_id.to_string();
        keyset
            .cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad: aad.as_bytes() })
            .map_err(|_| KeyringError::CiphertextInvalid("authentication failed".into()))
    }

    /// Signs workload identity claims, returning the encoded token and
    /// the signing key ID.
    ///
    /// If a key is rotated immediately after a leader election, requests
    /// in flight may reach this node before the new key's material has
    /// replicated to it. Signing therefore waits up to five seconds for
    /// the active keyset before giving up with
    /// [`KeyringError::NotInitialized`]. The wait is interrupted by
    /// process shutdown.
    ///
    /// The issuer claim is filled in from configuration when one is set.
    /// RS256 is used when the keyset carries an RSA key, EdDSA otherwise.
    pub async fn sign_claims(&self, mut claims: IdentityClaims) -> Result<(String, KeyId)> {
        let keyset = match self.active_keyset().await {
            Ok(keyset) => keyset,
            Err(KeyringError::NotInitialized | KeyringError::NoSuchKey { .. }) => {
                self.wait_for_active_keyset().await?
            }
            Err(err) => return Err(err),
        };

        if let Some(issuer) = &self.issuer {
            claims.iss = Some(issuer.clone());
        }

        let key_id = keyset.key_id();
        let mut header = jsonwebtoken::Header::new(keyset.algorithm);
        header.kid = Some(key_id.to_string());

        let token = jsonwebtoken::encode(&header, &claims, &keyset.encoding_key)
            .map_err(|e| KeyringError::Internal(format!("token encode: {e}")))?;
        Ok((token, key_id))
    }

    /// Waits for the active keyset with a deadline, polling the
    /// metadata store and cache.
    async fn wait_for_active_keyset(&self) -> Result<Arc<Keyset>> {
        let deadline = tokio::time::Instant::now() + SIGN_RETRY_BUDGET;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(KeyringError::NotInitialized);
            }
            tokio::select! {
                () = self.shutdown.cancelled() => return Err(KeyringError::Cancelled),
                () = tokio::time::sleep(SIGN_RETRY_INTERVAL) => {}
            }
            match self.active_keyset().await {
                Ok(keyset) => return Ok(keyset),
                Err(KeyringError::NotInitialized | KeyringError::NoSuchKey { .. }) => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Verifies an encoded token and returns its claims.
    ///
    /// The key is selected by the `kid` header; the algorithm declared
    /// in the header must match the one recorded for that public key.
    /// Standard claim structure is validated (`exp` and `nbf`, each only
    /// when present) but no audience or issuer comparison happens here —
    /// tokens from older servers carry neither, and callers applying a
    /// stricter policy do so on the returned claims.
    pub fn verify_claims(&self, token: &str) -> Result<IdentityClaims> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| KeyringError::BadToken(format!("failed to parse signed token: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| KeyringError::BadToken("token header missing key ID".into()))?;

        let key_id =
            KeyId::parse(&kid).ok_or(KeyringError::NoSuchKey { key_id: kid.clone() })?;
        let public_key = self.get_public_key(&key_id)?;

        let algorithm = match public_key.algorithm {
            PublicKeyAlgorithm::Rs256 => Algorithm::RS256,
            PublicKeyAlgorithm::EdDsa => Algorithm::EdDSA,
        };
        if header.alg != algorithm {
            return Err(KeyringError::BadToken(format!(
                "token algorithm {:?} does not match key algorithm {}",
                header.alg, public_key.algorithm
            )));
        }

        let decoding_key = match public_key.algorithm {
            PublicKeyAlgorithm::Rs256 => DecodingKey::from_rsa_der(&public_key.public_key),
            PublicKeyAlgorithm::EdDsa => DecodingKey::from_ed_der(&public_key.public_key),
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.required_spec_claims = Default::default();

        let data = jsonwebtoken::decode::<IdentityClaims>(token, &decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => KeyringError::BadSignature,
                ErrorKind::ExpiredSignature => KeyringError::BadToken("token expired".into()),
                ErrorKind::ImmatureSignature => {
                    KeyringError::BadToken("token not yet valid".into())
                }
                _ => KeyringError::BadToken(format!("invalid token: {e}")),
            })?;
        Ok(data.claims)
    }

    /// Returns the public signing key for a key ID.
    pub fn get_public_key(&self, key_id: &KeyId) -> Result<KeyringPublicKey> {
        Ok(self.cache.get(key_id)?.public_key())
    }

    /// Installs key material into the in-memory keyring, then persists
    /// it to the keystore.
    ///
    /// A failed save surfaces to the caller but does not roll back the
    /// cache install: the key is usable on this node for the life of the
    /// process and will be re-replicated from a peer on the next boot.
    pub async fn add_key(&self, root_key: RootKey) -> Result<()> {
        self.cache.add(root_key.clone())?;
        self.keystore.save(&root_key).await
    }

    /// Removes a key from the in-memory keyring only. The on-disk sweep
    /// happens separately when the log tombstones the metadata.
    /// Idempotent.
    pub fn remove_key(&self, key_id: &KeyId) {
        self.cache.remove(key_id);
    }

    /// Removes a key from the keyring and deletes its keystore files.
    /// Used by the replicator when the log has tombstoned the metadata.
    pub async fn sweep_key(&self, key_id: &KeyId) -> Result<()> {
        self.cache.remove(key_id);
        self.keystore.delete(key_id).await
    }

    /// Returns the raw key material for serving a peer's replication
    /// request.
    pub fn key_material(&self, key_id: &KeyId) -> Result<RootKey> {
        Ok(self.cache.get(key_id)?.root_key.clone())
    }

    /// Returns `true` when this node holds non-empty material for the
    /// ID. Key material is immutable once created, so a present key
    /// never needs re-replication.
    #[must_use]
    pub fn has_key_material(&self, key_id: &KeyId) -> bool {
        self.cache.contains_material(key_id)
    }

    /// The key IDs currently held in the in-memory keyring.
    #[must_use]
    pub fn cached_key_ids(&self) -> Vec<KeyId> {
        self.cache.ids()
    }

    /// Resolves the keyset for the key marked active in the metadata
    /// store, so that the choice is always consistent with the
    /// replicated log.
    async fn active_keyset(&self) -> Result<Arc<Keyset>> {
        let meta = self.state.active_key_meta().await?;
        let Some(meta) = meta else { return Err(KeyringError::NotInitialized) };
        self.cache.get(&meta.key_id)
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("keystore", &self.keystore)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}
