//! In-memory keysets and the keyset cache.
//!
//! A [`Keyset`] is the ready-to-use form of a root key: the AEAD cipher
//! for variable encryption plus the signing keys for workload identity
//! tokens. The [`KeysetCache`] maps key IDs to keysets behind a single
//! readers/writer lock; keyset construction happens outside the lock so
//! critical sections stay short.

use std::{collections::HashMap, sync::Arc};

use aes_gcm::{Aes256Gcm, aead::KeyInit};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, EncodingKey};
use parking_lot::RwLock;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPublicKey};

use crate::{
    error::{KeyringError, Result},
    types::{
        DEK_LEN, KeyId, KeyringPublicKey, PublicKeyAlgorithm, PublicKeyUse, RootKey,
    },
};

/// AES-256-GCM nonce length in bytes. Ciphertexts are framed as
/// `nonce || sealed`, so this is also the framing offset.
pub(crate) const NONCE_LEN: usize = 12;

/// AES-256-GCM authentication tag length in bytes.
pub(crate) const TAG_LEN: usize = 16;

/// A root key with its derived cipher and signing material.
///
/// The Ed25519 signing key is derived deterministically from the first
/// 32 bytes of the DEK, so every node that holds the material signs and
/// verifies identically. When the root key carries an RSA key, RS256 is
/// preferred for signing as it is more widely compatible; the Ed25519
/// key still exists for tokens minted before the RSA key did.
pub(crate) struct Keyset {
    pub root_key: RootKey,
    pub cipher: Aes256Gcm,
    pub eddsa: SigningKey,
    pub encoding_key: EncodingKey,
    pub algorithm: Algorithm,
    pub rsa_public_der: Option<Vec<u8>>,
}

impl Keyset {
    /// Builds a keyset from root key material.
    ///
    /// # Errors
    ///
    /// - [`KeyringError::MissingMetadata`] for empty key material or a
    ///   nil key ID.
    /// - [`KeyringError::InvalidAlgorithm`] when the key length does not
    ///   match the declared algorithm.
    /// - [`KeyringError::BadRsaKey`] when an RSA key is present but does
    ///   not parse as PKCS#1 DER.
    pub fn new(root_key: RootKey) -> Result<Self> {
        if root_key.key.is_empty() {
            return Err(KeyringError::MissingMetadata);
        }
        root_key.meta.validate()?;

        if root_key.key.len() != DEK_LEN {
            return Err(KeyringError::InvalidAlgorithm(format!(
                "{} requires a {DEK_LEN}-byte key, got {}",
                root_key.meta.algorithm,
                root_key.key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(&root_key.key)
            .map_err(|e| KeyringError::InvalidAlgorithm(format!("could not create cipher: {e}")))?;

        let seed: [u8; 32] = root_key.key[..DEK_LEN]
            .try_into()
            .map_err(|_| KeyringError::MissingMetadata)?;
        let eddsa = SigningKey::from_bytes(&seed);

        let (encoding_key, algorithm, rsa_public_der) = match &root_key.rsa_key {
            Some(der) if !der.is_empty() => {
                let private = rsa::RsaPrivateKey::from_pkcs1_der(der)
                    .map_err(|e| KeyringError::BadRsaKey(e.to_string()))?;
                let public_der = private
                    .to_public_key()
                    .to_pkcs1_der()
                    .map_err(|e| KeyringError::BadRsaKey(e.to_string()))?
                    .into_vec();
                (EncodingKey::from_rsa_der(der), Algorithm::RS256, Some(public_der))
            }
            _ => (
                EncodingKey::from_ed_der(&ed25519_pkcs8_der(&seed)),
                Algorithm::EdDSA,
                None,
            ),
        };

        Ok(Self { root_key, cipher, eddsa, encoding_key, algorithm, rsa_public_der })
    }

    /// The ID of the underlying root key.
    pub fn key_id(&self) -> KeyId {
        self.root_key.meta.key_id
    }

    /// The public half of this keyset's signing material.
    pub fn public_key(&self) -> KeyringPublicKey {
        let (algorithm, public_key) = match &self.rsa_public_der {
            Some(der) => (PublicKeyAlgorithm::Rs256, der.clone()),
            None => (PublicKeyAlgorithm::EdDsa, self.eddsa.verifying_key().to_bytes().to_vec()),
        };
        KeyringPublicKey {
            key_id: self.key_id(),
            algorithm,
            public_key,
            create_time: self.root_key.meta.create_time,
            key_use: PublicKeyUse::Signature,
        }
    }
}

/// Wraps an Ed25519 seed in a PKCS#8 v1 DER document.
///
/// The layout is fixed for Ed25519 (RFC 8410): a 16-byte prefix carrying
/// the version and algorithm OID, then the 32-byte seed as a nested
/// OCTET STRING.
fn ed25519_pkcs8_der(seed: &[u8; 32]) -> Vec<u8> {
    let mut der = vec![
        0x30, 0x2e, // SEQUENCE, 46 bytes
        0x02, 0x01, 0x00, // INTEGER version 0
        0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
        0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
        0x04, 0x22, // OCTET STRING, 34 bytes
        0x04, 0x20, // OCTET STRING, 32 bytes (the seed)
    ];
    der.extend_from_slice(seed);
    der
}

/// Key-ID-indexed cache of ready-to-use keysets.
///
/// Guarded by a single readers/writer lock. Encrypt, decrypt, verify and
/// public-key lookups take the read side; add and remove take the write
/// side briefly, after any parsing has already happened.
#[derive(Default)]
pub(crate) struct KeysetCache {
    keysets: RwLock<HashMap<KeyId, Arc<Keyset>>>,
}

impl KeysetCache {
    /// Installs or replaces the keyset for the root key's ID.
    ///
    /// Parsing and cipher construction happen before the write lock is
    /// taken.
    pub fn add(&self, root_key: RootKey) -> Result<Arc<Keyset>> {
        let keyset = Arc::new(Keyset::new(root_key)?);
        let mut keysets = self.keysets.write();
        keysets.insert(keyset.key_id(), Arc::clone(&keyset));
        drop(keysets);
        Ok(keyset)
    }

    /// Looks up a keyset by key ID.
    pub fn get(&self, key_id: &KeyId) -> Result<Arc<Keyset>> {
        self.keysets
            .read()
            .get(key_id)
            .cloned()
            .ok_or_else(|| KeyringError::NoSuchKey { key_id: key_id.to_string() })
    }

    /// Removes a keyset. Absent IDs are not an error.
    pub fn remove(&self, key_id: &KeyId) {
        let mut keysets = self.keysets.write();
        keysets.remove(key_id);
    }

    /// Returns `true` when the cache holds non-empty material for the ID.
    pub fn contains_material(&self, key_id: &KeyId) -> bool {
        self.keysets.read().get(key_id).is_some_and(|ks| !ks.root_key.key.is_empty())
    }

    /// The IDs currently present in the cache.
    pub fn ids(&self) -> Vec<KeyId> {
        self.keysets.read().keys().copied().collect()
    }
}
