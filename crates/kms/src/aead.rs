//! Built-in AEAD wrapping provider.
//!
//! Wraps the DEK with AES-256-GCM under a caller-supplied 32-byte KEK.
//! This is the provider used when no external KMS is configured: the KEK
//! itself is stored in the keystore record beside the wrapped DEK. The
//! keystore directory is the trust boundary (owner-only permissions);
//! the wrapper exists so local and external providers share one on-disk
//! format, not as a second layer of secrecy.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use async_trait::async_trait;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::{
    config::PROVIDER_AEAD,
    error::{KmsError, Result},
    wrapper::KekWrapper,
};

/// KEK length in bytes.
pub const KEK_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// The built-in AES-256-GCM KEK wrapper.
///
/// Blobs are framed as `nonce || ciphertext-with-tag`. The ID of the key
/// being wrapped is bound into the AEAD as additional authenticated
/// data, so a record whose ciphertext is copied under a different key ID
/// fails to unwrap.
pub struct AeadKekWrapper {
    cipher: Aes256Gcm,
    aad: String,
}

impl AeadKekWrapper {
    /// Creates a wrapper from a 32-byte KEK, binding `key_id` as AAD.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Crypto`] if the KEK is not exactly 32 bytes.
    pub fn new(kek: &[u8], key_id: &str) -> Result<Self> {
        if kek.len() != KEK_LEN {
            return Err(KmsError::Crypto(format!(
                "invalid KEK length: expected {KEK_LEN}, got {}",
                kek.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(kek)
            .map_err(|e| KmsError::Crypto(format!("cipher init: {e}")))?;
        Ok(Self { cipher, aad: key_id.to_string() })
    }

    /// Generates a fresh random 32-byte KEK.
    #[must_use]
    pub fn generate_kek() -> Zeroizing<Vec<u8>> {
        let mut kek = Zeroizing::new(vec![0u8; KEK_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut kek);
        kek
    }
}

impl std::fmt::Debug for AeadKekWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadKekWrapper").field("aad", &self.aad).field("kek", &"[REDACTED]").finish()
    }
}

#[async_trait]
impl KekWrapper for AeadKekWrapper {
    fn provider(&self) -> &str {
        PROVIDER_AEAD
    }

    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: self.aad.as_bytes() })
            .map_err(|_| KmsError::Crypto("seal failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    async fn unwrap(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(KmsError::Crypto(format!(
                "wrapped blob too short: {} bytes",
                ciphertext.len()
            )));
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, Payload { msg: sealed, aad: self.aad.as_bytes() })
            .map_err(|_| KmsError::Crypto("authentication failed".into()))?;
        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wrap_unwrap_round_trip() {
        let kek = AeadKekWrapper::generate_kek();
        let wrapper = AeadKekWrapper::new(&kek, "key-1").unwrap();

        let dek = b"0123456789abcdef0123456789abcdef";
        let blob = wrapper.wrap(dek).await.unwrap();
        assert_eq!(blob.len(), NONCE_LEN + dek.len() + TAG_LEN);

        let recovered = wrapper.unwrap(&blob).await.unwrap();
        assert_eq!(&recovered[..], dek);
    }

    #[tokio::test]
    async fn tampered_blob_fails() {
        let kek = AeadKekWrapper::generate_kek();
        let wrapper = AeadKekWrapper::new(&kek, "key-1").unwrap();

        let mut blob = wrapper.wrap(b"secret").await.unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;

        assert!(matches!(wrapper.unwrap(&blob).await, Err(KmsError::Crypto(_))));
    }

    #[tokio::test]
    async fn key_id_is_bound_as_aad() {
        let kek = AeadKekWrapper::generate_kek();
        let wrapper = AeadKekWrapper::new(&kek, "key-1").unwrap();
        let blob = wrapper.wrap(b"secret").await.unwrap();

        // Same KEK, different key ID: the record must not unwrap.
        let other = AeadKekWrapper::new(&kek, "key-2").unwrap();
        assert!(other.unwrap(&blob).await.is_err());
    }

    #[tokio::test]
    async fn wrong_kek_fails() {
        let wrapper = AeadKekWrapper::new(&AeadKekWrapper::generate_kek(), "key-1").unwrap();
        let blob = wrapper.wrap(b"secret").await.unwrap();

        let other = AeadKekWrapper::new(&AeadKekWrapper::generate_kek(), "key-1").unwrap();
        assert!(other.unwrap(&blob).await.is_err());
    }

    #[test]
    fn rejects_short_kek() {
        assert!(matches!(AeadKekWrapper::new(&[0u8; 16], "key-1"), Err(KmsError::Crypto(_))));
    }

    #[tokio::test]
    async fn rejects_truncated_blob() {
        let wrapper = AeadKekWrapper::new(&AeadKekWrapper::generate_kek(), "key-1").unwrap();
        assert!(wrapper.unwrap(&[0u8; 8]).await.is_err());
    }
}
