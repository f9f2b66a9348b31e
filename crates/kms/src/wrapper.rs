//! The KEK wrapping trait.
//!
//! A [`KekWrapper`] encrypts and decrypts a data encryption key under a
//! key encryption key it controls. The keyring treats every provider,
//! the built-in AEAD cipher and the remote KMS services alike, through
//! this one interface.

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::error::Result;

/// Wraps and unwraps key material under a key encryption key.
///
/// All operations are async because most providers require a network
/// round-trip. The built-in AEAD provider completes synchronously but
/// shares the interface.
///
/// # Plaintext handling
///
/// `unwrap` returns the recovered key material in a [`Zeroizing`] buffer
/// so it is scrubbed from memory when dropped. Implementations must not
/// retain copies of plaintext passed to `wrap`.
#[async_trait]
pub trait KekWrapper: Send + Sync {
    /// The provider type string this wrapper answers to.
    fn provider(&self) -> &str;

    /// Encrypts `plaintext` under the provider's KEK, returning the
    /// opaque blob to be stored in the keystore record.
    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts a blob previously produced by [`wrap`](Self::wrap).
    async fn unwrap(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>>;
}
