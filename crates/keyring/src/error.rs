//! Keyring error types.
//!
//! This module defines the errors that can occur while encrypting or
//! decrypting variables, signing or verifying workload identity tokens,
//! and loading or saving the on-disk keystore.

use std::path::PathBuf;

use thiserror::Error;

use rafter_kms::KmsError;

/// Errors produced by the keyring and its keystore.
///
/// The variant, not the message, is the behavioral contract: callers
/// retry on [`NotInitialized`](Self::NotInitialized), treat
/// [`NoSuchKey`](Self::NoSuchKey) and the token errors as permanent, and
/// abort startup on any keystore load failure.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]` — new variants may be added in
/// future minor releases without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyringError {
    /// No key metadata record is in the active state yet.
    ///
    /// Retryable: the keyring has not been bootstrapped, or a leader
    /// transition is in flight.
    #[error("keyring has not been initialized yet")]
    NotInitialized,

    /// The key ID is not present in this node's keyring.
    ///
    /// Permanent from this node's point of view; the replicator may
    /// still backfill the material later.
    #[error("no such key {key_id} in keyring")]
    NoSuchKey {
        /// The key ID that was requested.
        key_id: String,
    },

    /// Ciphertext failed AEAD authentication or is too short to carry a
    /// nonce. Also raised when the key ID passed to decrypt is not the
    /// one bound into the ciphertext's authenticated data.
    #[error("ciphertext invalid: {0}")]
    CiphertextInvalid(String),

    /// A token could not be parsed, carries no key ID, or fails claim
    /// validation.
    #[error("bad token: {0}")]
    BadToken(String),

    /// Token signature verification failed; the token must be treated as
    /// forged.
    #[error("bad signature")]
    BadSignature,

    /// Key material does not match any supported encryption algorithm.
    #[error("invalid algorithm: {0}")]
    InvalidAlgorithm(String),

    /// The stored RSA key could not be parsed as PKCS#1 DER.
    #[error("error parsing rsa key: {0}")]
    BadRsaKey(String),

    /// Disk I/O failed while loading or saving the keystore.
    #[error("keystore i/o at {path}: {source}")]
    KeystoreIo {
        /// The file or directory the operation touched.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A keystore record is present but structurally wrong: unparseable,
    /// named for a different key than it embeds, or violating the KEK
    /// shape rules. Fatal at load time — skipping it could mask key loss.
    #[error("invalid keystore record at {path}: {reason}")]
    KeystoreInvalid {
        /// The offending file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// A KEK wrapping provider failed. Includes unknown providers and
    /// remote KMS errors.
    #[error(transparent)]
    Kms(#[from] KmsError),

    /// The input key or its metadata is absent or empty.
    #[error("missing key metadata")]
    MissingMetadata,

    /// The key metadata store failed to answer.
    #[error("key metadata store error: {0}")]
    MetadataStore(String),

    /// The operation was interrupted by process shutdown.
    #[error("keyring operation cancelled")]
    Cancelled,

    /// An internal invariant failed.
    #[error("internal keyring error: {0}")]
    Internal(String),
}

impl KeyringError {
    /// Creates a `KeystoreIo` error for the given path.
    #[must_use]
    pub fn keystore_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::KeystoreIo { path: path.into(), source }
    }

    /// Creates a `KeystoreInvalid` error for the given path.
    #[must_use]
    pub fn keystore_invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::KeystoreInvalid { path: path.into(), reason: reason.into() }
    }

    /// Returns `true` if the caller may retry the operation later.
    ///
    /// Only [`NotInitialized`](Self::NotInitialized) is retryable: the
    /// active key may simply not have replicated to this node yet.
    /// Everything else is a definitive answer for this node.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotInitialized)
    }
}

/// Result type alias for keyring operations.
pub type Result<T> = std::result::Result<T, KeyringError>;
