//! KMS error types.

use thiserror::Error;

/// Errors produced while wrapping or unwrapping key material.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]` — new variants may be added in
/// future minor releases without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KmsError {
    /// The provider type string does not name any known wrapping provider.
    ///
    /// Raised when a keystore record references a provider this build has
    /// no adapter for. The containing key file must fail to load.
    #[error("unknown KEK provider \"{provider}\"")]
    UnknownProvider {
        /// The unrecognized provider type string.
        provider: String,
        /// The provider instance name from the record, if any.
        name: String,
    },

    /// A required configuration field for a provider is absent or empty.
    #[error("provider {provider} is missing required config field \"{field}\"")]
    MissingConfig {
        /// The provider type.
        provider: &'static str,
        /// The missing field name.
        field: &'static str,
    },

    /// The built-in AEAD provider was constructed without a KEK.
    #[error("provider {provider} requires a key encryption key")]
    MissingKek {
        /// The provider type.
        provider: String,
    },

    /// A local cipher operation failed.
    ///
    /// For the built-in AEAD provider this covers both a malformed KEK
    /// and an authentication failure on unwrap — a tampered record.
    #[error("KEK cipher failure: {0}")]
    Crypto(String),

    /// A remote provider request failed.
    #[error("{provider} request failed: {message}")]
    Remote {
        /// The provider type.
        provider: &'static str,
        /// What failed, including any response body detail.
        message: String,
        /// The underlying transport error, when there was one.
        #[source]
        source: Option<reqwest::Error>,
    },
}

impl KmsError {
    /// Creates a `Remote` error from a transport failure.
    #[must_use]
    pub fn remote_transport(provider: &'static str, source: reqwest::Error) -> Self {
        Self::Remote { provider, message: source.to_string(), source: Some(source) }
    }

    /// Creates a `Remote` error from a non-success response.
    #[must_use]
    pub fn remote_status(provider: &'static str, status: reqwest::StatusCode, body: &str) -> Self {
        Self::Remote {
            provider,
            message: format!("unexpected status {status}: {body}"),
            source: None,
        }
    }
}

/// Result type alias for KMS operations.
pub type Result<T> = std::result::Result<T, KmsError>;
