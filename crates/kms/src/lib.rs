//! # Rafter KMS wrappers
//!
//! Key-encryption-key (KEK) wrapping providers for the Rafter keyring.
//!
//! The keyring never writes a data encryption key (DEK) to disk in the
//! clear. Before a key lands in the on-disk keystore it is wrapped by one
//! of the providers in this crate:
//!
//! - [`AeadKekWrapper`] — the built-in provider. The caller supplies a
//!   32-byte KEK which is stored alongside the wrapped DEK in the
//!   keystore record itself.
//! - [`TransitKekWrapper`] — a transit-style secrets engine reached over
//!   HTTP; the KEK never leaves the secrets engine.
//! - [`AwsKmsKekWrapper`], [`AzureKeyVaultKekWrapper`],
//!   [`GcpCkmsKekWrapper`] — cloud KMS services; the KEK is held by the
//!   cloud provider and the keystore record stores only the returned
//!   ciphertext.
//!
//! All providers implement the [`KekWrapper`] trait and are constructed
//! through [`ProviderConfigs::wrapper`], which dispatches on the provider
//! type string recorded in the keystore file. An unrecognized provider
//! string is an error — a keystore record we cannot unwrap must fail
//! loudly rather than be skipped.
//!
//! Wrapper handles are created per wrap/unwrap call and are not pooled;
//! the natural throughput of keystore save/load bounds the request rate.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Built-in AEAD wrapping provider.
pub mod aead;
/// AWS KMS wrapping provider.
pub mod awskms;
/// Azure Key Vault wrapping provider.
pub mod azurekeyvault;
/// Provider configuration registry.
pub mod config;
/// KMS error types.
pub mod error;
/// GCP Cloud KMS wrapping provider.
pub mod gcpckms;
mod sigv4;
/// Transit secrets-engine wrapping provider.
pub mod transit;
/// The KEK wrapping trait.
pub mod wrapper;

pub use aead::AeadKekWrapper;
pub use awskms::AwsKmsKekWrapper;
pub use azurekeyvault::AzureKeyVaultKekWrapper;
pub use config::{
    KekProviderConfig, PROVIDER_AEAD, PROVIDER_AWS_KMS, PROVIDER_AZURE_KEY_VAULT,
    PROVIDER_GCP_CKMS, PROVIDER_TRANSIT, ProviderConfigs,
};
pub use error::{KmsError, Result};
pub use gcpckms::GcpCkmsKekWrapper;
pub use transit::TransitKekWrapper;
pub use wrapper::KekWrapper;
