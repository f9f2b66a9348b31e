//! # Rafter cluster keyring
//!
//! The cryptographic keyring of a Rafter server region: encrypts cluster
//! variables at rest, mints signed workload identity tokens, and
//! replicates key material so that any server can decrypt variables and
//! verify tokens produced by any peer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       RPC handlers                           │
//! │   encrypt / decrypt / sign / verify / get-public-key         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                     Keyring (service)                        │
//! │        keyset cache (RwLock map of ready keysets)            │
//! ├───────────────────────┬──────────────────────────────────────┤
//! │   Keystore (disk)     │       KeyringReplicator              │
//! │ wrapped key files     │ pulls missing material from peers    │
//! ├───────────────────────┼──────────────────────────────────────┤
//! │   rafter-kms          │  KeyMetaStore      KeyringTransport  │
//! │ KEK wrap providers    │  (replicated log)  (cluster RPC)     │
//! └───────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! Key *metadata* lives in the replicated log and is always a superset
//! of any node's keystore; the replicator closes the gap by pulling
//! wrapped material from peers. Exactly one key is active at a time:
//! encrypt and sign always use it, while decrypt and verify address keys
//! by explicit ID so rotated-out keys keep working.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use rafter_keyring::{
//!     IdentityClaims, Keyring, KeyringConfig, MemoryKeyMetaStore, RootKey,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let state = Arc::new(MemoryKeyMetaStore::new());
//! let config = KeyringConfig::builder()
//!     .keystore_path("/var/lib/rafter/keystore")
//!     .issuer("https://rafter.example.com")
//!     .build();
//! let keyring = Keyring::open(config, state.clone()).await?;
//!
//! // Mint and install the region's first key.
//! let key = RootKey::generate_with_rsa(rafter_keyring::KeyMeta::new(vec![]))?;
//! state.upsert(key.meta.clone());
//! keyring.add_key(key).await?;
//!
//! let (ciphertext, key_id) = keyring.encrypt(b"db-password").await?;
//! let cleartext = keyring.decrypt(&ciphertext, &key_id)?;
//!
//! let (token, _) = keyring.sign_claims(IdentityClaims::new("example")).await?;
//! let claims = keyring.verify_claims(&token)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Workload identity claims.
pub mod claims;
/// Keyring error types.
pub mod error;
/// The keyring service.
pub mod keyring;
mod keyset;
/// On-disk keystore for wrapped key material.
pub mod keystore;
/// Background key material replication.
pub mod replicator;
/// Peer transport for key material replication.
pub mod rpc;
/// Key metadata store.
pub mod state;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
/// Key material and metadata types.
pub mod types;

pub use claims::IdentityClaims;
pub use error::{KeyringError, Result};
pub use keyring::{Keyring, KeyringConfig};
pub use keystore::{KEYSTORE_EXT, Keystore};
pub use replicator::KeyringReplicator;
pub use rpc::{KeyringGetRequest, KeyringGetResponse, KeyringTransport, QueryOptions};
pub use state::{KeyMetaStore, MemoryKeyMetaStore};
pub use types::{
    EncryptionAlgorithm, KeyId, KeyMeta, KeyState, KeyringPublicKey, PublicKeyAlgorithm,
    PublicKeyUse, RootKey, WrappedRootKey,
};
