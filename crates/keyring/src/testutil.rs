//! Shared test utilities for keyring testing.
//!
//! Provides deterministic key material, claims builders, and an
//! in-process cluster transport so replication can be exercised without
//! a real RPC layer. Feature-gated behind `testutil` to keep it out of
//! production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! rafter-keyring = { path = "../keyring", features = ["testutil"] }
//! ```

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use rafter_kms::KekProviderConfig;

use crate::{
    claims::IdentityClaims,
    error::{KeyringError, Result},
    keyring::Keyring,
    rpc::{KeyringGetRequest, KeyringGetResponse, KeyringTransport},
    types::{KeyMeta, RootKey},
};

/// Metadata for a fresh active key wrapped by the built-in AEAD
/// provider.
#[must_use]
pub fn test_meta() -> KeyMeta {
    KeyMeta::new(vec![KekProviderConfig::aead()])
}

/// A fresh random root key without RSA material (signs EdDSA).
#[must_use]
pub fn test_root_key() -> RootKey {
    RootKey::generate(test_meta())
}

/// A fresh random root key with RSA material (signs RS256).
///
/// # Panics
///
/// Panics if RSA key generation fails.
#[must_use]
pub fn test_root_key_with_rsa() -> RootKey {
    RootKey::generate_with_rsa(test_meta()).expect("RSA key generation")
}

/// Claims for a test workload, expiring one hour from now.
#[must_use]
pub fn test_claims(sub: &str) -> IdentityClaims {
    let now = Utc::now().timestamp() as u64;
    let mut claims = IdentityClaims::new(sub).with_expiry(now + 3600);
    claims.iat = Some(now);
    claims
}

/// An in-process [`KeyringTransport`] over a set of peer keyrings.
///
/// The leader and peers can be swapped at runtime to model leadership
/// transitions. A request for a key the serving keyring does not hold
/// answers with an empty response, as a real server would; an unset
/// leader answers with an error, modeling an election in progress.
#[derive(Default)]
pub struct StaticClusterTransport {
    leader: RwLock<Option<Arc<Keyring>>>,
    peers: RwLock<HashMap<String, Arc<Keyring>>>,
}

impl StaticClusterTransport {
    /// Creates a transport with no leader and no peers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets or clears the regional leader.
    pub fn set_leader(&self, leader: Option<Arc<Keyring>>) {
        *self.leader.write() = leader;
    }

    /// Registers a named peer.
    pub fn add_peer(&self, name: impl Into<String>, peer: Arc<Keyring>) {
        self.peers.write().insert(name.into(), peer);
    }
}

#[async_trait]
impl KeyringTransport for StaticClusterTransport {
    async fn get_from_leader(&self, req: &KeyringGetRequest) -> Result<KeyringGetResponse> {
        let leader = self.leader.read().clone();
        match leader {
            Some(keyring) => {
                Ok(KeyringGetResponse { key: keyring.key_material(&req.key_id).ok() })
            }
            None => Err(KeyringError::Internal("no cluster leader".into())),
        }
    }

    async fn get_from_peer(
        &self,
        peer: &str,
        req: &KeyringGetRequest,
    ) -> Result<KeyringGetResponse> {
        let peer = self
            .peers
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| KeyringError::Internal(format!("no such peer {peer}")))?;
        Ok(KeyringGetResponse { key: peer.key_material(&req.key_id).ok() })
    }

    fn peers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.read().keys().cloned().collect();
        names.sort();
        names
    }
}
