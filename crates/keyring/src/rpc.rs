//! Peer transport for key material replication.
//!
//! The replicator pulls wrapped-and-rewrapped key material from peer
//! servers over the cluster RPC layer. That layer lives outside this
//! crate; [`KeyringTransport`] is the narrow slice of it the keyring
//! needs: a request/reply call to the regional leader and forwarding to
//! named peers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    types::{KeyId, RootKey},
};

/// Read options attached to a key material request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Blocks the serving node until its replicated state has caught up
    /// to this log index. Used so a follower that has just learned of a
    /// key's metadata does not race the leader applying it.
    pub min_query_index: u64,

    /// Permits a non-leader to answer from possibly stale state. Set
    /// when falling back to peers during a leadership transition.
    pub allow_stale: bool,
}

/// Request for one key's material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyringGetRequest {
    /// The key being fetched.
    pub key_id: KeyId,
    /// Read options.
    pub query: QueryOptions,
}

/// Reply carrying key material, when the serving node has it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyringGetResponse {
    /// The root key, absent when the serving node holds no material for
    /// the requested ID.
    pub key: Option<RootKey>,
}

/// The keyring's view of the cluster RPC layer.
#[async_trait]
pub trait KeyringTransport: Send + Sync {
    /// Asks the regional leader for key material.
    async fn get_from_leader(&self, req: &KeyringGetRequest) -> Result<KeyringGetResponse>;

    /// Asks one specific peer for key material, bypassing leader
    /// forwarding. The request should carry `allow_stale`.
    async fn get_from_peer(&self, peer: &str, req: &KeyringGetRequest)
    -> Result<KeyringGetResponse>;

    /// The peer servers currently known in this region.
    fn peers(&self) -> Vec<String>;
}
