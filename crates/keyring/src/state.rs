//! Key metadata store.
//!
//! The replicated log owns key *metadata*; this module defines the read
//! interface the keyring needs from it, plus an in-memory implementation
//! for tests and development. The production store is the server's
//! raft-backed state and lives outside this crate.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{
    error::{KeyringError, Result},
    types::{KeyId, KeyMeta, KeyState},
};

/// Read access to the replicated key metadata table.
///
/// Implementations must serve linearizable snapshots: after a rotation
/// commits, `active_key_meta` observes the new active record
/// immediately. The keyring reads the active key ID freshly on every
/// encrypt and sign, so it never caches staleness of its own.
#[async_trait]
pub trait KeyMetaStore: Send + Sync {
    /// Snapshot of every key metadata record.
    async fn key_metas(&self) -> Result<Vec<KeyMeta>>;

    /// The metadata record currently in the active state, if any.
    async fn active_key_meta(&self) -> Result<Option<KeyMeta>>;
}

/// In-memory implementation of [`KeyMetaStore`] for testing.
///
/// Mutation helpers model what the log applies: upserts bump a
/// monotonically increasing index, publishing an active key demotes the
/// previous one, and tombstoning removes the record entirely.
///
/// Cloning shares the underlying state.
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyMetaStore {
    metas: Arc<RwLock<HashMap<KeyId, KeyMeta>>>,
    index: Arc<AtomicU64>,
}

impl MemoryKeyMetaStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a metadata record, stamping its modify index.
    ///
    /// When the record is active, any previously active record is
    /// demoted to inactive — exactly one key is active at a time.
    #[tracing::instrument(skip(self, meta), fields(key = %meta.key_id))]
    pub fn upsert(&self, mut meta: KeyMeta) -> KeyMeta {
        let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        meta.modify_index = index;

        let mut metas = self.metas.write();
        if meta.is_active() {
            for existing in metas.values_mut() {
                if existing.is_active() && existing.key_id != meta.key_id {
                    existing.state = KeyState::Inactive;
                    existing.modify_index = index;
                }
            }
        }
        metas.insert(meta.key_id, meta.clone());
        meta
    }

    /// Makes the given key the active one, demoting the previous active
    /// record.
    ///
    /// # Errors
    ///
    /// Returns [`KeyringError::NoSuchKey`] when the ID has no record.
    #[tracing::instrument(skip(self))]
    pub fn set_active(&self, key_id: &KeyId) -> Result<()> {
        let mut metas = self.metas.write();
        if !metas.contains_key(key_id) {
            return Err(KeyringError::NoSuchKey { key_id: key_id.to_string() });
        }
        let index = self.index.fetch_add(1, Ordering::SeqCst) + 1;
        for meta in metas.values_mut() {
            if meta.key_id == *key_id {
                meta.state = KeyState::Active;
                meta.modify_index = index;
            } else if meta.is_active() {
                meta.state = KeyState::Inactive;
                meta.modify_index = index;
            }
        }
        Ok(())
    }

    /// Removes a record, as a tombstone log entry would. Idempotent.
    #[tracing::instrument(skip(self))]
    pub fn tombstone(&self, key_id: &KeyId) {
        self.index.fetch_add(1, Ordering::SeqCst);
        self.metas.write().remove(key_id);
    }
}

#[async_trait]
impl KeyMetaStore for MemoryKeyMetaStore {
    async fn key_metas(&self) -> Result<Vec<KeyMeta>> {
        let mut metas: Vec<KeyMeta> = self.metas.read().values().cloned().collect();
        metas.sort_by_key(|m| m.key_id);
        Ok(metas)
    }

    async fn active_key_meta(&self) -> Result<Option<KeyMeta>> {
        Ok(self.metas.read().values().find(|m| m.is_active()).cloned())
    }
}
