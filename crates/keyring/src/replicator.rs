//! Background key material replication.
//!
//! Key metadata travels through the replicated log, but the material
//! itself is only ever copied node-to-node. [`KeyringReplicator`] is a
//! long-lived task that watches the metadata table for keys this node
//! has no material for and pulls them from the regional leader, falling
//! back to individual peers around leadership transitions. It also
//! sweeps keystore files for keys the log has tombstoned.
//!
//! Partial failure is always "log and retry next tick", never an exit: a
//! key nobody can serve right now may be served by the next leader. The
//! token bucket keeps that retry from becoming a tight loop.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    error::{KeyringError, Result},
    keyring::Keyring,
    rpc::{KeyringGetRequest, KeyringGetResponse, KeyringTransport, QueryOptions},
    state::KeyMetaStore,
    types::KeyMeta,
};

/// Sustained replication loop rate, ticks per second.
pub const REPLICATION_RATE: u64 = 5;

/// Burst capacity of the replication rate limiter.
pub const REPLICATION_BURST: u64 = 5;

/// A token bucket pacing the replication loop.
///
/// `try_acquire` refills from elapsed time and either consumes a token
/// or reports how long until one is available; the caller sleeps that
/// long. Failure ticks therefore cost the same as productive ones.
struct ReplicationBucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    burst: f64,
}

impl ReplicationBucket {
    fn new(rate: u64, burst: u64) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: Instant::now(),
            rate: rate as f64,
            burst: burst as f64,
        }
    }

    fn try_acquire(&mut self) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate))
        }
    }
}

/// The background replication task.
pub struct KeyringReplicator {
    keyring: Arc<Keyring>,
    state: Arc<dyn KeyMetaStore>,
    transport: Arc<dyn KeyringTransport>,
    shutdown: CancellationToken,
    bucket: Mutex<ReplicationBucket>,
}

impl KeyringReplicator {
    /// Creates a replicator for the given keyring.
    #[must_use]
    pub fn new(
        keyring: Arc<Keyring>,
        state: Arc<dyn KeyMetaStore>,
        transport: Arc<dyn KeyringTransport>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            keyring,
            state,
            transport,
            shutdown,
            bucket: Mutex::new(ReplicationBucket::new(REPLICATION_RATE, REPLICATION_BURST)),
        }
    }

    /// Spawns the replication loop onto the runtime. The task exits only
    /// when the shutdown token is cancelled.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Runs the replication loop until shutdown.
    pub async fn run(&self) {
        debug!("starting key material replication");

        while !self.shutdown.is_cancelled() {
            // Bind before matching so the bucket lock is not held across
            // the sleep.
            let acquired = self.bucket.lock().try_acquire();
            if let Err(wait) = acquired {
                tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    () = tokio::time::sleep(wait) => {}
                }
                continue;
            }

            let metas = match self.state.key_metas().await {
                Ok(metas) => metas,
                Err(err) => {
                    error!(error = %err, "failed to fetch keyring metadata");
                    continue;
                }
            };

            self.sweep_tombstoned(&metas).await;

            for meta in metas {
                if self.shutdown.is_cancelled() {
                    break;
                }
                // Key material is immutable once created; if we already
                // have it, there is nothing to fetch.
                if self.keyring.has_key_material(&meta.key_id) {
                    continue;
                }
                if let Err(err) = self.replicate_key(&meta).await {
                    // Not fatal to the loop: retried on the next tick.
                    error!(key = %meta.key_id, error = %err, "failed to replicate key");
                }
            }
        }

        debug!("exiting key material replication");
    }

    /// Deletes local material and keystore files for keys the log no
    /// longer knows.
    ///
    /// An entirely empty metadata table is not treated as a mass
    /// tombstone: a node restored into an uninitialized cluster must not
    /// destroy its keystore.
    async fn sweep_tombstoned(&self, metas: &[KeyMeta]) {
        if metas.is_empty() {
            return;
        }
        let live: HashSet<_> = metas.iter().map(|m| m.key_id).collect();
        for key_id in self.keyring.cached_key_ids() {
            if live.contains(&key_id) {
                continue;
            }
            match self.keyring.sweep_key(&key_id).await {
                Ok(()) => debug!(key = %key_id, "swept tombstoned key"),
                Err(err) => error!(key = %key_id, error = %err, "failed to sweep tombstoned key"),
            }
        }
    }

    /// Pulls one key's material from the leader, or failing that from
    /// any peer. Returns an error only when no server has it.
    async fn replicate_key(&self, meta: &KeyMeta) -> Result<()> {
        let key_id = meta.key_id;
        debug!(key = %key_id, "replicating new key");

        let mut req = KeyringGetRequest {
            key_id,
            query: QueryOptions {
                // Block the leader until it has applied the metadata
                // entry that told us about this key.
                min_query_index: meta.modify_index.saturating_sub(1),
                allow_stale: false,
            },
        };

        let mut key = match self.transport.get_from_leader(&req).await {
            Ok(KeyringGetResponse { key: Some(key) }) => Some(key),
            Ok(KeyringGetResponse { key: None }) => {
                warn!(key = %key_id, "failed to fetch key from current leader, trying peers");
                None
            }
            Err(err) => {
                warn!(key = %key_id, error = %err,
                    "failed to fetch key from current leader, trying peers");
                None
            }
        };

        if key.is_none() {
            // A key rotated during a leadership transition may not have
            // reached the new leader yet. Ask everyone else, stale reads
            // allowed.
            req.query.allow_stale = true;
            for peer in self.transport.peers() {
                match self.transport.get_from_peer(&peer, &req).await {
                    Ok(KeyringGetResponse { key: Some(found) }) => {
                        key = Some(found);
                        break;
                    }
                    Ok(KeyringGetResponse { key: None }) => {}
                    Err(err) => {
                        debug!(key = %key_id, peer = %peer, error = %err, "peer could not serve key");
                    }
                }
            }
        }

        let Some(key) = key else {
            return Err(KeyringError::Internal(format!(
                "failed to fetch key {key_id} from any peer"
            )));
        };

        self.keyring.add_key(key).await?;
        debug!(key = %key_id, "added key");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_burst_then_rejects() {
        let mut bucket = ReplicationBucket::new(5, 5);
        for _ in 0..5 {
            assert!(bucket.try_acquire().is_ok());
        }
        let wait = bucket.try_acquire().unwrap_err();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_millis(200));
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = ReplicationBucket::new(5, 1);
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_err());

        // Backdate the refill clock instead of sleeping.
        bucket.last_refill -= Duration::from_secs(1);
        assert!(bucket.try_acquire().is_ok());
    }

    #[test]
    fn bucket_never_exceeds_burst() {
        let mut bucket = ReplicationBucket::new(100, 2);
        bucket.last_refill -= Duration::from_secs(60);
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_err());
    }
}
