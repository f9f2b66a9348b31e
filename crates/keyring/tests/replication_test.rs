//! Replication tests: catch-up from peers, tolerance of leadership
//! transitions, the signing grace window, and tombstone sweeps.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use rafter_keyring::{
    KeyState, Keyring, KeyringConfig, KeyringError, KeyringReplicator, MemoryKeyMetaStore,
    testutil::{StaticClusterTransport, test_claims, test_root_key, test_root_key_with_rsa},
};

async fn open_keyring(dir: &std::path::Path, state: Arc<MemoryKeyMetaStore>) -> Arc<Keyring> {
    let config = KeyringConfig::builder().keystore_path(dir).build();
    Keyring::open(config, state).await.expect("keyring should open")
}

/// Polls until `predicate` holds, failing the test after `deadline`.
async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(deadline, async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition should hold within the deadline");
}

#[tokio::test]
async fn replicator_catches_up_an_empty_node() {
    let state = Arc::new(MemoryKeyMetaStore::new());

    // Server A holds material for three keys, one active.
    let dir_a = tempfile::tempdir().unwrap();
    let a = open_keyring(dir_a.path(), state.clone()).await;

    let mut key_ids = Vec::new();
    for i in 0..3 {
        let mut key = if i == 0 { test_root_key_with_rsa() } else { test_root_key() };
        if i > 0 {
            key.meta.state = KeyState::Inactive;
        }
        key_ids.push(key.meta.key_id);
        state.upsert(key.meta.clone());
        a.add_key(key).await.unwrap();
    }

    // Server C starts with an empty keystore but sees the same log.
    let dir_c = tempfile::tempdir().unwrap();
    let c = open_keyring(dir_c.path(), state.clone()).await;
    assert!(key_ids.iter().all(|id| !c.has_key_material(id)));

    let transport = Arc::new(StaticClusterTransport::new());
    transport.set_leader(Some(a.clone()));

    let shutdown = CancellationToken::new();
    let handle =
        KeyringReplicator::new(c.clone(), state.clone(), transport, shutdown.clone()).spawn();

    // Rate limiter burst × number of keys bounds the catch-up well
    // under two seconds for three keys.
    let ids = key_ids.clone();
    let node = c.clone();
    wait_until(Duration::from_secs(2), move || {
        ids.iter().all(|id| node.has_key_material(id))
    })
    .await;

    // C can now decrypt anything A encrypted, under any of the keys.
    let (ciphertext, key_id) = a.encrypt(b"cross-node secret").await.unwrap();
    assert_eq!(c.decrypt(&ciphertext, &key_id).unwrap(), b"cross-node secret");

    // And verify tokens A signed.
    let (token, _) = a.sign_claims(test_claims("s1")).await.unwrap();
    assert_eq!(c.verify_claims(&token).unwrap().sub, "s1");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn replicator_falls_back_to_stale_peers() {
    let state = Arc::new(MemoryKeyMetaStore::new());

    // Server B holds the key; there is no leader, mid-election.
    let dir_b = tempfile::tempdir().unwrap();
    let b = open_keyring(dir_b.path(), state.clone()).await;

    let key = test_root_key();
    let key_id = key.meta.key_id;
    state.upsert(key.meta.clone());
    b.add_key(key).await.unwrap();

    let dir_c = tempfile::tempdir().unwrap();
    let c = open_keyring(dir_c.path(), state.clone()).await;

    let transport = Arc::new(StaticClusterTransport::new());
    transport.set_leader(None);
    transport.add_peer("server-b", b);

    let shutdown = CancellationToken::new();
    let handle =
        KeyringReplicator::new(c.clone(), state.clone(), transport, shutdown.clone()).spawn();

    let node = c.clone();
    wait_until(Duration::from_secs(2), move || node.has_key_material(&key_id)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn replicator_survives_keys_nobody_serves() {
    let state = Arc::new(MemoryKeyMetaStore::new());

    // Metadata for a key whose material no server holds yet.
    let orphan = test_root_key();
    let orphan_id = orphan.meta.key_id;
    state.upsert(orphan.meta.clone());

    let dir_c = tempfile::tempdir().unwrap();
    let c = open_keyring(dir_c.path(), state.clone()).await;

    let transport = Arc::new(StaticClusterTransport::new());
    transport.set_leader(None);

    let shutdown = CancellationToken::new();
    let replicator =
        KeyringReplicator::new(c.clone(), state.clone(), transport.clone(), shutdown.clone());
    let handle = replicator.spawn();

    // Give the loop a few ticks: it must keep running through the
    // failures rather than exiting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());
    assert!(!c.has_key_material(&orphan_id));

    // Once a peer appears with the material, the next tick installs it.
    let dir_b = tempfile::tempdir().unwrap();
    let b = open_keyring(dir_b.path(), state.clone()).await;
    b.add_key(orphan).await.unwrap();
    transport.add_peer("server-b", b);

    let node = c.clone();
    wait_until(Duration::from_secs(2), move || node.has_key_material(&orphan_id)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn replicator_sweeps_tombstoned_keys() {
    let state = Arc::new(MemoryKeyMetaStore::new());

    let dir = tempfile::tempdir().unwrap();
    let keyring = open_keyring(dir.path(), state.clone()).await;

    let keep = test_root_key();
    let keep_id = keep.meta.key_id;
    state.upsert(keep.meta.clone());
    keyring.add_key(keep).await.unwrap();

    let mut gone = test_root_key();
    gone.meta.state = KeyState::Deprecated;
    let gone_id = gone.meta.key_id;
    state.upsert(gone.meta.clone());
    keyring.add_key(gone).await.unwrap();

    let gone_path = dir.path().join(format!("{gone_id}.nks.json"));
    assert!(gone_path.exists());

    let transport = Arc::new(StaticClusterTransport::new());
    transport.set_leader(Some(keyring.clone()));

    let shutdown = CancellationToken::new();
    let handle =
        KeyringReplicator::new(keyring.clone(), state.clone(), transport, shutdown.clone())
            .spawn();

    // Tombstone the deprecated key; the replicator removes its material
    // and keystore files while leaving the live key alone.
    state.tombstone(&gone_id);

    let node = keyring.clone();
    wait_until(Duration::from_secs(2), move || !node.has_key_material(&gone_id)).await;
    wait_until(Duration::from_secs(2), move || !gone_path.exists()).await;
    assert!(keyring.has_key_material(&keep_id));
    assert!(dir.path().join(format!("{keep_id}.nks.json")).exists());

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn sign_blocks_until_material_arrives() {
    let state = Arc::new(MemoryKeyMetaStore::new());

    // The new leader committed K3's metadata, but its material has not
    // reached this node yet.
    let key = test_root_key();
    let key_id = key.meta.key_id;
    state.upsert(key.meta.clone());

    let dir = tempfile::tempdir().unwrap();
    let keyring = open_keyring(dir.path(), state.clone()).await;

    // Material lands while the signing request is waiting.
    let installer = {
        let keyring = keyring.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            keyring.add_key(key).await.unwrap();
        })
    };

    let (token, kid) = keyring.sign_claims(test_claims("s1")).await.unwrap();
    assert_eq!(kid, key_id);
    assert_eq!(keyring.verify_claims(&token).unwrap().sub, "s1");

    installer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn sign_gives_up_without_replication() {
    let state = Arc::new(MemoryKeyMetaStore::new());

    // Active metadata with no material anywhere, and no replication.
    let key = test_root_key();
    state.upsert(key.meta.clone());
    drop(key);

    let dir = tempfile::tempdir().unwrap();
    let keyring = open_keyring(dir.path(), state).await;

    // With the clock paused the five-second budget elapses instantly,
    // and the request fails as retryable.
    let err = keyring.sign_claims(test_claims("s1")).await.unwrap_err();
    assert!(matches!(err, KeyringError::NotInitialized));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn sign_without_any_metadata_waits_then_fails() {
    // No metadata at all: the keyring is simply uninitialized.
    let state = Arc::new(MemoryKeyMetaStore::new());
    let dir = tempfile::tempdir().unwrap();
    let keyring = {
        let config = KeyringConfig::builder().keystore_path(dir.path()).build();
        Keyring::open(config, state).await.unwrap()
    };

    tokio::time::pause();
    let err = keyring.sign_claims(test_claims("s1")).await.unwrap_err();
    assert!(matches!(err, KeyringError::NotInitialized));
}

#[tokio::test]
async fn replicator_exits_promptly_on_shutdown() {
    let state = Arc::new(MemoryKeyMetaStore::new());
    let dir = tempfile::tempdir().unwrap();
    let keyring = open_keyring(dir.path(), state.clone()).await;

    let transport = Arc::new(StaticClusterTransport::new());
    let shutdown = CancellationToken::new();
    let handle =
        KeyringReplicator::new(keyring, state, transport, shutdown.clone()).spawn();

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("replicator should exit on cancellation")
        .unwrap();
}

#[tokio::test]
async fn replicated_material_is_byte_identical() {
    let state = Arc::new(MemoryKeyMetaStore::new());

    let dir_a = tempfile::tempdir().unwrap();
    let a = open_keyring(dir_a.path(), state.clone()).await;

    let key = test_root_key_with_rsa();
    let key_id = key.meta.key_id;
    state.upsert(key.meta.clone());
    a.add_key(key).await.unwrap();

    let dir_c = tempfile::tempdir().unwrap();
    let c = open_keyring(dir_c.path(), state.clone()).await;

    let transport = Arc::new(StaticClusterTransport::new());
    transport.set_leader(Some(a.clone()));

    let shutdown = CancellationToken::new();
    let handle =
        KeyringReplicator::new(c.clone(), state.clone(), transport, shutdown.clone()).spawn();

    let node = c.clone();
    wait_until(Duration::from_secs(2), move || node.has_key_material(&key_id)).await;

    // The replicated keyset publishes the same public key, so tokens
    // verify identically cluster-wide.
    assert_eq!(
        a.get_public_key(&key_id).unwrap(),
        c.get_public_key(&key_id).unwrap()
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}
