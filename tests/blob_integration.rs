//! Integration tests for blob replication across real storage backends.

use scribe_sync::blob::{BlobEngine, BlobPeer, BlobStore, MemoryBlobStore, RocksBlobStore, RocksConfig};
use std::sync::Arc;
use tempfile::TempDir;

fn rocks_peer(name: &str, dir: &TempDir) -> Arc<BlobPeer> {
    let store = RocksBlobStore::open(name, RocksConfig::new(dir.path().join(name))).unwrap();
    Arc::new(BlobPeer::new(Arc::new(store)))
}

#[tokio::test]
async fn test_rocks_backed_engine_roundtrip() {
    let dir = TempDir::new().unwrap();
    let local = rocks_peer("local", &dir);
    let remote = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("remote"))));
    let engine = BlobEngine::new(local, vec![remote.clone()]);

    let payload = vec![7u8; 128 * 1024];
    engine.set("attachment", payload.clone()).await.unwrap();
    engine.join_background().await;

    assert_eq!(engine.get("attachment").await.unwrap(), Some(payload.clone()));
    assert_eq!(remote.get("attachment").await.unwrap(), Some(payload));
}

#[tokio::test]
async fn test_rocks_store_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("blobs");

    {
        let store = RocksBlobStore::open("local", RocksConfig::new(path.clone())).unwrap();
        store.set("k", b"survives restart".to_vec()).await.unwrap();
    }

    let store = RocksBlobStore::open("local", RocksConfig::new(path)).unwrap();
    assert_eq!(
        store.get("k").await.unwrap(),
        Some(b"survives restart".to_vec())
    );
    assert_eq!(store.list().await.unwrap(), vec!["k".to_string()]);
}

#[tokio::test]
async fn test_two_devices_share_blobs_through_server_peer() {
    // Device A and device B each have their own local store; both point
    // at the same server peer.
    let server = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("server"))));
    let device_a = BlobEngine::new(
        Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("device-a")))),
        vec![server.clone()],
    );
    let local_b = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("device-b"))));
    let device_b = BlobEngine::new(local_b.clone(), vec![server.clone()]);

    device_a.set("shared", vec![1, 2, 3]).await.unwrap();
    device_a.join_background().await;

    // B reads through to the server even though its local store is empty.
    assert_eq!(device_b.get("shared").await.unwrap(), Some(vec![1, 2, 3]));

    // A sync pass makes it locally durable on B.
    let report = device_b.sync().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(local_b.get("shared").await.unwrap(), Some(vec![1, 2, 3]));
}

#[tokio::test]
async fn test_sync_converges_disjoint_rocks_peers() {
    let dir = TempDir::new().unwrap();
    let local = rocks_peer("local", &dir);
    let remote = rocks_peer("remote", &dir);

    local.set("a", vec![1]).await.unwrap();
    local.set("b", vec![2]).await.unwrap();
    remote.set("c", vec![3]).await.unwrap();

    let engine = BlobEngine::new(local.clone(), vec![remote.clone()]);
    let report = engine.sync().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.total_transferred(), 3);

    for peer in [&local, &remote] {
        let mut keys = peer.list().await.unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    // Nothing left to move.
    assert_eq!(engine.sync().await.unwrap().total_transferred(), 0);
}

#[tokio::test]
async fn test_list_spans_backends() {
    let dir = TempDir::new().unwrap();
    let local = rocks_peer("local", &dir);
    let remote = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("remote"))));

    local.set("on-disk", vec![1]).await.unwrap();
    remote.set("in-memory", vec![2]).await.unwrap();

    let engine = BlobEngine::new(local, vec![remote]);
    let mut keys = engine.list().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["in-memory".to_string(), "on-disk".to_string()]);
}
