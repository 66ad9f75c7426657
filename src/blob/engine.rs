//! Blob engine: orchestrates one local peer and an ordered list of remote
//! peers.
//!
//! Reads fall through in two passes — first the fast inventory probe, then
//! a full scan of every peer for cold caches. Writes are local-first: the
//! caller's future resolves after local durability, while replication to
//! the remotes runs as a background settle-all task whose outcome is only
//! logged. Callers needing multi-peer durability run [`BlobEngine::sync`]
//! and inspect the returned [`SyncReport`].
//!
//! Sync is a full pairwise reconciliation pass, O(peers × keys) per
//! invocation, triggered externally — nothing here runs continuously.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::peer::BlobPeer;
use super::store::BlobError;

/// Outcome of one `sync()` pass against a single remote peer.
#[derive(Debug, Clone)]
pub struct PeerSyncReport {
    /// Remote peer name.
    pub peer: String,
    /// Keys copied local → remote.
    pub uploaded: usize,
    /// Keys copied remote → local.
    pub downloaded: usize,
    /// Keys that failed in either direction.
    pub failed: usize,
    /// False if the remote could not even be listed.
    pub reachable: bool,
}

/// Outcome of a full `sync()` pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub peers: Vec<PeerSyncReport>,
}

impl SyncReport {
    /// True when every peer was reachable and no key failed.
    pub fn is_clean(&self) -> bool {
        self.peers.iter().all(|p| p.reachable && p.failed == 0)
    }

    /// Total keys moved in either direction.
    pub fn total_transferred(&self) -> usize {
        self.peers.iter().map(|p| p.uploaded + p.downloaded).sum()
    }
}

/// Multi-peer blob replication engine.
pub struct BlobEngine {
    local: Arc<BlobPeer>,
    remotes: Vec<Arc<BlobPeer>>,
    /// Background replication tasks spawned by `set`, joinable in tests.
    background: Mutex<JoinSet<()>>,
}

impl BlobEngine {
    pub fn new(local: Arc<BlobPeer>, remotes: Vec<Arc<BlobPeer>>) -> Self {
        Self {
            local,
            remotes,
            background: Mutex::new(JoinSet::new()),
        }
    }

    fn peers(&self) -> impl Iterator<Item = &Arc<BlobPeer>> {
        std::iter::once(&self.local).chain(self.remotes.iter())
    }

    /// Two-pass read-through.
    ///
    /// Pass 1 probes peers in order `[local, remotes...]` through the fast
    /// inventory check before fetching. Pass 2 falls back to calling `get`
    /// on every peer, so a cold inventory degrades to extra round trips
    /// instead of a miss. Per-peer errors are logged, never fatal.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        for peer in self.peers() {
            if peer.has(key).await {
                match peer.get(key).await {
                    Ok(Some(data)) => return Ok(Some(data)),
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("Error fetching blob {key} from [{}]: {e}", peer.name())
                    }
                }
            }
        }

        for peer in self.peers() {
            match peer.get(key).await {
                Ok(Some(data)) => return Ok(Some(data)),
                Ok(None) => {}
                Err(e) => log::warn!("Error fetching blob {key} from [{}]: {e}", peer.name()),
            }
        }

        Ok(None)
    }

    /// Write a blob.
    ///
    /// Resolves after the local peer confirms durability. Replication to
    /// every remote peer proceeds in the background with settle-all
    /// semantics: each failure is logged, none reaches the caller.
    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BlobError> {
        self.local.set(key, value.clone()).await?;

        let remotes = self.remotes.clone();
        let key = key.to_string();
        let mut background = self.background.lock().await;
        background.spawn(async move {
            let results = join_all(remotes.iter().map(|peer| {
                let key = key.clone();
                let value = value.clone();
                async move {
                    peer.set(&key, value).await.map_err(|e| {
                        log::error!("Error replicating blob {key} to [{}]: {e}", peer.name());
                    })
                }
            }))
            .await;

            if results.iter().any(|r| r.is_err()) {
                log::error!("Blob {key} stored locally, but some peers failed to replicate");
            } else {
                log::debug!("Blob {key} replicated to {} remote peers", remotes.len());
            }
        });
        // Reap whatever already finished so the set stays bounded.
        while background.try_join_next().is_some() {}

        Ok(())
    }

    /// Await completion of all background replication spawned by `set`.
    pub async fn join_background(&self) {
        let mut background = self.background.lock().await;
        while background.join_next().await.is_some() {}
    }

    /// Deletion is unsupported; a safe no-op on every peer.
    pub async fn delete(&self, key: &str) -> Result<(), BlobError> {
        for peer in self.peers() {
            peer.delete(key).await?;
        }
        Ok(())
    }

    /// Union of every peer's key list, duplicates suppressed. Unreachable
    /// peers are logged and skipped.
    pub async fn list(&self) -> Result<Vec<String>, BlobError> {
        let mut keys = HashSet::new();
        for peer in self.peers() {
            match peer.list().await {
                Ok(list) => keys.extend(list),
                Err(e) => log::warn!("Error listing blobs on [{}]: {e}", peer.name()),
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Full pairwise reconciliation between the local peer and every
    /// remote.
    ///
    /// For each remote, uploads `local − remote` and downloads
    /// `remote − local`, key by key. One key's failure is logged and does
    /// not abort the rest; an unreachable remote does not abort the other
    /// remotes. Only a failure to list the *local* peer is fatal.
    pub async fn sync(&self) -> Result<SyncReport, BlobError> {
        let mut report = SyncReport::default();

        for remote in &self.remotes {
            let local_keys: HashSet<String> = self.local.list().await?.into_iter().collect();
            let remote_keys: HashSet<String> = match remote.list().await {
                Ok(keys) => keys.into_iter().collect(),
                Err(e) => {
                    log::error!("Skipping unreachable peer [{}]: {e}", remote.name());
                    report.peers.push(PeerSyncReport {
                        peer: remote.name().to_string(),
                        uploaded: 0,
                        downloaded: 0,
                        failed: 0,
                        reachable: false,
                    });
                    continue;
                }
            };

            let mut peer_report = PeerSyncReport {
                peer: remote.name().to_string(),
                uploaded: 0,
                downloaded: 0,
                failed: 0,
                reachable: true,
            };

            for key in local_keys.difference(&remote_keys) {
                match self.transfer(&self.local, remote, key).await {
                    Ok(true) => peer_report.uploaded += 1,
                    Ok(false) => {}
                    Err(e) => {
                        peer_report.failed += 1;
                        log::error!(
                            "Error syncing {key} from [{}] to [{}]: {e}",
                            self.local.name(),
                            remote.name()
                        );
                    }
                }
            }

            for key in remote_keys.difference(&local_keys) {
                match self.transfer(remote, &self.local, key).await {
                    Ok(true) => peer_report.downloaded += 1,
                    Ok(false) => {}
                    Err(e) => {
                        peer_report.failed += 1;
                        log::error!(
                            "Error syncing {key} from [{}] to [{}]: {e}",
                            remote.name(),
                            self.local.name()
                        );
                    }
                }
            }

            log::info!(
                "Synced with [{}]: {} up, {} down, {} failed",
                peer_report.peer,
                peer_report.uploaded,
                peer_report.downloaded,
                peer_report.failed
            );
            report.peers.push(peer_report);
        }

        Ok(report)
    }

    /// Copy one key between peers. `Ok(false)` means the source no longer
    /// reported the key.
    async fn transfer(
        &self,
        from: &Arc<BlobPeer>,
        to: &Arc<BlobPeer>,
        key: &str,
    ) -> Result<bool, BlobError> {
        match from.get(key).await? {
            Some(data) => {
                to.set(key, data).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::store::{BlobStore, MemoryBlobStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose operations fail while `broken` is set.
    struct FlakyStore {
        inner: MemoryBlobStore,
        broken: AtomicBool,
    }

    impl FlakyStore {
        fn new(name: &str) -> Self {
            Self {
                inner: MemoryBlobStore::new(name),
                broken: AtomicBool::new(false),
            }
        }

        fn set_broken(&self, broken: bool) {
            self.broken.store(broken, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), BlobError> {
            if self.broken.load(Ordering::SeqCst) {
                Err(BlobError::DatabaseError("simulated outage".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl BlobStore for FlakyStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
            self.check()?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BlobError> {
            self.check()?;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), BlobError> {
            self.inner.delete(key).await
        }

        async fn list(&self) -> Result<Vec<String>, BlobError> {
            self.check()?;
            self.inner.list().await
        }
    }

    fn engine_with_remotes(remote_count: usize) -> (BlobEngine, Vec<Arc<BlobPeer>>) {
        let local = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("local"))));
        let remotes: Vec<Arc<BlobPeer>> = (0..remote_count)
            .map(|i| {
                Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new(format!(
                    "remote-{i}"
                )))))
            })
            .collect();
        (BlobEngine::new(local, remotes.clone()), remotes)
    }

    #[tokio::test]
    async fn test_set_is_locally_durable_and_replicates() {
        let (engine, remotes) = engine_with_remotes(3);

        engine.set("k", vec![1, 2, 3]).await.unwrap();
        engine.join_background().await;

        // Every remote got the blob eagerly, including the first one.
        for remote in &remotes {
            assert_eq!(remote.get("k").await.unwrap(), Some(vec![1, 2, 3]));
        }
    }

    #[tokio::test]
    async fn test_set_survives_remote_failure() {
        let local = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("local"))));
        let broken = Arc::new(FlakyStore::new("remote-broken"));
        broken.set_broken(true);
        let remote = Arc::new(BlobPeer::new(broken));
        let engine = BlobEngine::new(local.clone(), vec![remote]);

        // The caller still succeeds: durability is local-only by contract.
        engine.set("k", vec![5]).await.unwrap();
        engine.join_background().await;
        assert_eq!(local.get("k").await.unwrap(), Some(vec![5]));
    }

    #[tokio::test]
    async fn test_get_falls_back_past_cold_inventory() {
        let local = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("local"))));
        let remote_store = Arc::new(MemoryBlobStore::new("remote"));
        remote_store.preload("k", vec![42]).await;
        let remote = Arc::new(BlobPeer::new(remote_store));
        let engine = BlobEngine::new(local, vec![remote.clone()]);

        // Inventory is cold everywhere, so pass 1 finds nothing and pass 2
        // reaches the remote store directly.
        assert!(!remote.has("k").await);
        assert_eq!(engine.get("k").await.unwrap(), Some(vec![42]));
        // The hit warmed the remote's inventory.
        assert!(remote.has("k").await);
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let (engine, _) = engine_with_remotes(2);
        assert_eq!(engine.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_unions_all_peers() {
        let (engine, remotes) = engine_with_remotes(2);
        engine.set("a", vec![1]).await.unwrap();
        remotes[0].set("b", vec![2]).await.unwrap();
        remotes[1].set("a", vec![1]).await.unwrap();

        let mut keys = engine.list().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_sync_reconciles_both_directions() {
        let local = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("local"))));
        let remote = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("remote"))));

        local.set("a", vec![1]).await.unwrap();
        local.set("b", vec![2]).await.unwrap();
        remote.set("b", vec![2]).await.unwrap();
        remote.set("c", vec![3]).await.unwrap();

        let engine = BlobEngine::new(local.clone(), vec![remote.clone()]);
        let report = engine.sync().await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.peers[0].uploaded, 1);
        assert_eq!(report.peers[0].downloaded, 1);

        for peer in [&local, &remote] {
            let mut keys = peer.list().await.unwrap();
            keys.sort();
            assert_eq!(
                keys,
                vec!["a".to_string(), "b".to_string(), "c".to_string()]
            );
        }
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let local = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("local"))));
        let remote = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("remote"))));
        local.set("a", vec![1]).await.unwrap();
        remote.set("b", vec![2]).await.unwrap();

        let engine = BlobEngine::new(local, vec![remote]);
        let first = engine.sync().await.unwrap();
        assert_eq!(first.total_transferred(), 2);

        let second = engine.sync().await.unwrap();
        assert_eq!(second.total_transferred(), 0);
        assert!(second.is_clean());
    }

    #[tokio::test]
    async fn test_sync_isolates_unreachable_peer() {
        let local = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("local"))));
        local.set("a", vec![1]).await.unwrap();

        let broken_store = Arc::new(FlakyStore::new("peer-b"));
        broken_store.set_broken(true);
        let peer_b = Arc::new(BlobPeer::new(broken_store));
        let peer_c = Arc::new(BlobPeer::new(Arc::new(MemoryBlobStore::new("peer-c"))));

        let engine = BlobEngine::new(local, vec![peer_b, peer_c.clone()]);
        let report = engine.sync().await.unwrap();

        // B was skipped, C still reconciled fully.
        assert!(!report.is_clean());
        assert!(!report.peers[0].reachable);
        assert!(report.peers[1].reachable);
        assert_eq!(report.peers[1].uploaded, 1);
        assert_eq!(peer_c.get("a").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_delete_is_noop() {
        let (engine, _) = engine_with_remotes(1);
        engine.set("k", vec![1]).await.unwrap();
        engine.join_background().await;
        engine.delete("k").await.unwrap();
        assert_eq!(engine.get("k").await.unwrap(), Some(vec![1]));
    }
}
