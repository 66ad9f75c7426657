//! Blob peer: one store plus a cache of which keys it is known to hold.
//!
//! Every successful `get`, `set`, or `list` feeds the inventory. The
//! inventory is an optimization only — [`BlobPeer::has`] may return a
//! false negative (the store has the key but we never observed it), never
//! a false positive under correct usage, since keys are immutable and
//! nothing deletes them.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::store::{BlobError, BlobStore};

/// A single replication peer.
pub struct BlobPeer {
    store: Arc<dyn BlobStore>,
    inventory: RwLock<HashSet<String>>,
}

impl BlobPeer {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            inventory: RwLock::new(HashSet::new()),
        }
    }

    /// Name of the wrapped store, for logs.
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Fetch a blob, recording the key in the inventory on a hit.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobError> {
        let data = self.store.get(key).await?;
        if data.is_some() {
            self.inventory.write().await.insert(key.to_string());
        }
        Ok(data)
    }

    /// Pure inventory lookup — no I/O. A miss does not imply absence.
    pub async fn has(&self, key: &str) -> bool {
        self.inventory.read().await.contains(key)
    }

    /// Write a blob and record the key.
    pub async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), BlobError> {
        self.store.set(key, value).await?;
        self.inventory.write().await.insert(key.to_string());
        Ok(())
    }

    /// List the store's keys, folding them all into the inventory.
    pub async fn list(&self) -> Result<Vec<String>, BlobError> {
        let keys = self.store.list().await?;
        let mut inventory = self.inventory.write().await;
        for key in &keys {
            inventory.insert(key.clone());
        }
        Ok(keys)
    }

    /// Deletion is unsupported across the blob layer; this is a no-op.
    pub async fn delete(&self, _key: &str) -> Result<(), BlobError> {
        Ok(())
    }
}
