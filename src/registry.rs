//! Document registry: the tree of documents and subdocuments for one
//! workspace connection, plus the cache of updates that arrived before
//! their document did.
//!
//! Ownership flows strictly parent → child: registering a document
//! registers its currently loaded subdocuments recursively, and
//! unregistering tears the whole subtree down. A document registers
//! exactly once — re-registering a known guid is a no-op.
//!
//! Registration drains any cached updates for that guid immediately
//! (in arrival order). The transport keeps a low-frequency timer calling
//! [`DocRegistry::drain_ready`] as a safety net while the cache is
//! non-empty.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::doc::{CrdtDoc, DocEvent, Origin, SubscriptionId};

struct Registration {
    doc: Arc<dyn CrdtDoc>,
    subscription: SubscriptionId,
}

/// Pending updates for documents that have not registered yet.
///
/// Entries are created lazily and removed as soon as they drain empty; the
/// cache is not authoritative state, just a holding pen.
#[derive(Default)]
pub struct UpdateCache {
    entries: HashMap<Uuid, Vec<Vec<u8>>>,
}

impl UpdateCache {
    pub fn buffer(&mut self, guid: Uuid, update: Vec<u8>) {
        self.entries.entry(guid).or_default().push(update);
    }

    pub fn take(&mut self, guid: Uuid) -> Vec<Vec<u8>> {
        self.entries.remove(&guid).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.entries.values().map(|v| v.len()).sum()
    }
}

/// Per-connection registry of live documents.
pub struct DocRegistry {
    docs: HashMap<Uuid, Registration>,
    cache: UpdateCache,
    /// Change listeners for every registered doc feed this one channel.
    events_tx: mpsc::UnboundedSender<DocEvent>,
}

impl DocRegistry {
    /// Create a registry and the stream of document events it produces.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DocEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                docs: HashMap::new(),
                cache: UpdateCache::default(),
                events_tx,
            },
            events_rx,
        )
    }

    /// Register a document and its loaded subdocuments, recursively.
    ///
    /// Buffered updates for each newly registered guid are applied in
    /// arrival order with `Origin::Remote` and the cache entry is removed.
    pub fn register(&mut self, doc: Arc<dyn CrdtDoc>) {
        let guid = doc.guid();
        if self.docs.contains_key(&guid) {
            return;
        }
        let subscription = doc.subscribe(self.events_tx.clone());
        self.docs.insert(guid, Registration { doc: doc.clone(), subscription });
        log::debug!("Registered doc {guid}");

        self.drain_for(guid);

        for subdoc in doc.subdocs() {
            self.register(subdoc);
        }
    }

    /// Unregister a document subtree, detaching all listeners.
    pub fn unregister(&mut self, guid: Uuid) {
        let registration = match self.docs.remove(&guid) {
            Some(r) => r,
            None => return,
        };
        registration.doc.unsubscribe(registration.subscription);
        log::debug!("Unregistered doc {guid}");
        for subdoc in registration.doc.subdocs() {
            self.unregister(subdoc.guid());
        }
    }

    pub fn get(&self, guid: Uuid) -> Option<Arc<dyn CrdtDoc>> {
        self.docs.get(&guid).map(|r| r.doc.clone())
    }

    pub fn contains(&self, guid: Uuid) -> bool {
        self.docs.contains_key(&guid)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Buffer an update for a not-yet-registered document.
    pub fn buffer(&mut self, guid: Uuid, update: Vec<u8>) {
        log::debug!("Buffering update for unregistered doc {guid}");
        self.cache.buffer(guid, update);
    }

    /// Whether any buffered updates remain.
    pub fn has_pending(&self) -> bool {
        !self.cache.is_empty()
    }

    /// Apply buffered updates for every meanwhile-registered document.
    ///
    /// Safety-net counterpart of the drain performed at registration time.
    /// Returns the number of updates applied.
    pub fn drain_ready(&mut self) -> usize {
        let ready: Vec<Uuid> = self
            .cache
            .entries
            .keys()
            .copied()
            .filter(|guid| self.docs.contains_key(guid))
            .collect();
        let mut applied = 0;
        for guid in ready {
            applied += self.drain_for(guid);
        }
        applied
    }

    fn drain_for(&mut self, guid: Uuid) -> usize {
        let updates = self.cache.take(guid);
        if updates.is_empty() {
            return 0;
        }
        let doc = match self.docs.get(&guid) {
            Some(r) => r.doc.clone(),
            None => return 0,
        };
        let count = updates.len();
        for update in updates {
            if let Err(e) = doc.apply_update(&update, Origin::Remote) {
                log::warn!("Dropping undecodable cached update for doc {guid}: {e}");
            }
        }
        log::debug!("Drained {count} cached updates into doc {guid}");
        count
    }
}
