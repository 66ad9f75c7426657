//! CRDT document capability.
//!
//! The synchronization layer never looks inside an update: the CRDT
//! algorithm is an external collaborator consumed through the [`CrdtDoc`]
//! trait — encode state as an update blob, apply an update blob, enumerate
//! subdocuments, and notify about changes. Change notifications are
//! delivered over tokio mpsc channels so a single dispatcher task can
//! `select!` over document, awareness, and socket events.
//!
//! Every `apply_update` carries an explicit [`Origin`] tag. The tag exists
//! purely to prevent echo: a `Remote`-origin update must never be re-sent
//! to the server.
//!
//! [`MemoryDoc`] is a minimal reference implementation (a grow-only set of
//! opaque ops, so merge is commutative and idempotent) used by the test
//! suites and the reference server. It is not a real collaborative text
//! CRDT and does not try to be one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Where an update came from.
///
/// `Remote` marks updates applied from server frames; `Initial` marks state
/// applied during local bootstrap (e.g. loading from disk). Neither may be
/// echoed back to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
    Initial,
}

/// Subscription handle returned by [`CrdtDoc::subscribe`].
pub type SubscriptionId = u64;

/// Change notifications emitted by a document.
#[derive(Clone)]
pub enum DocEvent {
    /// An update was applied to the document.
    Update {
        guid: Uuid,
        update: Vec<u8>,
        origin: Origin,
    },
    /// The document's subdocument set changed.
    Subdocs {
        guid: Uuid,
        added: Vec<Arc<dyn CrdtDoc>>,
        removed: Vec<Uuid>,
    },
    /// The document was destroyed.
    Destroyed { guid: Uuid },
}

impl std::fmt::Debug for DocEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocEvent::Update { guid, update, origin } => f
                .debug_struct("Update")
                .field("guid", guid)
                .field("bytes", &update.len())
                .field("origin", origin)
                .finish(),
            DocEvent::Subdocs { guid, added, removed } => f
                .debug_struct("Subdocs")
                .field("guid", guid)
                .field("added", &added.iter().map(|d| d.guid()).collect::<Vec<_>>())
                .field("removed", removed)
                .finish(),
            DocEvent::Destroyed { guid } => {
                f.debug_struct("Destroyed").field("guid", guid).finish()
            }
        }
    }
}

/// Document errors.
#[derive(Debug, Clone)]
pub enum DocError {
    /// Update blob could not be decoded.
    DecodeError(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::DecodeError(e) => write!(f, "Update decode error: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

/// The document capability consumed by the sync layer.
///
/// Implementations must guarantee that applying the same set of updates in
/// any order (with repeats) converges to the same state.
pub trait CrdtDoc: Send + Sync {
    /// Stable globally unique id of this document.
    fn guid(&self) -> Uuid;

    /// Encode local state as a single update blob.
    ///
    /// With `base`, encodes only the state missing from `base` (the diff a
    /// peer holding `base` needs to catch up).
    fn encode_state_as_update(&self, base: Option<&[u8]>) -> Result<Vec<u8>, DocError>;

    /// Apply an update blob, tagged with its origin.
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), DocError>;

    /// Currently loaded subdocuments.
    fn subdocs(&self) -> Vec<Arc<dyn CrdtDoc>>;

    /// Register a change listener. Events for this document only — the
    /// caller walks subdocuments itself.
    fn subscribe(&self, tx: mpsc::UnboundedSender<DocEvent>) -> SubscriptionId;

    /// Remove a previously registered listener.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Destroy the document, notifying listeners.
    fn destroy(&self);
}

// ───────────────────────────────────────────────────────────────────
// MemoryDoc — grow-only op-set reference implementation
// ───────────────────────────────────────────────────────────────────

struct MemoryDocInner {
    /// Op id → opaque payload. BTreeMap keeps encoding deterministic.
    ops: BTreeMap<Uuid, Vec<u8>>,
    subdocs: HashMap<Uuid, Arc<MemoryDoc>>,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<DocEvent>>,
    next_subscription: SubscriptionId,
}

/// In-memory reference document: a grow-only set of `(op id, payload)`
/// pairs. An update blob is the bincode encoding of the ops it carries;
/// merge is set union, so it is commutative and idempotent by construction.
pub struct MemoryDoc {
    guid: Uuid,
    inner: Mutex<MemoryDocInner>,
}

impl MemoryDoc {
    pub fn new() -> Arc<Self> {
        Self::with_guid(Uuid::new_v4())
    }

    pub fn with_guid(guid: Uuid) -> Arc<Self> {
        Arc::new(Self {
            guid,
            inner: Mutex::new(MemoryDocInner {
                ops: BTreeMap::new(),
                subdocs: HashMap::new(),
                subscribers: HashMap::new(),
                next_subscription: 0,
            }),
        })
    }

    /// Insert a locally authored op and notify listeners with a
    /// `Local`-origin update carrying just that op.
    pub fn insert(&self, payload: impl Into<Vec<u8>>) -> Uuid {
        let op_id = Uuid::new_v4();
        let payload = payload.into();
        let update = encode_ops(&[(op_id, payload.clone())]);
        let mut inner = self.inner.lock().unwrap();
        inner.ops.insert(op_id, payload);
        Self::emit(
            &mut inner,
            DocEvent::Update {
                guid: self.guid,
                update,
                origin: Origin::Local,
            },
        );
        op_id
    }

    /// Attach a subdocument and notify listeners. Adding the same guid
    /// twice is a no-op.
    pub fn add_subdoc(&self, doc: Arc<MemoryDoc>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.subdocs.contains_key(&doc.guid) {
            return;
        }
        inner.subdocs.insert(doc.guid, doc.clone());
        Self::emit(
            &mut inner,
            DocEvent::Subdocs {
                guid: self.guid,
                added: vec![doc as Arc<dyn CrdtDoc>],
                removed: Vec::new(),
            },
        );
    }

    /// Detach a subdocument and notify listeners.
    pub fn remove_subdoc(&self, guid: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if inner.subdocs.remove(&guid).is_none() {
            return;
        }
        Self::emit(
            &mut inner,
            DocEvent::Subdocs {
                guid: self.guid,
                added: Vec::new(),
                removed: vec![guid],
            },
        );
    }

    /// Number of ops currently held.
    pub fn op_count(&self) -> usize {
        self.inner.lock().unwrap().ops.len()
    }

    /// Whether a specific op is present.
    pub fn contains_op(&self, op_id: Uuid) -> bool {
        self.inner.lock().unwrap().ops.contains_key(&op_id)
    }

    /// Sorted op ids — equal fingerprints mean converged state.
    pub fn fingerprint(&self) -> Vec<Uuid> {
        self.inner.lock().unwrap().ops.keys().copied().collect()
    }

    fn emit(inner: &mut MemoryDocInner, event: DocEvent) {
        inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

fn encode_ops(ops: &[(Uuid, Vec<u8>)]) -> Vec<u8> {
    // Encoding a vec of pairs cannot fail.
    bincode::serde::encode_to_vec(ops, bincode::config::standard()).unwrap_or_default()
}

fn decode_ops(bytes: &[u8]) -> Result<Vec<(Uuid, Vec<u8>)>, DocError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    let (ops, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| DocError::DecodeError(e.to_string()))?;
    Ok(ops)
}

impl CrdtDoc for MemoryDoc {
    fn guid(&self) -> Uuid {
        self.guid
    }

    fn encode_state_as_update(&self, base: Option<&[u8]>) -> Result<Vec<u8>, DocError> {
        let base_ids: Vec<Uuid> = match base {
            Some(bytes) => decode_ops(bytes)?.into_iter().map(|(id, _)| id).collect(),
            None => Vec::new(),
        };
        let inner = self.inner.lock().unwrap();
        let ops: Vec<(Uuid, Vec<u8>)> = inner
            .ops
            .iter()
            .filter(|(id, _)| !base_ids.contains(id))
            .map(|(id, payload)| (*id, payload.clone()))
            .collect();
        Ok(encode_ops(&ops))
    }

    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), DocError> {
        let ops = decode_ops(update)?;
        let mut inner = self.inner.lock().unwrap();
        let mut fresh: Vec<(Uuid, Vec<u8>)> = Vec::new();
        for (id, payload) in ops {
            if !inner.ops.contains_key(&id) {
                inner.ops.insert(id, payload.clone());
                fresh.push((id, payload));
            }
        }
        // Idempotent: re-applying known ops emits nothing.
        if !fresh.is_empty() {
            let update = encode_ops(&fresh);
            Self::emit(
                &mut inner,
                DocEvent::Update {
                    guid: self.guid,
                    update,
                    origin,
                },
            );
        }
        Ok(())
    }

    fn subdocs(&self) -> Vec<Arc<dyn CrdtDoc>> {
        self.inner
            .lock()
            .unwrap()
            .subdocs
            .values()
            .map(|d| d.clone() as Arc<dyn CrdtDoc>)
            .collect()
    }

    fn subscribe(&self, tx: mpsc::UnboundedSender<DocEvent>) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.subscribers.insert(id, tx);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.lock().unwrap().subscribers.remove(&id);
    }

    fn destroy(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::emit(&mut inner, DocEvent::Destroyed { guid: self.guid });
        inner.subscribers.clear();
    }
}
