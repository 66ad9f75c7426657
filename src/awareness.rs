//! Ephemeral presence ("awareness") state shared between clients.
//!
//! Each client publishes a [`PresenceState`] keyed by its numeric client
//! id, with a per-client clock so stale updates lose. Nothing here is
//! persisted — presence is lost on disconnect, and removal of the local
//! client must reach the server before the socket closes (the transport
//! gates teardown on the server's ack).
//!
//! Update blobs are bincode-encoded entry lists; `state: None` is a
//! removal tombstone. Change events carry an [`Origin`] tag so
//! server-applied updates are never echoed back.

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::doc::Origin;

/// Presence payload for one client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresenceState {
    /// Display name shown next to the cursor.
    pub user_name: Option<String>,
    /// Cursor position in document coordinates.
    pub cursor: Option<(f32, f32)>,
    /// Selected block ids (empty = no selection).
    pub selection: Vec<Uuid>,
}

/// One entry of an awareness update blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireEntry {
    client_id: u64,
    clock: u64,
    /// `None` removes the client.
    state: Option<PresenceState>,
}

/// Which client ids an applied update touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessChanges {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All touched client ids, for encoding the relayed update.
    pub fn changed_clients(&self) -> Vec<u64> {
        let mut all = Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        all.extend_from_slice(&self.added);
        all.extend_from_slice(&self.updated);
        all.extend_from_slice(&self.removed);
        all
    }
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct AwarenessEvent {
    pub changes: AwarenessChanges,
    pub origin: Origin,
}

/// Awareness errors.
#[derive(Debug, Clone)]
pub enum AwarenessError {
    DecodeError(String),
}

impl std::fmt::Display for AwarenessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AwarenessError::DecodeError(e) => write!(f, "Awareness decode error: {e}"),
        }
    }
}

impl std::error::Error for AwarenessError {}

struct ClientEntry {
    clock: u64,
    state: Option<PresenceState>,
}

/// Per-connection awareness map.
pub struct Awareness {
    client_id: u64,
    entries: HashMap<u64, ClientEntry>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<AwarenessEvent>>,
    next_subscription: u64,
}

/// Derive a fresh numeric client id.
pub fn random_client_id() -> u64 {
    Uuid::new_v4().as_u128() as u64
}

impl Awareness {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            entries: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscription: 0,
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Publish the local client's presence state.
    pub fn set_local_state(&mut self, state: PresenceState) {
        let entry = self.entries.entry(self.client_id).or_insert(ClientEntry {
            clock: 0,
            state: None,
        });
        entry.clock += 1;
        let had_state = entry.state.is_some();
        entry.state = Some(state);

        let mut changes = AwarenessChanges::default();
        if had_state {
            changes.updated.push(self.client_id);
        } else {
            changes.added.push(self.client_id);
        }
        self.emit(changes, Origin::Local);
    }

    /// Remove the local client's presence, notifying subscribers.
    ///
    /// Called on disconnect; always emits the removal so the transport can
    /// flush the leave to the server even if no state was ever published.
    pub fn destroy(&mut self) {
        let entry = self.entries.entry(self.client_id).or_insert(ClientEntry {
            clock: 0,
            state: None,
        });
        entry.clock += 1;
        entry.state = None;

        let changes = AwarenessChanges {
            removed: vec![self.client_id],
            ..AwarenessChanges::default()
        };
        self.emit(changes, Origin::Local);
    }

    /// Encode the entries for `client_ids` as an update blob.
    ///
    /// Unknown ids are skipped; removal tombstones are included.
    pub fn encode_update(&self, client_ids: &[u64]) -> Vec<u8> {
        let entries: Vec<WireEntry> = client_ids
            .iter()
            .filter_map(|id| {
                self.entries.get(id).map(|e| WireEntry {
                    client_id: *id,
                    clock: e.clock,
                    state: e.state.clone(),
                })
            })
            .collect();
        bincode::serde::encode_to_vec(&entries, bincode::config::standard()).unwrap_or_default()
    }

    /// Apply an update blob. Per client, the higher clock wins; at equal
    /// clocks a tombstone beats live state.
    pub fn apply_update(
        &mut self,
        update: &[u8],
        origin: Origin,
    ) -> Result<AwarenessChanges, AwarenessError> {
        let entries: Vec<WireEntry> = if update.is_empty() {
            Vec::new()
        } else {
            let (entries, _) =
                bincode::serde::decode_from_slice(update, bincode::config::standard())
                    .map_err(|e| AwarenessError::DecodeError(e.to_string()))?;
            entries
        };

        let mut changes = AwarenessChanges::default();
        for incoming in entries {
            let accept = match self.entries.get(&incoming.client_id) {
                Some(existing) => {
                    incoming.clock > existing.clock
                        || (incoming.clock == existing.clock && incoming.state.is_none())
                }
                None => true,
            };
            if !accept {
                continue;
            }

            let previous_live = self
                .entries
                .get(&incoming.client_id)
                .map(|e| e.state.is_some())
                .unwrap_or(false);

            match (&incoming.state, previous_live) {
                (Some(_), false) => changes.added.push(incoming.client_id),
                (Some(_), true) => changes.updated.push(incoming.client_id),
                (None, true) => changes.removed.push(incoming.client_id),
                // Tombstone for a client we never saw live: record the
                // clock, emit nothing.
                (None, false) => {}
            }

            self.entries.insert(
                incoming.client_id,
                ClientEntry {
                    clock: incoming.clock,
                    state: incoming.state,
                },
            );
        }

        if !changes.is_empty() {
            self.emit(changes.clone(), origin);
        }
        Ok(changes)
    }

    /// All live presence states, keyed by client id.
    pub fn states(&self) -> HashMap<u64, PresenceState> {
        self.entries
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    /// The local client's live state, if published.
    pub fn local_state(&self) -> Option<PresenceState> {
        self.entries
            .get(&self.client_id)
            .and_then(|e| e.state.clone())
    }

    pub fn subscribe(&mut self, tx: mpsc::UnboundedSender<AwarenessEvent>) -> u64 {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscribers.insert(id, tx);
        id
    }

    pub fn unsubscribe(&mut self, id: u64) {
        self.subscribers.remove(&id);
    }

    fn emit(&mut self, changes: AwarenessChanges, origin: Origin) {
        let event = AwarenessEvent { changes, origin };
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor_state(x: f32, y: f32) -> PresenceState {
        PresenceState {
            user_name: Some("Alice".to_string()),
            cursor: Some((x, y)),
            selection: Vec::new(),
        }
    }

    #[test]
    fn test_set_local_state_emits_added_then_updated() {
        let mut awareness = Awareness::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        awareness.subscribe(tx);

        awareness.set_local_state(cursor_state(1.0, 2.0));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.changes.added, vec![1]);
        assert_eq!(event.origin, Origin::Local);

        awareness.set_local_state(cursor_state(3.0, 4.0));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.changes.updated, vec![1]);
    }

    #[test]
    fn test_roundtrip_between_peers() {
        let mut alice = Awareness::new(1);
        let mut bob = Awareness::new(2);

        alice.set_local_state(cursor_state(10.0, 20.0));
        let update = alice.encode_update(&[1]);

        let changes = bob.apply_update(&update, Origin::Remote).unwrap();
        assert_eq!(changes.added, vec![1]);
        assert_eq!(bob.states().len(), 1);
        assert_eq!(bob.states()[&1].cursor, Some((10.0, 20.0)));
    }

    #[test]
    fn test_stale_clock_loses() {
        let mut alice = Awareness::new(1);
        let mut bob = Awareness::new(2);

        alice.set_local_state(cursor_state(1.0, 1.0));
        let old = alice.encode_update(&[1]);
        alice.set_local_state(cursor_state(2.0, 2.0));
        let new = alice.encode_update(&[1]);

        bob.apply_update(&new, Origin::Remote).unwrap();
        let changes = bob.apply_update(&old, Origin::Remote).unwrap();
        assert!(changes.is_empty());
        assert_eq!(bob.states()[&1].cursor, Some((2.0, 2.0)));
    }

    #[test]
    fn test_destroy_emits_removal_and_tombstone_propagates() {
        let mut alice = Awareness::new(1);
        let mut bob = Awareness::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        alice.subscribe(tx);

        alice.set_local_state(cursor_state(0.0, 0.0));
        bob.apply_update(&alice.encode_update(&[1]), Origin::Remote)
            .unwrap();
        let _ = rx.try_recv();

        alice.destroy();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.changes.removed, vec![1]);
        assert_eq!(event.origin, Origin::Local);
        assert!(alice.local_state().is_none());

        let changes = bob
            .apply_update(&alice.encode_update(&[1]), Origin::Remote)
            .unwrap();
        assert_eq!(changes.removed, vec![1]);
        assert!(bob.states().is_empty());
    }

    #[test]
    fn test_destroy_without_state_still_emits() {
        let mut awareness = Awareness::new(7);
        let (tx, mut rx) = mpsc::unbounded_channel();
        awareness.subscribe(tx);

        awareness.destroy();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.changes.removed, vec![7]);
    }

    #[test]
    fn test_unknown_tombstone_is_silent() {
        let mut alice = Awareness::new(1);
        let mut bob = Awareness::new(2);
        alice.destroy();

        let changes = bob
            .apply_update(&alice.encode_update(&[1]), Origin::Remote)
            .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_encode_skips_unknown_ids() {
        let awareness = Awareness::new(1);
        let update = awareness.encode_update(&[42, 43]);
        let mut other = Awareness::new(2);
        let changes = other.apply_update(&update, Origin::Remote).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_bad_update_rejected() {
        let mut awareness = Awareness::new(1);
        assert!(awareness.apply_update(&[0xFF, 0x02], Origin::Remote).is_err());
    }
}
