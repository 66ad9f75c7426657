//! # scribe-sync — Realtime workspace synchronization
//!
//! Keeps a workspace in sync across peers: CRDT document updates and
//! ephemeral presence over a persistent socket, plus multi-peer blob
//! replication for binary attachments.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐      frames        ┌─────────────┐
//! │ SyncConnection │ ◄────────────────► │ SyncServer  │
//! │ (per workspace)│   Binary Proto     │ (rooms)     │
//! └──────┬─────────┘                    └──────┬──────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌────────────────┐                   ┌─────────────┐
//! │ CrdtDoc tree   │                   │ CrdtDoc tree│
//! │ + Awareness    │                   │ (authority) │
//! └────────────────┘                   └─────────────┘
//!
//! ┌────────────────┐   set / get / sync   ┌──────────────┐
//! │   BlobEngine   │ ◄──────────────────► │ remote peers │
//! │ (local-first)  │                      │ (BlobStore)  │
//! └────────────────┘                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded [`Frame`])
//! - [`codec`] — Base64 text encoding for update payloads
//! - [`doc`] — The [`CrdtDoc`] capability the sync layer consumes
//! - [`registry`] — Per-connection document tree and update cache
//! - [`awareness`] — Ephemeral presence with per-client clocks
//! - [`transport`] — The per-workspace sync connection state machine
//! - [`server`] — Reference relay server (in-process and websocket)
//! - [`blob`] — Local-first blob replication across storage peers
//!
//! The CRDT algorithm itself is out of scope: documents are consumed
//! through [`CrdtDoc`], whose merge must be commutative and idempotent.
//! [`MemoryDoc`] is the reference implementation used by the tests and
//! the relay server.

pub mod awareness;
pub mod blob;
pub mod codec;
pub mod doc;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;

// Re-exports for convenience
pub use awareness::{
    random_client_id, Awareness, AwarenessChanges, AwarenessError, AwarenessEvent, PresenceState,
};
pub use blob::{
    BlobEngine, BlobError, BlobPeer, BlobStore, MemoryBlobStore, PeerSyncReport, RocksBlobStore,
    RocksConfig, SyncReport,
};
pub use codec::{decode_update, encode_update, CodecError};
pub use doc::{CrdtDoc, DocError, DocEvent, MemoryDoc, Origin, SubscriptionId};
pub use protocol::{Frame, ProtocolError};
pub use registry::{DocRegistry, UpdateCache};
pub use server::{DocFactory, SyncServer};
pub use transport::{ws_frame_socket, ConnectionState, FrameSocket, SyncConnection};
