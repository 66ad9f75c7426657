//! Binary attachment replication.
//!
//! ```text
//! ┌────────────┐   get/set/list    ┌───────────┐     ┌────────────┐
//! │ BlobEngine │ ────────────────► │ BlobPeer  │ ──► │ BlobStore  │
//! │ (fan-out,  │                   │ (inventory│     │ (memory /  │
//! │  sync)     │                   │  cache)   │     │  RocksDB)  │
//! └────────────┘                   └───────────┘     └────────────┘
//! ```
//!
//! Keys are content addresses, so blob content never conflicts — the only
//! reconciliation problem is presence, solved by [`BlobEngine::sync`]'s
//! pairwise set differences.

pub mod engine;
pub mod peer;
pub mod store;

pub use engine::{BlobEngine, PeerSyncReport, SyncReport};
pub use peer::BlobPeer;
pub use store::{BlobError, BlobStore, MemoryBlobStore, RocksBlobStore, RocksConfig};
