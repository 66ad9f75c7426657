//! Wire protocol for workspace synchronization.
//!
//! Frames travel over a persistent message-oriented socket (bincode-encoded
//! over WebSocket binary messages, or directly over an in-process channel
//! socket in tests). Update payloads inside frames are base64 text produced
//! by [`crate::codec`].
//!
//! Client → server: `ClientHandshake`, `InitAwareness`, `ClientUpdate`,
//! `AwarenessUpdate`.
//! Server → client: `ServerHandshake`, `ServerUpdate`, `AwarenessAck`,
//! `ServerAwarenessBroadcast`, `NewClientAwarenessInit`.
//!
//! Document sync and awareness sync are independent streams: no sequence
//! numbers, frames may arrive in any relative order because the CRDT merge
//! is commutative and idempotent.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Client announces itself for a workspace (root document guid).
    ClientHandshake { workspace_id: Uuid },
    /// Client asks peers for their current awareness state.
    InitAwareness { workspace_id: Uuid },
    /// Server's initial state for one document of the workspace.
    ServerHandshake { guid: Uuid, update: String },
    /// Local document update pushed to the server.
    ClientUpdate {
        workspace_id: Uuid,
        guid: Uuid,
        update: String,
    },
    /// Remote document update relayed by the server.
    ServerUpdate { guid: Uuid, update: String },
    /// Local awareness change pushed to the server. Ack-returning.
    AwarenessUpdate {
        workspace_id: Uuid,
        awareness_update: String,
    },
    /// Server acknowledgment of an `AwarenessUpdate`.
    AwarenessAck { workspace_id: Uuid },
    /// Remote awareness change relayed by the server.
    ServerAwarenessBroadcast {
        workspace_id: Uuid,
        awareness_update: String,
    },
    /// Server asks this client to re-broadcast its full awareness state
    /// so a newly joined peer can bootstrap.
    NewClientAwarenessInit,
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
