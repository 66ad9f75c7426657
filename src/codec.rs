//! Base64 update codec for transport frames.
//!
//! Document and awareness updates are opaque binary blobs; on the wire they
//! travel as base64 text inside the frame payloads. Encoding never fails;
//! decoding malformed text yields an error the transport logs and drops.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Payload is not valid base64.
    InvalidBase64(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::InvalidBase64(e) => write!(f, "Invalid base64 payload: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode a binary update as base64 text for a wire frame.
pub fn encode_update(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 text payload back into a binary update.
pub fn decode_update(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))
}
