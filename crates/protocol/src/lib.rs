//! Wire protocol types for the asset cache.
//!
//! Every message carries an integer [`MessageType`] tag and an opaque
//! payload. Payload shapes are defined in [`messages`]; the on-disk cache
//! naming scheme lives in [`cache_key`].

pub mod cache_key;
pub mod constants;
pub mod envelope;
pub mod messages;

pub use cache_key::CacheKey;
pub use constants::MessageType;
pub use envelope::Message;
pub use messages::{FileFragment, FileTransferStart};

/// Errors produced while decoding protocol payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in payload: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("fragment too short (need at least 4 bytes)")]
    FragmentTooShort,

    #[error("fragment header truncated: expected {expected} bytes, got {got}")]
    FragmentHeaderTruncated { expected: usize, got: usize },
}
