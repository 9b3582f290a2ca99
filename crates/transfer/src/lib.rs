//! Fragmented file transfer over a message link.
//!
//! A [`FileSender`] streams one file as a `FILE_TRANSFER_START` followed by
//! indexed fragments; a [`FileReceiver`] reassembles them, tolerating
//! out-of-order and duplicate arrivals. Both are driven by the owner's tick
//! loop and never block.

mod checksum;
mod fragment;
mod progress;
mod receiver;
mod sender;
mod validation;

pub use checksum::{cache_key_for_file, file_digest};
pub use fragment::{FragmentReader, FragmentWriter, fragment_layout};
pub use progress::{TransferSummary, TransferTimer};
pub use receiver::{FileReceiver, PARTIAL_SUFFIX, ReceiverState, is_partial_name, partial_path};
pub use sender::{FileSender, SenderState};
pub use validation::validate_cache_name;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] assetcache_protocol::ProtocolError),

    #[error("file is empty: {0}")]
    EmptyFile(String),

    #[error("short read at fragment {fragment_id}")]
    ShortRead { fragment_id: u32 },

    #[error("fragment {fragment_id} out of range (total {total})")]
    FragmentOutOfRange { fragment_id: u32, total: u32 },

    #[error("size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
