use std::time::Duration;

use crate::ProtocolError;

/// Largest fragment a sender will emit (1 MiB).
pub const MAX_FRAGMENT_SIZE: usize = 1024 * 1024;

/// Upper bound on messages a sender keeps queued on a link.
///
/// Each pacing tick only tops the outbound queue up to this level, so a
/// large file never floods the transport.
pub const OUTBOUND_QUEUE_BUDGET: usize = 1000;

/// How often a sender enqueues a new batch of fragments.
pub const SEND_INTERVAL: Duration = Duration::from_millis(100);

/// Identity string clients present when they connect.
pub const DEFAULT_IDENTIFIER: &str = "AssetCacheClient";

/// Port the cache server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 20;

/// Message type tags.
///
/// Values start at 100 and follow declaration order; both peers must agree
/// on the numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    RequestDownload = 100,
    RequestUpload = 101,
    UploadFailedError = 102,
    ConnectionAccepted = 103,
    DownloadRequestRejectUnavailable = 104,
    DownloadFailedError = 105,
    UploadRequestAccept = 106,
    UploadRequestRejectFileExists = 107,
    UploadComplete = 108,
    FileTransferStart = 109,
    FileTransferFragment = 110,
}

impl MessageType {
    /// Integer tag written on the wire.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether messages of this type carry a file name payload.
    pub fn carries_name(self) -> bool {
        matches!(
            self,
            Self::RequestDownload
                | Self::RequestUpload
                | Self::DownloadRequestRejectUnavailable
                | Self::UploadRequestAccept
                | Self::UploadRequestRejectFileExists
        )
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            100 => Self::RequestDownload,
            101 => Self::RequestUpload,
            102 => Self::UploadFailedError,
            103 => Self::ConnectionAccepted,
            104 => Self::DownloadRequestRejectUnavailable,
            105 => Self::DownloadFailedError,
            106 => Self::UploadRequestAccept,
            107 => Self::UploadRequestRejectFileExists,
            108 => Self::UploadComplete,
            109 => Self::FileTransferStart,
            110 => Self::FileTransferFragment,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RequestDownload => "request_download",
            Self::RequestUpload => "request_upload",
            Self::UploadFailedError => "upload_failed_error",
            Self::ConnectionAccepted => "connection_accepted",
            Self::DownloadRequestRejectUnavailable => "download_request_reject_unavailable",
            Self::DownloadFailedError => "download_failed_error",
            Self::UploadRequestAccept => "upload_request_accept",
            Self::UploadRequestRejectFileExists => "upload_request_reject_file_exists",
            Self::UploadComplete => "upload_complete",
            Self::FileTransferStart => "file_transfer_start",
            Self::FileTransferFragment => "file_transfer_fragment",
        };
        f.write_str(name)
    }
}
