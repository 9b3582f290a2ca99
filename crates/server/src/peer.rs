//! Server-side state for one connected client.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use assetcache_protocol::{FileTransferStart, Message, MessageType};
use assetcache_transfer::{
    FileReceiver, FileSender, ReceiverState, SenderState, partial_path, validate_cache_name,
};
use assetcache_transport::{ConnectionId, Link};
use filetime::{FileTime, set_file_mtime};
use tracing::{debug, info, warn};

use crate::quota::ensure_available_space;

/// One accepted client.
///
/// Holds at most one outbound transfer (a download being served) and one
/// inbound transfer (an upload being stored); both may run at once.
pub struct ServerPeer {
    link: Link,
    cache_dir: PathBuf,
    quota_bytes: u64,
    sender: Option<FileSender>,
    receiver: Option<FileReceiver>,
    accepted_upload: Option<String>,
}

impl ServerPeer {
    pub fn new(link: Link, cache_dir: impl Into<PathBuf>, quota_bytes: u64) -> Self {
        Self {
            link,
            cache_dir: cache_dir.into(),
            quota_bytes,
            sender: None,
            receiver: None,
            accepted_upload: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.link.id()
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Active download being served, if any.
    pub fn sender(&self) -> Option<&FileSender> {
        self.sender.as_ref()
    }

    /// Active upload being stored, if any.
    pub fn receiver(&self) -> Option<&FileReceiver> {
        self.receiver.as_ref()
    }

    /// Routes one message from this client.
    pub fn handle_message(&mut self, msg: Message) {
        match msg.msg_type {
            MessageType::RequestDownload => match msg.name() {
                Ok(name) => self.on_request_download(&name),
                Err(e) => warn!(peer = %self.id(), "bad download request: {e}"),
            },
            MessageType::RequestUpload => match msg.name() {
                Ok(name) => self.on_request_upload(&name),
                Err(e) => warn!(peer = %self.id(), "bad upload request: {e}"),
            },
            MessageType::FileTransferStart => match msg.parse_transfer_start() {
                Ok(start) => self.on_transfer_start(start),
                Err(e) => {
                    warn!(peer = %self.id(), "bad transfer start: {e}");
                    self.reply(Message::empty(MessageType::UploadFailedError));
                }
            },
            MessageType::FileTransferFragment => {
                let id = self.id();
                if let Some(receiver) = self.receiver.as_mut() {
                    receiver.handle_message(id, &msg);
                }
            }
            MessageType::UploadFailedError => self.on_client_upload_failed(),
            other => warn!(peer = %self.id(), msg = %other, "unexpected message from client"),
        }
    }

    /// Advances the active transfers.
    pub fn tick(&mut self, elapsed: Duration) {
        let id = self.id();
        if let Some(receiver) = self.receiver.as_mut() {
            match receiver.update() {
                ReceiverState::Completed => {
                    info!(peer = %id, file = %receiver.file_name(), "upload stored");
                    self.receiver = None;
                    self.reply(Message::empty(MessageType::UploadComplete));
                }
                ReceiverState::Failed => {
                    self.receiver = None;
                }
                ReceiverState::Receiving => {}
            }
        }

        if let Some(sender) = self.sender.as_mut() {
            match sender.tick(elapsed) {
                SenderState::Sent => {
                    self.sender = None;
                }
                SenderState::Failed => {
                    self.sender = None;
                    self.reply(Message::empty(MessageType::DownloadFailedError));
                }
                SenderState::Starting | SenderState::Sending => {}
            }
        }
    }

    fn on_request_download(&mut self, name: &str) {
        let path = match self.cache_path(name) {
            Some(p) => p,
            None => {
                self.reply(Message::with_name(
                    MessageType::DownloadRequestRejectUnavailable,
                    name,
                ));
                return;
            }
        };

        let available = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => true,
            Ok(meta) if meta.is_file() => {
                debug!(file = %name, "removing zero-length cache entry");
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(file = %name, "failed to remove zero-length entry: {e}");
                }
                false
            }
            Ok(_) => false,
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!(file = %name, "cannot stat cache entry: {e}");
                }
                false
            }
        };

        if !available {
            debug!(peer = %self.id(), file = %name, "download miss");
            self.reply(Message::with_name(
                MessageType::DownloadRequestRejectUnavailable,
                name,
            ));
            return;
        }

        // Refresh mtime so eviction treats this entry as recently used.
        if let Err(e) = set_file_mtime(&path, FileTime::now()) {
            warn!(file = %name, "failed to touch cache entry: {e}");
        }

        if let Some(previous) = self.sender.take() {
            warn!(peer = %self.id(), file = %previous.file_name(), "replacing active download");
        }
        debug!(peer = %self.id(), file = %name, "download hit");
        self.sender = Some(FileSender::new(path, name, self.link.clone()));
    }

    fn on_request_upload(&mut self, name: &str) {
        let Some(path) = self.cache_path(name) else {
            self.reply(Message::empty(MessageType::UploadFailedError));
            return;
        };

        if path.exists() {
            debug!(peer = %self.id(), file = %name, "upload skipped, already cached");
            self.reply(Message::with_name(
                MessageType::UploadRequestRejectFileExists,
                name,
            ));
            return;
        }
        if partial_path(&path).exists() {
            debug!(peer = %self.id(), file = %name, "upload refused, another upload in progress");
            self.reply(Message::empty(MessageType::UploadFailedError));
            return;
        }

        self.accepted_upload = Some(name.to_string());
        self.reply(Message::with_name(MessageType::UploadRequestAccept, name));
    }

    fn on_transfer_start(&mut self, start: FileTransferStart) {
        if self.accepted_upload.as_deref() != Some(start.file_name.as_str()) {
            warn!(peer = %self.id(), file = %start.file_name, "transfer start without accepted upload");
            self.reply(Message::empty(MessageType::UploadFailedError));
            return;
        }
        self.accepted_upload = None;

        let Some(path) = self.cache_path(&start.file_name) else {
            self.reply(Message::empty(MessageType::UploadFailedError));
            return;
        };
        if path.exists() || partial_path(&path).exists() {
            // Another client stored or began storing it since the request was accepted.
            warn!(peer = %self.id(), file = %start.file_name, "upload target appeared, refusing");
            self.reply(Message::empty(MessageType::UploadFailedError));
            return;
        }

        match ensure_available_space(&self.cache_dir, start.file_size, self.quota_bytes) {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    peer = %self.id(),
                    file = %start.file_name,
                    size = start.file_size,
                    "no room for upload"
                );
                self.reply(Message::empty(MessageType::UploadFailedError));
                return;
            }
            Err(e) => {
                warn!(peer = %self.id(), "quota check failed: {e}");
                self.reply(Message::empty(MessageType::UploadFailedError));
                return;
            }
        }

        match FileReceiver::create(
            start.file_name.as_str(),
            path,
            start.file_size,
            start.num_fragments,
            self.id(),
        ) {
            Ok(receiver) => {
                if self.receiver.replace(receiver).is_some() {
                    warn!(peer = %self.id(), "replaced active upload");
                }
            }
            Err(e) => {
                warn!(peer = %self.id(), file = %start.file_name, "cannot create upload target: {e}");
                self.reply(Message::empty(MessageType::UploadFailedError));
            }
        }
    }

    fn on_client_upload_failed(&mut self) {
        self.accepted_upload = None;
        if let Some(receiver) = self.receiver.take() {
            info!(peer = %self.id(), file = %receiver.file_name(), "client abandoned upload");
        }
    }

    /// Resolves a client-supplied name inside the cache directory.
    fn cache_path(&self, name: &str) -> Option<PathBuf> {
        match validate_cache_name(name) {
            Ok(()) => Some(self.cache_dir.join(name)),
            Err(e) => {
                warn!(peer = %self.id(), "rejecting file name: {e}");
                None
            }
        }
    }

    fn reply(&self, msg: Message) {
        let msg_type = msg.msg_type;
        if self.link.send(msg).is_err() {
            debug!(peer = %self.id(), msg = %msg_type, "reply dropped");
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}
