use std::path::{Path, PathBuf};

use assetcache_protocol::{Message, MessageType};
use assetcache_transport::ConnectionId;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::fragment::FragmentWriter;
use crate::progress::TransferTimer;

/// Lifecycle of an inbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Receiving,
    Completed,
    Failed,
}

/// Suffix of a file that is still being received.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Staging location for an incoming file: the hidden sibling `.<name>.part`.
pub fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}{PARTIAL_SUFFIX}"))
}

/// Whether a bare file name is a staging name produced by [`partial_path`].
pub fn is_partial_name(name: &str) -> bool {
    name.len() > 1 + PARTIAL_SUFFIX.len()
        && name.starts_with('.')
        && name.ends_with(PARTIAL_SUFFIX)
}

/// Reassembles one incoming file from fragment messages.
///
/// Fragments are written to a staging file next to the destination and
/// renamed into place once the file is complete, so the final path never
/// holds a truncated artifact. If the receiver fails or is dropped early,
/// the staging file is deleted.
pub struct FileReceiver {
    file_name: String,
    owner: ConnectionId,
    file_size: u64,
    writer: Option<FragmentWriter>,
    path: PathBuf,
    staging: PathBuf,
    state: ReceiverState,
    timer: TransferTimer,
}

impl FileReceiver {
    /// Opens the staging file for `path` to receive `num_fragments`
    /// fragments from `owner`.
    pub fn create(
        file_name: impl Into<String>,
        path: impl Into<PathBuf>,
        file_size: u64,
        num_fragments: u32,
        owner: ConnectionId,
    ) -> Result<Self, TransferError> {
        let path = path.into();
        let staging = partial_path(&path);
        let writer = FragmentWriter::create(&staging, num_fragments)?;
        let file_name = file_name.into();
        debug!(file = %file_name, size = file_size, fragments = num_fragments, "receiving file");
        Ok(Self {
            file_name,
            owner,
            file_size,
            writer: Some(writer),
            path,
            staging,
            state: ReceiverState::Receiving,
            timer: TransferTimer::start(),
        })
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Final destination, populated once the transfer completes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where fragments are written while the transfer is in progress.
    pub fn staging_path(&self) -> &Path {
        &self.staging
    }

    pub fn owner(&self) -> ConnectionId {
        self.owner
    }

    /// Index of the next fragment to be written.
    pub fn next_index(&self) -> u32 {
        self.writer.as_ref().map_or(0, |w| w.next_index())
    }

    pub fn bytes_received(&self) -> u64 {
        self.writer.as_ref().map_or(0, |w| w.bytes_written())
    }

    /// Feeds one inbound message. Messages from other connections are ignored.
    pub fn handle_message(&mut self, from: ConnectionId, msg: &Message) {
        if from != self.owner || self.state != ReceiverState::Receiving {
            return;
        }

        match msg.msg_type {
            MessageType::FileTransferFragment => {
                let result = msg
                    .parse_fragment()
                    .map_err(TransferError::from)
                    .and_then(|f| match self.writer.as_mut() {
                        Some(w) => w.write_fragment(f.fragment_id, f.data),
                        None => Ok(()),
                    });
                if let Err(e) = result {
                    self.fail(&e.to_string());
                }
            }
            MessageType::FileTransferStart => {}
            other => debug!(file = %self.file_name, msg = %other, "receiver ignoring message"),
        }
    }

    /// Checks for completion and returns the current state.
    pub fn update(&mut self) -> ReceiverState {
        if self.state != ReceiverState::Receiving {
            return self.state;
        }
        let Some(writer) = self.writer.as_mut() else {
            return self.state;
        };
        if !writer.is_complete() {
            return self.state;
        }

        let received = writer.bytes_written();
        if received != self.file_size {
            let e = TransferError::SizeMismatch {
                expected: self.file_size,
                received,
            };
            self.fail(&e.to_string());
            return self.state;
        }

        if let Err(e) = writer.finish() {
            self.fail(&e.to_string());
            return self.state;
        }
        if let Err(e) = std::fs::rename(&self.staging, &self.path) {
            self.fail(&format!("cannot move into place: {e}"));
            return self.state;
        }

        self.writer = None;
        self.state = ReceiverState::Completed;
        info!(file = %self.file_name, "file received: {}", self.timer.summary(received));
        self.state
    }

    fn fail(&mut self, reason: &str) {
        warn!(file = %self.file_name, "receive failed: {reason}");
        if let Some(mut writer) = self.writer.take() {
            writer.discard();
        }
        self.state = ReceiverState::Failed;
    }
}

impl Drop for FileReceiver {
    fn drop(&mut self) {
        if self.state != ReceiverState::Receiving {
            return;
        }
        // The last fragment may have landed in the same tick.
        if self.update() == ReceiverState::Receiving {
            warn!(
                file = %self.file_name,
                next = self.next_index(),
                "transfer abandoned, removing partial file"
            );
            if let Some(mut writer) = self.writer.take() {
                writer.discard();
            }
            self.state = ReceiverState::Failed;
        }
    }
}
