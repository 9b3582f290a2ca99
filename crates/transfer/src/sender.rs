use std::path::{Path, PathBuf};
use std::time::Duration;

use assetcache_protocol::constants::{MAX_FRAGMENT_SIZE, OUTBOUND_QUEUE_BUDGET, SEND_INTERVAL};
use assetcache_protocol::{FileTransferStart, Message};
use assetcache_transport::Link;
use tracing::{debug, info, warn};

use crate::fragment::FragmentReader;
use crate::progress::TransferTimer;

/// Lifecycle of an outbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Starting,
    Sending,
    Sent,
    Failed,
}

/// Streams one file over a link.
///
/// The first tick opens the file and announces it with
/// `FILE_TRANSFER_START`. Afterwards, every [`SEND_INTERVAL`] the sender
/// tops the link's outbound queue up to [`OUTBOUND_QUEUE_BUDGET`] messages
/// with fragments until the whole file has been queued.
pub struct FileSender {
    path: PathBuf,
    file_name: String,
    link: Link,
    state: SenderState,
    max_fragment_size: usize,
    reader: Option<FragmentReader>,
    since_last_batch: Duration,
    timer: Option<TransferTimer>,
    file_size: u64,
    bytes_sent: u64,
}

impl FileSender {
    /// Prepares to send `path`, announced to the peer as `file_name`.
    pub fn new(path: impl Into<PathBuf>, file_name: impl Into<String>, link: Link) -> Self {
        Self {
            path: path.into(),
            file_name: file_name.into(),
            link,
            state: SenderState::Starting,
            max_fragment_size: MAX_FRAGMENT_SIZE,
            reader: None,
            // The first batch goes out on the first SENDING tick.
            since_last_batch: SEND_INTERVAL,
            timer: None,
            file_size: 0,
            bytes_sent: 0,
        }
    }

    /// Overrides the maximum fragment size.
    pub fn with_max_fragment_size(mut self, size: usize) -> Self {
        self.max_fragment_size = size.max(1);
        self
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Advances the transfer by `elapsed` and returns the new state.
    pub fn tick(&mut self, elapsed: Duration) -> SenderState {
        if matches!(self.state, SenderState::Starting | SenderState::Sending)
            && !self.link.is_connected()
        {
            self.fail("connection lost");
            return self.state;
        }

        match self.state {
            SenderState::Starting => {
                if self.start_send() {
                    self.state = SenderState::Sending;
                } else {
                    self.state = SenderState::Failed;
                }
            }
            SenderState::Sending => {
                self.since_last_batch += elapsed;
                if self.since_last_batch >= SEND_INTERVAL {
                    self.since_last_batch = Duration::ZERO;
                    self.send_batch();
                }
            }
            SenderState::Sent | SenderState::Failed => {}
        }
        self.state
    }

    /// Opens the file and announces it. Returns `false` if nothing was sent.
    fn start_send(&mut self) -> bool {
        let reader = match FragmentReader::open(&self.path, self.max_fragment_size) {
            Ok(r) => r,
            Err(e) => {
                warn!(file = %self.file_name, path = %self.path.display(), "cannot send file: {e}");
                return false;
            }
        };

        let start = FileTransferStart {
            file_name: self.file_name.clone(),
            file_size: reader.file_size(),
            num_fragments: reader.fragment_count(),
        };
        let msg = match Message::transfer_start(&start) {
            Ok(m) => m,
            Err(e) => {
                warn!(file = %self.file_name, "failed to encode transfer start: {e}");
                return false;
            }
        };
        if self.link.send(msg).is_err() {
            warn!(file = %self.file_name, "failed to queue transfer start");
            return false;
        }

        debug!(
            file = %self.file_name,
            size = start.file_size,
            fragments = start.num_fragments,
            "transfer started"
        );
        self.file_size = reader.file_size();
        self.reader = Some(reader);
        self.timer = Some(TransferTimer::start());
        true
    }

    fn send_batch(&mut self) {
        let room = OUTBOUND_QUEUE_BUDGET.saturating_sub(self.link.outbound_pending());

        for _ in 0..room {
            let Some(reader) = self.reader.as_mut() else {
                return;
            };
            let fragment = match reader.next_fragment() {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(e) => {
                    self.fail(&e.to_string());
                    return;
                }
            };

            let len = fragment.data.len() as u64;
            let msg = match Message::fragment(&fragment) {
                Ok(m) => m,
                Err(e) => {
                    self.fail(&e.to_string());
                    return;
                }
            };
            if self.link.send(msg).is_err() {
                self.fail("outbound queue rejected fragment");
                return;
            }
            self.bytes_sent += len;
        }

        if self.bytes_sent == self.file_size {
            self.reader = None;
            self.state = SenderState::Sent;
            let summary = self.timer.map(|t| t.summary(self.bytes_sent));
            if let Some(summary) = summary {
                info!(file = %self.file_name, "file sent: {summary}");
            }
        }
    }

    fn fail(&mut self, reason: &str) {
        warn!(file = %self.file_name, sent = self.bytes_sent, "send failed: {reason}");
        self.reader = None;
        self.state = SenderState::Failed;
    }
}
