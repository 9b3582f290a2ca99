//! Cache client state machine.
//!
//! One request is in flight at a time; downloads are served before uploads.
//! The client is driven entirely by [`CacheClient::tick`], which drains
//! transport events, manages the connection and advances the active
//! transfer.

use std::collections::HashMap;
use std::time::Duration;

use assetcache_protocol::{CacheKey, Message, MessageType};
use assetcache_transfer::{FileReceiver, FileSender, ReceiverState, SenderState};
use assetcache_transport::{
    ConnectionId, Connector, EventReceiver, EventSender, Link, TransportEvent, event,
};
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::queue::PendingQueue;
use crate::types::{
    Completion, ConnectionStatus, Direction, Phase, RequestError, RequestResult, Resolution,
};

struct InFlight {
    direction: Direction,
    key: CacheKey,
}

/// Client for a remote asset cache server.
pub struct CacheClient {
    config: CacheConfig,
    connector: Box<dyn Connector>,
    events_tx: EventSender,
    events: EventReceiver,
    link: Option<Link>,
    status: ConnectionStatus,
    phase: Phase,
    downloads: PendingQueue,
    uploads: PendingQueue,
    in_flight: Option<InFlight>,
    receiver: Option<FileReceiver>,
    sender: Option<FileSender>,
    waiters: HashMap<(Direction, CacheKey), Vec<Completion>>,
    failed_attempts: u32,
    retry_in: Duration,
}

impl CacheClient {
    /// Creates an idle client. No connection is made until a request is
    /// queued.
    pub fn new(config: CacheConfig, connector: Box<dyn Connector>) -> Self {
        let (events_tx, events) = event::channel();
        Self {
            config,
            connector,
            events_tx,
            events,
            link: None,
            status: ConnectionStatus::NotConnected,
            phase: Phase::Idle,
            downloads: PendingQueue::new(),
            uploads: PendingQueue::new(),
            in_flight: None,
            receiver: None,
            sender: None,
            waiters: HashMap::new(),
            failed_attempts: 0,
            retry_in: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn pending_downloads(&self) -> &PendingQueue {
        &self.downloads
    }

    pub fn pending_uploads(&self) -> &PendingQueue {
        &self.uploads
    }

    /// The request currently being served, if any.
    pub fn in_flight(&self) -> Option<(Direction, &CacheKey)> {
        self.in_flight.as_ref().map(|f| (f.direction, &f.key))
    }

    /// Consecutive failed connection attempts.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// True while any request is queued or in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || self.has_pending()
    }

    /// Queues a download of `key` into the local cache directory.
    pub fn fetch(&mut self, key: CacheKey, on_done: Completion) {
        self.enqueue(Direction::Download, key, on_done);
    }

    /// Queues an upload of the local copy of `key` to the server.
    pub fn publish(&mut self, key: CacheKey, on_done: Completion) {
        self.enqueue(Direction::Upload, key, on_done);
    }

    fn enqueue(&mut self, direction: Direction, key: CacheKey, on_done: Completion) {
        let in_flight = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.direction == direction && f.key == key);
        if in_flight || !self.queue_mut(direction).push(key.clone()) {
            debug!(file = %key.cache_file_name(), ?direction, "request already pending");
        }
        self.waiters
            .entry((direction, key))
            .or_default()
            .push(on_done);
    }

    /// Advances the client by `elapsed`.
    pub fn tick(&mut self, elapsed: Duration) {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }

        self.retry_in = self.retry_in.saturating_sub(elapsed);
        self.maintain_connection();

        if self.status == ConnectionStatus::Connected {
            match self.phase {
                Phase::Idle => self.start_next_request(),
                Phase::Downloading => self.poll_download(),
                Phase::Uploading => self.poll_upload(elapsed),
                Phase::DownloadRequested | Phase::UploadRequested | Phase::UploadCompleted => {}
            }
        }
    }

    fn has_pending(&self) -> bool {
        !self.downloads.is_empty() || !self.uploads.is_empty()
    }

    fn queue_mut(&mut self, direction: Direction) -> &mut PendingQueue {
        match direction {
            Direction::Download => &mut self.downloads,
            Direction::Upload => &mut self.uploads,
        }
    }

    fn link_id(&self) -> Option<ConnectionId> {
        self.link.as_ref().map(Link::id)
    }

    // --- Connection ---

    fn maintain_connection(&mut self) {
        if self.status != ConnectionStatus::NotConnected
            || !self.retry_in.is_zero()
            || !self.has_pending()
        {
            return;
        }

        info!(server = %self.config.server_address(), "connecting to cache server");
        self.status = ConnectionStatus::Connecting;
        if let Err(e) = self.connector.connect(&self.events_tx) {
            self.on_connect_failed(&e.to_string());
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { link, .. } => {
                if let Some(old) = self.link.take() {
                    old.close();
                }
                debug!(conn = %link.id(), "transport connected, awaiting acceptance");
                self.link = Some(link);
                self.status = ConnectionStatus::Connecting;
            }
            TransportEvent::ConnectFailed { reason } => self.on_connect_failed(&reason),
            TransportEvent::Disconnected { id } => {
                if self.link_id() == Some(id) {
                    self.on_disconnected();
                }
            }
            TransportEvent::Message { id, message } => {
                if self.link_id() == Some(id) {
                    self.handle_message(message);
                } else {
                    debug!(conn = %id, msg = %message.msg_type, "message from stale connection");
                }
            }
        }
    }

    fn on_disconnected(&mut self) {
        let was_accepted = self.status == ConnectionStatus::Connected;
        self.link = None;
        self.status = ConnectionStatus::NotConnected;
        self.requeue_in_flight();

        if was_accepted {
            warn!("lost connection to cache server");
        } else {
            self.on_connect_failed("connection closed before acceptance");
        }
    }

    fn on_connect_failed(&mut self, reason: &str) {
        if self.status == ConnectionStatus::Connected {
            debug!("ignoring stale connect failure: {reason}");
            return;
        }
        self.status = ConnectionStatus::NotConnected;
        self.link = None;
        self.failed_attempts += 1;

        if self.failed_attempts >= self.config.max_connect_retries.max(1) {
            error!(
                server = %self.config.server_address(),
                attempts = self.failed_attempts,
                "cache server unreachable, failing pending requests: {reason}"
            );
            self.failed_attempts = 0;
            self.retry_in = Duration::ZERO;
            self.fail_all(RequestError::ServerUnreachable);
        } else {
            self.retry_in = self.config.reconnect.delay_for_attempt(self.failed_attempts);
            warn!(
                attempt = self.failed_attempts,
                retry_in_ms = self.retry_in.as_millis() as u64,
                "connection to cache server failed: {reason}"
            );
        }
    }

    fn on_accepted(&mut self) {
        if self.status != ConnectionStatus::Connected {
            info!("connected to cache server");
            self.status = ConnectionStatus::Connected;
            self.failed_attempts = 0;
        }
        if self.in_flight.is_some() {
            warn!("server accepted the connection again mid-request, requeueing");
            self.requeue_in_flight();
        }
    }

    // --- Requests ---

    fn start_next_request(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };

        let (direction, key, msg_type, phase) = if let Some(key) = self.downloads.pop() {
            (
                Direction::Download,
                key,
                MessageType::RequestDownload,
                Phase::DownloadRequested,
            )
        } else if let Some(key) = self.uploads.pop() {
            (
                Direction::Upload,
                key,
                MessageType::RequestUpload,
                Phase::UploadRequested,
            )
        } else {
            return;
        };

        let name = key.cache_file_name();
        if link.send(Message::with_name(msg_type, &name)).is_err() {
            self.queue_mut(direction).requeue(key);
            return;
        }
        debug!(file = %name, msg = %msg_type, "request sent");
        self.in_flight = Some(InFlight { direction, key });
        self.phase = phase;
    }

    fn in_flight_matches(&self, name: &str) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|f| f.key.cache_file_name() == name)
    }

    fn handle_message(&mut self, message: Message) {
        match message.msg_type {
            MessageType::ConnectionAccepted => self.on_accepted(),
            MessageType::FileTransferStart => self.on_transfer_start(&message),
            MessageType::FileTransferFragment => {
                let Some(id) = self.link_id() else {
                    return;
                };
                match self.receiver.as_mut() {
                    Some(receiver) => receiver.handle_message(id, &message),
                    None => debug!("fragment without an active download"),
                }
            }
            MessageType::RequestDownload | MessageType::RequestUpload => {
                warn!(msg = %message.msg_type, "unexpected request from server");
            }
            msg_type if msg_type.carries_name() => match message.name() {
                Ok(name) if self.in_flight_matches(&name) => self.on_reply(msg_type),
                Ok(name) => {
                    error!(msg = %msg_type, file = %name, "reply does not match the in-flight request");
                }
                Err(e) => warn!(msg = %msg_type, "malformed reply: {e}"),
            },
            msg_type => self.on_reply(msg_type),
        }
    }

    /// Applies a server reply to the in-flight request.
    fn on_reply(&mut self, msg_type: MessageType) {
        match (msg_type, self.phase) {
            (MessageType::DownloadRequestRejectUnavailable, Phase::DownloadRequested) => {
                self.finish(Err(RequestError::Unavailable));
            }
            (MessageType::DownloadFailedError, Phase::DownloadRequested | Phase::Downloading) => {
                self.finish(Err(RequestError::TransferFailed));
            }
            (MessageType::UploadRequestAccept, Phase::UploadRequested) => self.begin_upload(),
            (MessageType::UploadRequestRejectFileExists, Phase::UploadRequested) => {
                self.finish(Ok(Resolution::AlreadyPresent));
            }
            (
                MessageType::UploadFailedError,
                Phase::UploadRequested | Phase::Uploading | Phase::UploadCompleted,
            ) => {
                self.finish(Err(RequestError::UploadRejected));
            }
            (MessageType::UploadComplete, Phase::Uploading | Phase::UploadCompleted) => {
                self.finish(Ok(Resolution::Published));
            }
            (msg_type, phase) => error!(msg = %msg_type, ?phase, "unexpected reply"),
        }
    }

    fn on_transfer_start(&mut self, message: &Message) {
        if self.phase != Phase::DownloadRequested {
            warn!(phase = ?self.phase, "transfer start without a pending download");
            return;
        }
        let start = match message.parse_transfer_start() {
            Ok(s) => s,
            Err(e) => {
                warn!("malformed transfer start: {e}");
                self.finish(Err(RequestError::TransferFailed));
                return;
            }
        };
        if !self.in_flight_matches(&start.file_name) {
            error!(file = %start.file_name, "transfer start for a file that was not requested");
            return;
        }
        let (Some(id), Some(in_flight)) = (self.link_id(), self.in_flight.as_ref()) else {
            return;
        };

        let dest = self.config.local_cache_dir.join(&in_flight.key.file_name);
        match FileReceiver::create(
            start.file_name,
            dest,
            start.file_size,
            start.num_fragments,
            id,
        ) {
            Ok(receiver) => {
                self.receiver = Some(receiver);
                self.phase = Phase::Downloading;
            }
            Err(e) => {
                warn!("cannot open download destination: {e}");
                self.finish(Err(RequestError::TransferFailed));
            }
        }
    }

    fn begin_upload(&mut self) {
        let (Some(link), Some(in_flight)) = (self.link.clone(), self.in_flight.as_ref()) else {
            return;
        };
        let path = self.config.local_cache_dir.join(&in_flight.key.file_name);
        self.sender = Some(FileSender::new(path, in_flight.key.cache_file_name(), link));
        self.phase = Phase::Uploading;
    }

    fn poll_download(&mut self) {
        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };
        match receiver.update() {
            ReceiverState::Receiving => {}
            ReceiverState::Completed => self.finish(Ok(Resolution::Fetched)),
            ReceiverState::Failed => self.finish(Err(RequestError::TransferFailed)),
        }
    }

    fn poll_upload(&mut self, elapsed: Duration) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        match sender.tick(elapsed) {
            SenderState::Starting | SenderState::Sending => {}
            SenderState::Sent => {
                self.sender = None;
                self.phase = Phase::UploadCompleted;
            }
            SenderState::Failed => {
                self.sender = None;
                // A lost link is handled by the disconnect event, which
                // requeues instead of failing.
                let Some(link) = self.link.as_ref().filter(|l| l.is_connected()) else {
                    return;
                };
                let _ = link.send(Message::empty(MessageType::UploadFailedError));
                self.finish(Err(RequestError::TransferFailed));
            }
        }
    }

    // --- Resolution ---

    fn finish(&mut self, result: RequestResult) {
        self.phase = Phase::Idle;
        self.receiver = None;
        self.sender = None;
        if let Some(in_flight) = self.in_flight.take() {
            self.resolve(in_flight.direction, &in_flight.key, result);
        }
    }

    fn resolve(&mut self, direction: Direction, key: &CacheKey, result: RequestResult) {
        match &result {
            Ok(resolution) => {
                info!(file = %key.cache_file_name(), ?direction, ?resolution, "request resolved")
            }
            Err(e) => info!(file = %key.cache_file_name(), ?direction, "request failed: {e}"),
        }
        if let Some(waiters) = self.waiters.remove(&(direction, key.clone())) {
            for on_done in waiters {
                on_done(key, result.clone());
            }
        }
    }

    fn requeue_in_flight(&mut self) {
        self.receiver = None;
        self.sender = None;
        self.phase = Phase::Idle;
        if let Some(in_flight) = self.in_flight.take() {
            debug!(file = %in_flight.key.cache_file_name(), direction = ?in_flight.direction, "requeueing request");
            self.queue_mut(in_flight.direction).requeue(in_flight.key);
        }
    }

    fn fail_all(&mut self, error: RequestError) {
        self.requeue_in_flight();
        for key in self.downloads.drain() {
            self.resolve(Direction::Download, &key, Err(error.clone()));
        }
        for key in self.uploads.drain() {
            self.resolve(Direction::Upload, &key, Err(error.clone()));
        }
    }
}

impl Drop for CacheClient {
    /// Requests still queued or in flight resolve as unreachable so no
    /// caller is left waiting on a completion that never comes.
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        if !self.waiters.is_empty() {
            self.fail_all(RequestError::ServerUnreachable);
        }
    }
}
