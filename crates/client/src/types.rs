//! Public types for the cache client.

use std::time::Duration;

use assetcache_protocol::CacheKey;
use serde::{Deserialize, Serialize};

/// Transport status as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    /// Connection attempt in flight, or connected but not yet accepted.
    Connecting,
    /// Accepted by the server; requests may be sent.
    Connected,
}

/// Where the single in-flight request currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    DownloadRequested,
    Downloading,
    UploadRequested,
    Uploading,
    /// Every fragment queued; waiting for the server's acknowledgement.
    UploadCompleted,
}

/// Which queue a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Download,
    Upload,
}

/// Successful outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Already present in the local cache directory.
    FoundLocally,
    /// Downloaded from the server into the local cache directory.
    Fetched,
    /// Uploaded to and acknowledged by the server.
    Published,
    /// The server already had this artifact; nothing was sent.
    AlreadyPresent,
}

/// Why a request did not succeed.
///
/// Every variant means the caller must produce the artifact itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("artifact not available in the cache")]
    Unavailable,

    #[error("cache server unreachable")]
    ServerUnreachable,

    #[error("transfer failed")]
    TransferFailed,

    #[error("upload rejected by the server")]
    UploadRejected,
}

pub type RequestResult = Result<Resolution, RequestError>;

/// Callback invoked exactly once when a request resolves.
pub type Completion = Box<dyn FnOnce(&CacheKey, RequestResult) + Send>;

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 15_000,
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Calculates the delay after a given failed attempt (1-based),
    /// with ±25% jitter so a fleet of clients does not retry in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let unit = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / 1_000_000_000.0;
        self.jittered_delay(attempt, unit)
    }

    /// Delay for `attempt` with jitter drawn from `unit` in `[0, 1)`:
    /// 0 shortens by 25%, 0.5 is the plain backoff, values near 1 lengthen by 25%.
    fn jittered_delay(&self, attempt: u32, unit: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = (self.initial_delay_ms as f64 / 1000.0) * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay().as_secs_f64());
        let offset = unit.clamp(0.0, 1.0) * 2.0 - 1.0;
        let with_jitter = (capped + capped * 0.25 * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}
