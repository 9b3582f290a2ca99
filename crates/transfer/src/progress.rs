use std::fmt;
use std::time::{Duration, Instant};

const MIB: f64 = 1024.0 * 1024.0;

/// Measures wall-clock time for one transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferTimer {
    started: Instant,
}

impl TransferTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Summarizes a finished transfer of `bytes`.
    pub fn summary(&self, bytes: u64) -> TransferSummary {
        TransferSummary::new(bytes, self.elapsed())
    }
}

/// Size, duration and throughput of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferSummary {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferSummary {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self { bytes, elapsed }
    }

    /// Average throughput in bytes per second.
    ///
    /// Returns 0.0 when no time has elapsed.
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs
    }
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} MiB in {:.2}s ({:.2} MiB/s)",
            self.bytes as f64 / MIB,
            self.elapsed.as_secs_f64(),
            self.bytes_per_second() / MIB
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput() {
        let s = TransferSummary::new(10 * 1024 * 1024, Duration::from_secs(2));
        assert!((s.bytes_per_second() - 5.0 * MIB).abs() < 1.0);
    }

    #[test]
    fn zero_elapsed_has_zero_rate() {
        let s = TransferSummary::new(1024, Duration::ZERO);
        assert_eq!(s.bytes_per_second(), 0.0);
    }

    #[test]
    fn display_format() {
        let s = TransferSummary::new(3 * 1024 * 1024, Duration::from_millis(1500));
        assert_eq!(s.to_string(), "3.00 MiB in 1.50s (2.00 MiB/s)");
    }

    #[test]
    fn timer_elapsed_is_monotonic() {
        let t = TransferTimer::start();
        let a = t.elapsed();
        let b = t.elapsed();
        assert!(b >= a);
        assert_eq!(t.summary(0).bytes, 0);
    }
}
