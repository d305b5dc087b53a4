//! Outbound bandwidth throttle shared by all transfers of a node

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Pauses are only computed after this many bytes accumulated
const MIN_PAUSE_CHECK_BYTES: u64 = 64 * 1024;

struct LimiterState {
    bytes_since_pause: u64,
    next_allowed: Instant,
}

/// Byte-rate limiter
///
/// Callers report the bytes they are about to send and sleep for the
/// returned pause. A rate of zero disables throttling.
pub struct RateLimiter {
    bytes_per_sec: u64,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a limiter for `bytes_per_sec` (0 = unlimited)
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            state: Mutex::new(LimiterState {
                bytes_since_pause: 0,
                next_allowed: Instant::now(),
            }),
        }
    }

    /// Configured rate
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Account `bytes` and return how long the caller should wait
    pub fn pause(&self, bytes: u64) -> Duration {
        if self.bytes_per_sec == 0 {
            return Duration::ZERO;
        }

        let mut state = self.state.lock();
        state.bytes_since_pause += bytes;
        if state.bytes_since_pause < MIN_PAUSE_CHECK_BYTES {
            return Duration::ZERO;
        }

        let cost_ns = state.bytes_since_pause.saturating_mul(1_000_000_000) / self.bytes_per_sec;
        state.bytes_since_pause = 0;

        let now = Instant::now();
        // Idle time does not bank credit beyond the current instant
        let start = state.next_allowed.max(now);
        state.next_allowed = start + Duration::from_nanos(cost_ns);
        state.next_allowed.saturating_duration_since(now)
    }

    /// Account `bytes`, sleep as needed, and return the time slept
    pub async fn throttle(&self, bytes: u64) -> Duration {
        let pause = self.pause(bytes);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        pause
    }
}
