//! Rate limiting for drop warnings.
//!
//! Overflow can happen on every emit when a collector is down, so the
//! senders count discarded packets and report them at most once per
//! interval instead of logging each one.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default interval between successive drop warnings.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

struct WarnState {
    last_warn: Option<Instant>,
    dropped: u64,
}

/// Counts dropped packets and emits a summary warning when due.
///
/// The first warning is emitted immediately; later ones wait for `interval`
/// to elapse. [`flush`](Self::flush) reports outstanding drops at once, for
/// use during shutdown.
pub struct RateLimitedWarner {
    interval: Duration,
    state: Mutex<WarnState>,
}

impl RateLimitedWarner {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(WarnState {
                last_warn: None,
                dropped: 0,
            }),
        }
    }

    /// Record one drop and warn through `warn` if the interval has elapsed.
    pub fn record_drop(&self, warn: impl FnOnce(u64)) {
        let mut state = self.state.lock();
        state.dropped += 1;
        let now = Instant::now();
        let due = state
            .last_warn
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            let count = std::mem::take(&mut state.dropped);
            state.last_warn = Some(now);
            drop(state);
            warn(count);
        }
    }

    /// Report any drops not yet warned about.
    pub fn flush(&self, warn: impl FnOnce(u64)) {
        let mut state = self.state.lock();
        let count = std::mem::take(&mut state.dropped);
        if count > 0 {
            state.last_warn = Some(Instant::now());
            drop(state);
            warn(count);
        }
    }
}

impl std::fmt::Debug for RateLimitedWarner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedWarner")
            .field("interval", &self.interval)
            .field("dropped", &self.state.lock().dropped)
            .finish()
    }
}

impl Default for RateLimitedWarner {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}
