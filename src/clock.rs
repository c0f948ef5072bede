//! Monotonic microsecond clocks.
//!
//! All timestamps stored in the handlespace and peer list are microseconds on a monotonic
//! timeline. [`TokioClock`] follows tokio's clock, so paused time in tests advances it too.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::time::Instant;

use crate::config::micros;

/// Microseconds on a monotonic timeline.
pub type TimeStamp = u64;

/// A source of monotonic timestamps.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current timestamp.
    fn now(&self) -> TimeStamp;
}

/// Clock backed by [`tokio::time::Instant`].
#[derive(Clone, Copy, Debug)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    /// Creates a clock whose timeline starts at zero now.
    pub fn new() -> Self {
        TokioClock {
            origin: Instant::now(),
        }
    }

    /// Converts a timestamp on this clock back to an instant.
    pub fn instant_at(&self, ts: TimeStamp) -> Instant {
        self.origin + std::time::Duration::from_micros(ts)
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> TimeStamp {
        micros(self.origin.elapsed())
    }
}

/// Manually driven clock.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    pub fn new(start: TimeStamp) -> Self {
        ManualClock {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Sets the current time.
    pub fn set(&self, ts: TimeStamp) {
        self.now.store(ts, Ordering::SeqCst);
    }

    /// Moves the clock forward.
    pub fn advance(&self, delta: TimeStamp) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimeStamp {
        self.now.load(Ordering::SeqCst)
    }
}
