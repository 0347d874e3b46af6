//! Counter-to-rate conversion shared by the adapters.
//!
//! Throughput metrics are a delta between two absolute counters divided by
//! the wall time between the reads. A tick with no usable elapsed time emits
//! no rate at all, so NaN and infinity never reach a snapshot.

use std::collections::HashMap;
use std::time::Instant;

/// Elapsed time below this is treated as "no time passed".
pub const MIN_ELAPSED_SECS: f64 = 0.001;

/// Compute u64 delta, returning `None` on counter regression (reset or wrap).
pub fn du64(curr: u64, prev: u64) -> Option<u64> {
    curr.checked_sub(prev)
}

/// Remembers the previous value of named counters and the instant of the
/// previous tick.
#[derive(Debug, Default)]
pub struct RateTracker {
    prev: HashMap<String, u64>,
    prev_at: Option<Instant>,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a tick at `now`. Returns the seconds since the previous tick,
    /// or `None` on the first tick and when the clock did not advance enough.
    pub fn advance(&mut self, now: Instant) -> Option<f64> {
        let elapsed = self
            .prev_at
            .map(|prev| now.saturating_duration_since(prev).as_secs_f64());
        self.prev_at = Some(now);
        elapsed.filter(|e| *e >= MIN_ELAPSED_SECS)
    }

    /// Records `value` for `key` and returns its per-second rate.
    ///
    /// `elapsed` is the value returned by [`advance`](Self::advance) for this tick.
    pub fn rate(&mut self, key: &str, value: u64, elapsed: Option<f64>) -> Option<f64> {
        let prev = self.prev.insert(key.to_string(), value);
        let elapsed = elapsed?;
        let delta = du64(value, prev?)?;
        let rate = delta as f64 / elapsed;
        rate.is_finite().then_some(rate)
    }

    pub fn reset(&mut self) {
        self.prev.clear();
        self.prev_at = None;
    }
}
