//! Fixed-window token bucket.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::limiter::RateLimiter;
use crate::error::{Result, ThrottleError};

/// Default number of units granted per window.
pub const DEFAULT_CAPACITY: u64 = 120;
/// Default refill window.
pub const DEFAULT_REFILL_PERIOD: Duration = Duration::from_secs(60);

/// A token bucket that refills to full capacity at the start of every window.
///
/// The bucket is thread-safe and is meant to be shared through an `Arc` by all
/// stages spending the same budget.
#[derive(Debug)]
pub struct TokenBucket {
    /// Units available at the start of each window
    capacity: u64,
    /// Length of a window
    refill_period: Duration,
    /// Remaining units and the start of the current window
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    remaining: u64,
    window_start: Instant,
}

impl TokenBucket {
    /// Create a new full bucket.
    pub fn new(capacity: u64, refill_period: Duration) -> Result<Self> {
        if capacity == 0 || refill_period.is_zero() {
            return Err(ThrottleError::InvalidLimit {
                capacity,
                refill_period_ms: refill_period.as_millis() as u64,
            });
        }

        Ok(Self {
            capacity,
            refill_period,
            state: Mutex::new(BucketState {
                remaining: capacity,
                window_start: Instant::now(),
            }),
        })
    }

    /// Get the number of units granted per window.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get the window length.
    pub fn refill_period(&self) -> Duration {
        self.refill_period
    }

    /// Get the units still available in the current window.
    pub fn remaining(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.remaining
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.window_start);
        if elapsed < self.refill_period {
            return;
        }

        // Align to window boundaries so a long idle gap doesn't shift the schedule.
        let windows = elapsed.as_nanos() / self.refill_period.as_nanos();
        let advance = self.refill_period.as_nanos() * windows;
        state.window_start += Duration::from_nanos(advance as u64);
        state.remaining = self.capacity;

        trace!(capacity = self.capacity, "Token bucket refilled");
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_period: DEFAULT_REFILL_PERIOD,
            state: Mutex::new(BucketState {
                remaining: DEFAULT_CAPACITY,
                window_start: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for TokenBucket {
    fn try_consume(&self, units: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());

        if state.remaining < units {
            return false;
        }
        state.remaining -= units;
        true
    }

    fn delay_millis_to_consume(&self, units: u64) -> i64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.remaining >= units {
            return 0;
        }

        let window_end = state.window_start + self.refill_period;
        let wait = window_end.saturating_duration_since(now);
        // Round up so a caller sleeping this long always lands in the next window.
        let millis = wait.as_nanos().div_ceil(1_000_000);
        i64::try_from(millis).unwrap_or(i64::MAX)
    }
}
