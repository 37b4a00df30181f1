//! Rate limiter trait consumed by the outbound payload stages.

/// Token-accounting primitive shared by every stage that spends the same
/// send budget.
///
/// Implementations must be safe to call repeatedly and concurrently from
/// multiple callers holding the same limiter.
pub trait RateLimiter: Send + Sync {
    /// Atomically consume `units` of capacity.
    ///
    /// Returns `true` if the units were consumed, `false` if the budget could
    /// not cover them. A `false` result must leave the budget untouched.
    fn try_consume(&self, units: u64) -> bool;

    /// Minimum number of milliseconds until `units` of capacity are expected to
    /// be available.
    ///
    /// The value may be stale by the time the caller acts on it, and may be
    /// zero or negative when capacity is (or should already be) available.
    fn delay_millis_to_consume(&self, units: u64) -> i64;
}
