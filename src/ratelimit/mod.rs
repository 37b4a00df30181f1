//! Rate budget accounting.

mod bucket;
mod limiter;

pub use bucket::{TokenBucket, DEFAULT_CAPACITY, DEFAULT_REFILL_PERIOD};
pub use limiter::RateLimiter;
