//! gateway-throttle - Rate-limited outbound payload stage
//!
//! This crate throttles the sequence of binary payloads a client writes to a
//! remote gateway over a persistent connection. Payloads are admitted one at a
//! time against a shared rate limiter, keep their original order, and wait
//! cooperatively whenever the budget is exhausted.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
