//! Outbound payload stages for a gateway connection.

mod outbound;
mod transformer;

pub use outbound::{OutboundError, OutboundOutcome, OutboundPipeline, OutboundSummary};
pub use transformer::{PayloadTransformer, RateLimiterTransformer};

/// One opaque unit of outbound binary data.
pub type Payload = bytes::Bytes;
