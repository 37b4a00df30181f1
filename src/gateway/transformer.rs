//! Rate-limited payload transformer.
//!
//! [`RateLimiterTransformer`] turns an ordered stream of outbound payloads into
//! an ordered stream that never outruns a shared [`RateLimiter`]. Payloads are
//! admitted strictly one at a time: the next payload is not offered to the
//! limiter until the previous one has been released downstream.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::{debug, trace, warn};

use super::Payload;
use crate::ratelimit::RateLimiter;

/// Units requested from the limiter for every payload.
const UNITS_PER_PAYLOAD: u64 = 1;

/// A stage that rewrites the outbound payload stream of a connection.
///
/// Items are `Ok(payload)` for data and `Err(e)` for an upstream failure;
/// the end of the stream is completion.
pub trait PayloadTransformer<E>: Send + Sync {
    /// Wrap `upstream`, returning the stream the next stage should consume.
    fn apply<'a>(
        &self,
        upstream: BoxStream<'a, Result<Payload, E>>,
    ) -> BoxStream<'a, Result<Payload, E>>;
}

/// Throttles a payload stream using a [`RateLimiter`] instance.
///
/// One transformer is built per connection. The limiter handle may be shared
/// with other stages drawing on the same budget.
#[derive(Clone)]
pub struct RateLimiterTransformer {
    limiter: Arc<dyn RateLimiter>,
}

impl std::fmt::Debug for RateLimiterTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterTransformer").finish_non_exhaustive()
    }
}

impl RateLimiterTransformer {
    /// Create a transformer bound to `limiter`.
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter }
    }

    /// Throttle `upstream`.
    ///
    /// The returned stream yields the upstream payloads in order, each one only
    /// after the limiter granted a unit for it. An upstream `Err` is forwarded
    /// unchanged, discards any payload still waiting for capacity, and ends the
    /// stream. Dropping the returned stream cancels a pending wait without
    /// admitting anything further.
    pub fn throttle<'a, S, E>(
        &self,
        upstream: S,
    ) -> impl Stream<Item = Result<Payload, E>> + Send + 'a
    where
        S: Stream<Item = Result<Payload, E>> + Send + 'a,
        E: Send + 'a,
    {
        let admission = Admission {
            limiter: self.limiter.clone(),
            upstream: upstream.boxed(),
            staged: None,
            upstream_done: false,
            failed: false,
        };

        stream::unfold(admission, |mut admission| async move {
            let item = admission.next_admitted().await?;
            Some((item, admission))
        })
    }
}

impl<E: Send + 'static> PayloadTransformer<E> for RateLimiterTransformer {
    fn apply<'a>(
        &self,
        upstream: BoxStream<'a, Result<Payload, E>>,
    ) -> BoxStream<'a, Result<Payload, E>> {
        self.throttle(upstream).boxed()
    }
}

/// Per-stream admission state.
///
/// At most one payload is pending admission (the one owned by `admit`), and at
/// most one more sits in `staged`. Upstream is only polled while a payload is
/// pending so that a failure can cut the wait short; once `staged` is full it
/// is not polled again until the pending payload has been released.
struct Admission<'a, E> {
    limiter: Arc<dyn RateLimiter>,
    upstream: BoxStream<'a, Result<Payload, E>>,
    /// Payload read from upstream while its predecessor was waiting
    staged: Option<Payload>,
    upstream_done: bool,
    failed: bool,
}

impl<E> Admission<'_, E> {
    async fn next_admitted(&mut self) -> Option<Result<Payload, E>> {
        if self.failed {
            return None;
        }

        let payload = match self.staged.take() {
            Some(payload) => payload,
            None if self.upstream_done => return None,
            None => match self.upstream.next().await {
                Some(Ok(payload)) => payload,
                Some(Err(e)) => {
                    warn!("Upstream payload source failed");
                    self.failed = true;
                    return Some(Err(e));
                }
                None => {
                    trace!("Upstream payload source completed");
                    self.upstream_done = true;
                    return None;
                }
            },
        };

        match self.admit(payload).await {
            Ok(payload) => Some(Ok(payload)),
            Err(e) => {
                warn!("Upstream payload source failed while a payload was pending admission");
                self.failed = true;
                self.staged = None;
                Some(Err(e))
            }
        }
    }

    /// Retry until the limiter grants a unit for `payload`.
    async fn admit(&mut self, payload: Payload) -> Result<Payload, E> {
        let mut attempt: u64 = 1;

        loop {
            if self.limiter.try_consume(UNITS_PER_PAYLOAD) {
                trace!(attempt, len = payload.len(), "Payload admitted");
                return Ok(payload);
            }

            let delay_ms = self.limiter.delay_millis_to_consume(UNITS_PER_PAYLOAD);
            debug!(attempt, delay_ms, "Rate budget exhausted, deferring payload");

            if delay_ms <= 0 {
                tokio::task::yield_now().await;
            } else {
                self.wait(Duration::from_millis(delay_ms as u64)).await?;
            }

            attempt += 1;
        }
    }

    /// Sleep for `delay` while watching upstream for a failure.
    async fn wait(&mut self, delay: Duration) -> Result<(), E> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                item = self.upstream.next(), if self.staged.is_none() && !self.upstream_done => {
                    match item {
                        Some(Ok(next)) => self.staged = Some(next),
                        Some(Err(e)) => return Err(e),
                        None => self.upstream_done = true,
                    }
                }
                () = &mut sleep => return Ok(()),
            }
        }
    }
}
