//! Outbound payload pipeline for a single gateway connection.

use std::future::Future;

use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{Payload, PayloadTransformer};

/// Failure that stopped an outbound pipeline.
#[derive(Error, Debug)]
pub enum OutboundError<U, W> {
    /// The payload source failed; forwarded unchanged
    #[error("Upstream payload source failed: {0}")]
    Upstream(U),

    /// The downstream writer rejected a payload
    #[error("Downstream writer failed: {0}")]
    Downstream(W),
}

/// How an outbound pipeline finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundOutcome {
    /// The payload source ended and every payload was written
    Completed,
    /// The shutdown signal fired; pending payloads were dropped
    Shutdown,
}

/// Result of a pipeline run that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundSummary {
    /// Payloads handed to the downstream writer
    pub delivered: u64,
    /// Why the run ended
    pub outcome: OutboundOutcome,
}

/// Drives a connection's outbound payloads through a chain of transformers
/// into the downstream writer.
///
/// A pipeline is built per connection and consumed by [`OutboundPipeline::run`].
pub struct OutboundPipeline<E> {
    /// Identifier attached to every log line of this run
    connection_id: Uuid,
    /// Applied in insertion order; the first sees the raw upstream
    transformers: Vec<Box<dyn PayloadTransformer<E>>>,
}

impl<E: Send + 'static> OutboundPipeline<E> {
    /// Create a pipeline with no transformers.
    pub fn new() -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            transformers: Vec::new(),
        }
    }

    /// Append a transformer to the chain.
    pub fn with_transformer<T>(mut self, transformer: T) -> Self
    where
        T: PayloadTransformer<E> + 'static,
    {
        self.transformers.push(Box::new(transformer));
        self
    }

    /// Get the connection identifier used in logs.
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Run the pipeline until upstream completes, something fails, or
    /// `shutdown` resolves.
    ///
    /// On completion the sink is closed. On shutdown any payload still waiting
    /// for admission is dropped and nothing further is admitted.
    pub async fn run<S, K, F>(
        self,
        upstream: S,
        sink: K,
        shutdown: F,
    ) -> Result<OutboundSummary, OutboundError<E, K::Error>>
    where
        S: Stream<Item = Result<Payload, E>> + Send,
        K: Sink<Payload> + Unpin,
        F: Future<Output = ()>,
    {
        let span = info_span!("outbound", connection = %self.connection_id);
        self.drive(upstream, sink, shutdown).instrument(span).await
    }

    async fn drive<S, K, F>(
        self,
        upstream: S,
        mut sink: K,
        shutdown: F,
    ) -> Result<OutboundSummary, OutboundError<E, K::Error>>
    where
        S: Stream<Item = Result<Payload, E>> + Send,
        K: Sink<Payload> + Unpin,
        F: Future<Output = ()>,
    {
        info!(
            transformers = self.transformers.len(),
            "Starting outbound payload pipeline"
        );

        let mut payloads = self
            .transformers
            .iter()
            .fold(upstream.boxed(), |stream, transformer| transformer.apply(stream));
        tokio::pin!(shutdown);

        let mut delivered: u64 = 0;
        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!(delivered, "Shutdown requested, dropping pending payloads");
                    return Ok(OutboundSummary {
                        delivered,
                        outcome: OutboundOutcome::Shutdown,
                    });
                }
                item = payloads.next() => match item {
                    Some(Ok(payload)) => {
                        sink.send(payload).await.map_err(OutboundError::Downstream)?;
                        delivered += 1;
                    }
                    Some(Err(e)) => {
                        warn!(delivered, "Outbound pipeline stopped by upstream failure");
                        return Err(OutboundError::Upstream(e));
                    }
                    None => {
                        sink.close().await.map_err(OutboundError::Downstream)?;
                        info!(delivered, "Outbound payload pipeline completed");
                        return Ok(OutboundSummary {
                            delivered,
                            outcome: OutboundOutcome::Completed,
                        });
                    }
                },
            }
        }
    }
}

impl<E: Send + 'static> Default for OutboundPipeline<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use futures::channel::mpsc;
    use futures::future;
    use futures::stream;
    use tokio::time::Instant;

    use crate::gateway::RateLimiterTransformer;
    use crate::ratelimit::TokenBucket;

    fn numbered(n: usize) -> Vec<Result<Payload, &'static str>> {
        (0..n).map(|i| Ok(Bytes::from(i.to_string()))).collect()
    }

    fn throttled(bucket: &Arc<TokenBucket>) -> OutboundPipeline<&'static str> {
        OutboundPipeline::new().with_transformer(RateLimiterTransformer::new(bucket.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_delivers_throttled_payloads() {
        let bucket = Arc::new(TokenBucket::new(2, Duration::from_millis(100)).unwrap());
        let (tx, rx) = mpsc::unbounded();

        let start = Instant::now();
        let summary = throttled(&bucket)
            .run(stream::iter(numbered(5)), tx, future::pending())
            .await
            .unwrap();

        assert_eq!(
            summary,
            OutboundSummary {
                delivered: 5,
                outcome: OutboundOutcome::Completed
            }
        );
        // Two per window: the fifth payload goes out in the third window.
        assert!(start.elapsed() >= Duration::from_millis(200));

        let written: Vec<_> = rx.collect().await;
        let expected: Vec<_> = numbered(5).into_iter().map(Result::unwrap).collect();
        assert_eq!(written, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_without_transformers_passes_through() {
        let (tx, rx) = mpsc::unbounded();

        let summary = OutboundPipeline::<&'static str>::new()
            .run(stream::iter(numbered(3)), tx, future::pending())
            .await
            .unwrap();

        assert_eq!(summary.delivered, 3);
        assert_eq!(rx.collect::<Vec<_>>().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_payload() {
        let bucket = Arc::new(TokenBucket::new(1, Duration::from_secs(10)).unwrap());
        let (tx, rx) = mpsc::unbounded();

        let start = Instant::now();
        let summary = throttled(&bucket)
            .run(
                stream::iter(numbered(3)),
                tx,
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert_eq!(
            summary,
            OutboundSummary {
                delivered: 1,
                outcome: OutboundOutcome::Shutdown
            }
        );
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(rx.collect::<Vec<_>>().await, vec![Bytes::from("0")]);
        assert_eq!(bucket.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failure_is_forwarded_unchanged() {
        let bucket = Arc::new(TokenBucket::default());
        let (tx, rx) = mpsc::unbounded();
        let upstream = stream::iter(vec![Ok(Bytes::from("0")), Err("socket closed")]);

        let err = throttled(&bucket)
            .run(upstream, tx, future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, OutboundError::Upstream("socket closed")));
        assert_eq!(rx.collect::<Vec<_>>().await, vec![Bytes::from("0")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_failure_is_reported() {
        let (tx, rx) = mpsc::unbounded();
        drop(rx);

        let err = OutboundPipeline::<&'static str>::new()
            .run(stream::iter(numbered(1)), tx, future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, OutboundError::Downstream(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connections_share_one_budget() {
        let bucket = Arc::new(TokenBucket::new(3, Duration::from_secs(1)).unwrap());

        let start = Instant::now();
        let runs = (0..2).map(|_| {
            let pipeline = throttled(&bucket);
            tokio::spawn(async move {
                let (tx, rx) = mpsc::unbounded();
                let summary = pipeline
                    .run(stream::iter(numbered(3)), tx, future::pending())
                    .await
                    .unwrap();
                (summary, rx.collect::<Vec<_>>().await)
            })
        });

        for run in future::join_all(runs).await {
            let (summary, written) = run.unwrap();
            assert_eq!(summary.delivered, 3);
            let expected: Vec<_> = numbered(3).into_iter().map(Result::unwrap).collect();
            assert_eq!(written, expected);
        }
        // Six payloads against three units per window need a second window.
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
