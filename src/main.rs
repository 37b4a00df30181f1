use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::SplitStream;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use gateway_throttle::config::ThrottleConfig;
use gateway_throttle::gateway::{
    OutboundError, OutboundPipeline, OutboundSummary, Payload, RateLimiterTransformer,
};
use gateway_throttle::ratelimit::RateLimiter;

/// Frame delimiter on stdin and stdout.
const FRAME_DELIMITER: u8 = b'\n';

/// Relay newline-delimited frames from stdin to stdout under a rate limit.
#[derive(Debug, Parser)]
#[command(name = "gateway-throttle", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the units granted per refill window
    #[arg(long)]
    capacity: Option<u64>,

    /// Override the refill window in milliseconds
    #[arg(long)]
    refill_ms: Option<u64>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing; stdout carries the relayed frames
    let filter = EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(io::stderr)
        .init();

    let code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %format!("{e:#}"), "gateway-throttle failed");
            1
        }
    };

    // A blocking stdin read cannot be cancelled, so returning would leave the
    // runtime waiting on it after shutdown. Every admitted frame is written by now.
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!("Starting gateway-throttle");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => ThrottleConfig::from_file(path)?,
        None => ThrottleConfig::default(),
    };
    if let Some(capacity) = args.capacity {
        config.limiter.capacity = capacity;
    }
    if let Some(refill_ms) = args.refill_ms {
        config.limiter.refill_period_ms = refill_ms;
    }
    config.validate()?;

    let limiter = Arc::new(config.limiter.build()?);
    info!(
        capacity = config.limiter.capacity,
        refill_period_ms = config.limiter.refill_period_ms,
        "Rate limiter initialized"
    );

    let (result, written) = relay(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        limiter,
        config.outbound.buffer,
        shutdown_signal(),
    )
    .await;

    let summary = result.context("Outbound pipeline failed")?;
    written.context("Failed to write frames to stdout")?;

    info!(
        delivered = summary.delivered,
        outcome = ?summary.outcome,
        "gateway-throttle stopped"
    );
    Ok(())
}

type RelayResult = Result<OutboundSummary, OutboundError<io::Error, mpsc::SendError>>;

/// Throttle frames from `reader` into `writer` until the input ends, fails,
/// or `shutdown` resolves.
///
/// The writer is always drained before returning, so frames admitted ahead of
/// a failure still reach it.
async fn relay<R, W, F>(
    reader: R,
    writer: W,
    limiter: Arc<dyn RateLimiter>,
    buffer: usize,
    shutdown: F,
) -> (RelayResult, io::Result<W>)
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
    F: Future<Output = ()>,
{
    let (frames_tx, frames_rx) = mpsc::channel(buffer);
    let writer = tokio::spawn(write_frames(frames_rx, writer));

    let pipeline = OutboundPipeline::new().with_transformer(RateLimiterTransformer::new(limiter));
    info!(connection = %pipeline.connection_id(), "Relaying frames");

    // The pipeline owns the sender, so the writer sees the end of the channel
    // once `run` returns on any path.
    let result = pipeline.run(frame_stream(reader), frames_tx, shutdown).await;
    let written = match writer.await {
        Ok(written) => written,
        Err(e) => Err(io::Error::other(e)),
    };

    (result, written)
}

/// Split `reader` into frames on the delimiter without interpreting their bytes.
fn frame_stream<R>(reader: R) -> impl Stream<Item = io::Result<Payload>> + Send
where
    R: AsyncBufRead + Unpin + Send,
{
    SplitStream::new(reader.split(FRAME_DELIMITER)).map(|frame| frame.map(Bytes::from))
}

/// Write each admitted frame on its own line, handing the writer back once the
/// channel closes.
async fn write_frames<W>(mut frames: mpsc::Receiver<Payload>, mut out: W) -> io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.next().await {
        out.write_all(&frame).await?;
        out.write_all(&[FRAME_DELIMITER]).await?;
        out.flush().await?;
    }
    Ok(out)
}

/// Resolve on Ctrl+C or SIGTERM.
///
/// A signal whose handler cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        () = ctrl_c => "SIGINT",
        () = terminate => "SIGTERM",
    };
    info!(signal = received, "Stopping relay, dropping frames not yet admitted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::future;
    use gateway_throttle::gateway::OutboundOutcome;
    use gateway_throttle::ratelimit::TokenBucket;

    fn unlimited() -> Arc<dyn RateLimiter> {
        Arc::new(TokenBucket::new(1_000, Duration::from_secs(1)).unwrap())
    }

    #[tokio::test]
    async fn test_frame_stream_keeps_non_utf8_bytes() {
        let input: &[u8] = b"ok1\n\xff\xfe\nok2";

        let frames: Vec<_> = frame_stream(input)
            .map(|frame| frame.unwrap())
            .collect()
            .await;

        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"ok1"),
                Bytes::from_static(b"\xff\xfe"),
                Bytes::from_static(b"ok2"),
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_passes_binary_frames_through() {
        let input: &[u8] = b"ok1\n\xff\xfe\nok2\n";

        let (result, written) =
            relay(input, Vec::new(), unlimited(), 8, future::pending()).await;

        let summary = result.unwrap();
        assert_eq!(summary.delivered, 3);
        assert_eq!(summary.outcome, OutboundOutcome::Completed);
        assert_eq!(written.unwrap(), input.to_vec());
    }

    #[tokio::test]
    async fn test_relay_writes_admitted_frames_before_reporting_failure() {
        let reader = tokio_test::io::Builder::new()
            .read(b"ok1\n")
            .read_error(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))
            .build();

        let (result, written) = relay(
            BufReader::new(reader),
            Vec::new(),
            unlimited(),
            8,
            future::pending(),
        )
        .await;

        match result {
            Err(OutboundError::Upstream(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected upstream failure, got {other:?}"),
        }
        assert_eq!(written.unwrap(), b"ok1\n".to_vec());
    }

    #[tokio::test]
    async fn test_relay_returns_on_shutdown_while_input_stays_open() {
        let (input, _keep_open) = tokio::io::duplex(64);

        let (result, written) = relay(
            BufReader::new(input),
            Vec::new(),
            unlimited(),
            8,
            tokio::time::sleep(Duration::from_millis(20)),
        )
        .await;

        let summary = result.unwrap();
        assert_eq!(summary.outcome, OutboundOutcome::Shutdown);
        assert_eq!(summary.delivered, 0);
        assert!(written.unwrap().is_empty());
    }
}
