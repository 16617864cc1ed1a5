use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::Stream;

use crate::models::ApiKey;
use crate::relay::reporter::{RelayOutcome, RelayReport, ReporterHandle};
use crate::relay::stream::SseUsageTracker;

/// What the tee needs to settle the relay once the body finishes.
pub struct FinalizeCtx {
    pub reporter: ReporterHandle,
    pub account_id: i64,
    pub api_key: Option<ApiKey>,
    pub status: u16,
    pub retry_after_secs: Option<i64>,
    pub started: Instant,
}

/// Pass-through body stream that scans SSE chunks for token usage and files
/// exactly one relay report when the stream ends. Ending covers upstream
/// EOF, a stream error, and the caller dropping the response mid-body, so
/// the report fires via `Drop` as the backstop.
pub struct UsageTeeStream<S> {
    upstream: S,
    tracker: SseUsageTracker,
    ctx: FinalizeCtx,
    finalized: bool,
}

impl<S> UsageTeeStream<S> {
    pub fn new(upstream: S, ctx: FinalizeCtx) -> Self {
        Self {
            upstream,
            tracker: SseUsageTracker::new(),
            ctx,
            finalized: false,
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let usage = self.tracker.finalize();
        self.ctx.reporter.report(RelayReport {
            account_id: self.ctx.account_id,
            api_key: self.ctx.api_key.take(),
            outcome: RelayOutcome::Status {
                code: self.ctx.status,
                retry_after_secs: self.ctx.retry_after_secs,
            },
            usage,
            duration_ms: self.ctx.started.elapsed().as_millis().min(i64::MAX as u128) as i64,
        });
    }
}

impl<S> Stream for UsageTeeStream<S>
where
    S: Stream<Item = Result<Bytes, std::io::Error>> + Unpin,
{
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.finalize();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(chunk))) => {
                this.tracker.ingest_chunk(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finalize();
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}

impl<S> Drop for UsageTeeStream<S> {
    fn drop(&mut self) {
        self.finalize();
    }
}
