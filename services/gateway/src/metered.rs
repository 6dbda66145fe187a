//! Response body wrapper that accounts usage once the body is done
//!
//! `MeteredStream` forwards upstream chunks untouched while feeding them to a
//! `Meter`. Accounting runs exactly once, when the stream ends, errors, or is
//! dropped because the client went away. It is spawned onto the runtime so a
//! slow store never holds up the response.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use key_pool::{RoutingContext, StreamTokenCounter, UsageLedger, total_tokens_from_body};
use pin_project_lite::pin_project;
use tracing::{debug, warn};

use crate::metrics;
use crate::stats::{UsageRecord, UsageSink};

/// Upper bound on a buffered non-streamed body. Larger bodies are charged zero.
const MAX_METERED_BODY: usize = 16 * 1024 * 1024;

/// How tokens are counted from a response body.
pub enum Meter {
    /// Server-sent events: scrape `"content"` fragments as they pass.
    EventStream(StreamTokenCounter),
    /// Single JSON document: read `usage.total_tokens` at the end.
    Json { buf: Vec<u8>, overflowed: bool },
}

impl Meter {
    pub fn event_stream(counter: StreamTokenCounter) -> Self {
        Meter::EventStream(counter)
    }

    pub fn json() -> Self {
        Meter::Json {
            buf: Vec::new(),
            overflowed: false,
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        match self {
            Meter::EventStream(counter) => counter.feed(chunk),
            Meter::Json { buf, overflowed } => {
                if *overflowed {
                    return;
                }
                if buf.len() + chunk.len() > MAX_METERED_BODY {
                    debug!("response body too large to meter");
                    *overflowed = true;
                    buf.clear();
                    return;
                }
                buf.extend_from_slice(chunk);
            }
        }
    }

    fn finish(&mut self) -> u64 {
        match self {
            Meter::EventStream(counter) => counter.finish(),
            Meter::Json { buf, overflowed } if !*overflowed => total_tokens_from_body(buf),
            Meter::Json { .. } => 0,
        }
    }
}

/// What to charge once the body is done.
pub struct UsageAccounting {
    pub ledger: Arc<UsageLedger>,
    pub stats: Arc<dyn UsageSink>,
    pub ctx: RoutingContext,
}

impl UsageAccounting {
    /// Record `tokens` against the ledger and the statistics sink on a
    /// detached task.
    fn complete(self, tokens: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(tokens, "no runtime available, usage not recorded");
            return;
        };
        handle.spawn(async move {
            let ctx = self.ctx;
            match self.ledger.record_usage(&ctx.usage_key(), tokens).await {
                Ok(total) => {
                    metrics::record_tokens(ctx.model.as_str(), tokens);
                    debug!(device_id = %ctx.device_id, tokens, total, "response usage recorded");
                }
                Err(e) => warn!(
                    device_id = %ctx.device_id,
                    tokens,
                    error = %e,
                    "failed to record usage"
                ),
            }
            let record = UsageRecord::outgoing(
                ctx.device_id.as_str(),
                ctx.app_name.as_str(),
                tokens,
                ctx.query_type.as_str(),
                ctx.model.as_str(),
            );
            if let Err(e) = self.stats.record(record).await {
                warn!(error = %e, "failed to write usage statistics");
            }
        });
    }
}

pin_project! {
    /// Pass-through stream that meters what it yields.
    pub struct MeteredStream<S> {
        #[pin]
        inner: S,
        meter: Meter,
        accounting: Option<UsageAccounting>,
    }

    impl<S> PinnedDrop for MeteredStream<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(accounting) = this.accounting.take() {
                accounting.complete(this.meter.finish());
            }
        }
    }
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, meter: Meter, accounting: UsageAccounting) -> Self {
        Self {
            inner,
            meter,
            accounting: Some(accounting),
        }
    }
}

impl<S, E> Stream for MeteredStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.meter.feed(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!(error = %e, "upstream stream error");
                if let Some(accounting) = this.accounting.take() {
                    accounting.complete(this.meter.finish());
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(accounting) = this.accounting.take() {
                    accounting.complete(this.meter.finish());
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
