//! Dispatch loop
//!
//! Admits a request against the usage ledger, then tries upstream credentials
//! one at a time until one is accepted:
//!
//! 1. Select a live credential (pinned first, then round-robin)
//! 2. Forward the request with the credential as a bearer token
//! 3. 401 → retire the credential and go back to 1
//! 4. Anything else → return it to the caller as-is
//!
//! The number of attempts is fixed up front by the attempt budget. Running
//! out of live credentials is a 503 and raises an operator alert once per
//! outage.
//! Successful chat responses are wrapped in a `MeteredStream` so usage is
//! charged once the body has been fully produced.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::Response;
use device_auth::RollingTokenVerifier;
use key_pool::{
    ApiKey, CredentialSelector, QueryType, RoutingContext, StreamTokenCounter, UpstreamOutcome,
    UsageLedger, classify_status,
};
use tracing::{debug, error, info, instrument, warn};

use crate::error::ApiError;
use crate::headers;
use crate::metered::{Meter, MeteredStream, UsageAccounting};
use crate::metrics;
use crate::stats::{UsageRecord, UsageSink};

/// Largest request body accepted from a client.
const MAX_REQUEST_BODY: usize = 10 * 1024 * 1024;

/// Which request bodies an endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPolicy {
    /// `/api/proxy`: streamed or not, as the body asks.
    Any,
    /// `/api/proxy/no-stream`: body must declare `"stream": false`.
    NoStreamOnly,
}

impl StreamPolicy {
    fn route(self) -> &'static str {
        match self {
            StreamPolicy::Any => "proxy",
            StreamPolicy::NoStreamOnly => "proxy_no_stream",
        }
    }
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub selector: Arc<CredentialSelector>,
    pub ledger: Arc<UsageLedger>,
    /// `None` when device authentication is disabled.
    pub verifier: Option<Arc<RollingTokenVerifier>>,
    pub stats: Arc<dyn UsageSink>,
    pub record_incoming: bool,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Proxy an inbound request through the dispatch loop.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    request_id: String,
    policy: StreamPolicy,
) -> Response {
    let started = Instant::now();
    let _in_flight = InFlight::enter(&state.in_flight);
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let response = match dispatch(state, request, policy).await {
        Ok(response) => response,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            e.to_response(&request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        policy.route(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn dispatch(
    state: &ProxyState,
    request: axum::http::Request<Body>,
    policy: StreamPolicy,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();

    headers::authenticate(state.verifier.as_deref(), &parts.headers)?;
    let ctx = headers::routing_context(&parts.headers)?;

    let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;
    if policy == StreamPolicy::NoStreamOnly && !declares_no_stream(&body) {
        return Err(ApiError::BadRequest("stream type not supported".into()));
    }

    state
        .ledger
        .admission_check(&ctx.usage_key(), ctx.model.quota_class())
        .await?;
    if state.record_incoming {
        record_incoming(Arc::clone(&state.stats), &ctx);
    }

    let url = format!(
        "{}{}",
        state.upstream_url.trim_end_matches('/'),
        ctx.query_type.endpoint_path()
    );
    let budget = state.selector.attempt_budget(&ctx);

    for attempt in 1..=budget {
        let key = match state.selector.select_for(&ctx).await {
            Ok(key) => key,
            Err(key_pool::Error::NoLiveCredential) => break,
            Err(e) => return Err(e.into()),
        };
        debug!(attempt, budget, credential_id = key.id(), "dispatching upstream");

        let upstream = state
            .client
            .request(parts.method.clone(), &url)
            .headers(headers::upstream_headers(&parts.headers, key.expose())?)
            .body(body.clone())
            .send()
            .await
            .map_err(|e| {
                let error_type = if e.is_connect() { "connect" } else { "request" };
                metrics::record_upstream_error(error_type);
                error!(credential_id = key.id(), error = %e, "upstream request failed");
                ApiError::UpstreamTransport(e.without_url().to_string())
            })?;

        let status = upstream.status();
        match classify_status(status.as_u16()) {
            UpstreamOutcome::CredentialRejected => {
                metrics::record_upstream_error("credential_rejected");
                retire(state, &key, attempt).await;
                continue;
            }
            UpstreamOutcome::Success => {
                info!(
                    attempt,
                    credential_id = key.id(),
                    status = status.as_u16(),
                    "upstream accepted request"
                );
                let accounting = (ctx.query_type == QueryType::Chat).then(|| UsageAccounting {
                    ledger: Arc::clone(&state.ledger),
                    stats: Arc::clone(&state.stats),
                    ctx: ctx.clone(),
                });
                return Ok(forward_response(upstream, &ctx, accounting));
            }
            UpstreamOutcome::BusinessError => {
                metrics::record_upstream_error("upstream_status");
                warn!(
                    attempt,
                    credential_id = key.id(),
                    status = status.as_u16(),
                    "upstream returned error, passing through"
                );
                return Ok(forward_response(upstream, &ctx, None));
            }
        }
    }

    error!(
        device_id = %ctx.device_id,
        budget,
        "no live upstream credential left"
    );
    state.selector.pool().alert_exhausted();
    Err(ApiError::AllCredentialsExhausted)
}

async fn retire(state: &ProxyState, key: &ApiKey, attempt: usize) {
    warn!(attempt, credential_id = key.id(), "upstream rejected credential");
    if let Err(e) = state.selector.pool().retire(key).await {
        // Selection re-reads the store, so an unrecorded retirement can
        // resurface; the attempt budget still bounds the loop.
        error!(credential_id = key.id(), error = %e, "failed to retire credential");
    }
}

/// Whether the request body explicitly declares `"stream": false`.
fn declares_no_stream(body: &Bytes) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(serde_json::Value::as_bool))
        == Some(false)
}

fn record_incoming(stats: Arc<dyn UsageSink>, ctx: &RoutingContext) {
    let record = UsageRecord::incoming(
        ctx.device_id.as_str(),
        ctx.app_name.as_str(),
        ctx.query_type.as_str(),
        ctx.model.as_str(),
    );
    tokio::spawn(async move {
        if let Err(e) = stats.record(record).await {
            warn!(error = %e, "failed to write incoming statistics");
        }
    });
}

/// Stream the upstream response back to the caller, metering it when
/// `accounting` is set.
fn forward_response(
    upstream: reqwest::Response,
    ctx: &RoutingContext,
    accounting: Option<UsageAccounting>,
) -> Response {
    let mut response = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if !headers::is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }

    let is_event_stream = upstream
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    let body = match accounting {
        Some(accounting) => {
            if let Some(encoding) = upstream.headers().get(axum::http::header::CONTENT_ENCODING) {
                warn!(?encoding, "upstream sent an encoded body, token count may be zero");
            }
            let meter = if is_event_stream {
                Meter::event_stream(StreamTokenCounter::new(Box::new(ctx.model.tokenizer())))
            } else {
                Meter::json()
            };
            Body::from_stream(MeteredStream::new(
                upstream.bytes_stream(),
                meter,
                accounting,
            ))
        }
        None => Body::from_stream(upstream.bytes_stream()),
    };

    response.body(body).unwrap_or_else(|e| {
        error!(error = %e, "failed to build response");
        let mut fallback = Response::new(Body::empty());
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}
