//! Prometheus metrics exposition
//!
//! Gateway-level series:
//!
//! - `gateway_requests_total` (counter): labels `status`, `route`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//! - `gateway_tokens_recorded_total` (counter): label `model`
//!
//! `gateway_credentials_retired_total` and `gateway_quota_rejections_total`
//! are emitted by the key-pool crate through the same global recorder.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets from 5ms to 5 minutes. Streamed completions routinely
/// run for tens of seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Process-local counters surfaced on `/health`.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being processed, reported if the drain times out.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("gateway_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `gateway_request_duration_seconds` is configured with explicit buckets so
/// it renders as a histogram rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed gateway request.
pub fn record_request(status: u16, route: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str.clone(), "route" => route.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream failure with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record tokens charged to the usage ledger.
pub fn record_tokens(model: &str, tokens: u64) {
    metrics::counter!("gateway_tokens_recorded_total", "model" => model.to_string())
        .increment(tokens);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "proxy", 0.05);
        record_upstream_error("connect");
        record_tokens("gpt-4", 12);
    }

    /// Isolated recorder/handle pair. `install_recorder()` may only succeed
    /// once per process, so tests use a local recorder instead.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "proxy", 0.042);
        record_request(429, "proxy_no_stream", 0.001);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("route=\"proxy\""));
        assert!(output.contains("status=\"429\""));
        assert!(output.contains("route=\"proxy_no_stream\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines"
        );
    }

    #[test]
    fn upstream_errors_and_tokens_carry_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("connect");
        record_upstream_error("credential_rejected");
        record_tokens("gpt-3.5-turbo", 30);
        record_tokens("gpt-3.5-turbo", 12);

        let output = handle.render();
        assert!(output.contains("error_type=\"connect\""));
        assert!(output.contains("error_type=\"credential_rejected\""));
        assert!(
            output.contains("gateway_tokens_recorded_total{model=\"gpt-3.5-turbo\"} 42"),
            "got: {output}"
        );
    }

    #[test]
    fn histogram_buckets_cover_streaming_range() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "proxy", 0.003);

        let output = handle.render();
        assert!(output.contains("le=\"0.005\""), "5ms bucket must exist");
        assert!(output.contains("le=\"300\""), "5 minute bucket must exist");
        assert!(output.contains("le=\"+Inf\""));
    }

    #[test]
    fn key_pool_counters_share_the_recorder() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::counter!("gateway_credentials_retired_total").increment(1);
        assert!(handle.render().contains("gateway_credentials_retired_total 1"));
    }
}
