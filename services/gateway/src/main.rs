//! Completion Gateway
//!
//! Single-binary Rust service that:
//! 1. Authenticates devices by rolling hash token
//! 2. Enforces per-device token quotas over a fixed window
//! 3. Rotates a pool of upstream API keys, retiring any key upstream rejects
//! 4. Streams completions back while metering the tokens served

mod admin;
mod alert;
mod config;
mod error;
mod headers;
mod metered;
mod metrics;
mod proxy;
mod stats;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use device_auth::RollingTokenVerifier;
use key_pool::{
    Alerter, CredentialPool, CredentialSelector, LogAlerter, MemoryStore, RedisStore, SharedStore,
    UsageLedger,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::alert::TelegramAlerter;
use crate::config::{Config, StoreBackend};
use crate::error::ApiError;
use crate::metrics::ServiceMetrics;
use crate::proxy::{ProxyState, StreamPolicy};
use crate::stats::{JsonlUsageSink, LogUsageSink, UsageSink};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/proxy", post(proxy_handler))
        .route("/api/proxy/no-stream", post(no_stream_handler))
        .route("/api/statistics/chat", post(chat_statistics_handler))
        .fallback(not_found_handler)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting completion-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        upstream_url = %config.upstream.base_url,
        credentials = config.upstream.api_keys.len(),
        pinned = config.upstream.pinned.len(),
        store = ?config.store.backend,
        auth_enabled = config.auth.enabled,
        "configuration loaded"
    );

    let store: Arc<dyn SharedStore> = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(Duration::from_secs(config.store.sweep_interval_secs));
            warn!("using in-process store; quotas and retirements are not shared between replicas");
            store
        }
        StoreBackend::Redis => {
            let url = config
                .store
                .redis_url
                .as_ref()
                .context("redis backend selected without a URL")?;
            Arc::new(
                RedisStore::connect(url.expose())
                    .await
                    .context("failed to connect to redis")?,
            )
        }
    };

    let client = reqwest::Client::new();

    let alerter: Arc<dyn Alerter> = match (
        config.alerts.chat_id.take(),
        config.alerts.bot_token.take(),
    ) {
        (Some(chat_id), Some(bot_token)) => {
            info!("operator alerts go to telegram");
            Arc::new(TelegramAlerter::new(
                client.clone(),
                config.alerts.api_base.as_str(),
                bot_token,
                chat_id,
            ))
        }
        _ => {
            info!("no telegram alert channel configured, alerts are logged only");
            Arc::new(LogAlerter)
        }
    };

    let pool = Arc::new(CredentialPool::new(
        std::mem::take(&mut config.upstream.api_keys),
        std::mem::take(&mut config.upstream.pinned),
        config.store.retired_set.as_str(),
        Arc::clone(&store),
        alerter,
    ));
    let selector = Arc::new(CredentialSelector::new(Arc::clone(&pool)));
    let ledger = Arc::new(UsageLedger::new(
        store,
        config.quota.window(),
        config.quota.limits(),
    ));

    let verifier = match config.auth.secret.take() {
        Some(secret) if config.auth.enabled => Some(Arc::new(
            RollingTokenVerifier::new(
                secret,
                config.auth.granularity,
                config.auth.skew_windows,
                config.auth.utc_offset_hours,
            )
            .context("invalid device auth settings")?,
        )),
        _ => {
            warn!("device authentication disabled");
            None
        }
    };

    let stats: Arc<dyn UsageSink> = match &config.stats.path {
        Some(path) => Arc::new(
            JsonlUsageSink::open(path)
                .await
                .with_context(|| format!("failed to open statistics file {}", path.display()))?,
        ),
        None => Arc::new(LogUsageSink),
    };

    let metrics = ServiceMetrics::new();

    let proxy_state = ProxyState {
        client,
        upstream_url: config.upstream.base_url.clone(),
        selector,
        ledger: Arc::clone(&ledger),
        verifier,
        stats,
        record_incoming: config.stats.record_incoming,
        requests_total: metrics.requests_total.clone(),
        errors_total: metrics.errors_total.clone(),
        in_flight: metrics.in_flight.clone(),
    };

    let app_state = AppState {
        proxy: proxy_state,
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    if let Some(admin_addr) = config.server.admin_addr {
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
        let admin_app = admin::build_admin_router(AdminState::new(pool, ledger));
        info!(addr = %admin_addr, "admin API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin_app).await {
                error!(error = %e, "admin server failed");
            }
        });
    }

    info!(addr = %listen_addr, "accepting requests");

    // Clone in_flight counter for drain observability after shutdown
    let in_flight = metrics.in_flight.clone();

    // The drain timeout starts when the shutdown signal fires: the server is
    // told to drain, then the drain is raced against DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: credential pool status plus process counters.
/// Returns 503 when no base credential is live or the store is unreachable.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.metrics.started_at.elapsed().as_secs();
    let requests = state.metrics.requests_total.load(Ordering::Relaxed);
    let errors = state.metrics.errors_total.load(Ordering::Relaxed);

    let mut body = match state.proxy.selector.pool().health().await {
        Ok(pool) => pool,
        Err(e) => {
            warn!(error = %e, "health check could not read credential pool");
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            })
        }
    };
    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    body["uptime_seconds"] = uptime.into();
    body["requests_served"] = requests.into();
    body["errors_total"] = errors.into();

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: returns metrics in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

async fn proxy_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::proxy_request(&state.proxy, request, new_request_id(), StreamPolicy::Any).await
}

async fn no_stream_handler(
    State(state): State<AppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    proxy::proxy_request(
        &state.proxy,
        request,
        new_request_id(),
        StreamPolicy::NoStreamOnly,
    )
    .await
}

async fn chat_statistics_handler(
    State(state): State<AppState>,
    request_headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let result = stats::record_chat_statistics(
        state.proxy.verifier.as_deref(),
        state.proxy.stats.as_ref(),
        &request_headers,
        &body,
    )
    .await;

    let response = match result {
        Ok(reply) => (StatusCode::OK, axum::Json(reply)).into_response(),
        Err(e) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            e.to_response(&new_request_id())
        }
    };
    metrics::record_request(response.status().as_u16(), "statistics_chat", 0.0);
    response
}

async fn not_found_handler(uri: axum::http::Uri) -> Response {
    ApiError::NotFound(format!("no route for {}", uri.path())).into_response()
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
