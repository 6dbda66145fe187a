//! Admin API for credential and quota management
//!
//! Served on a separate listener (`server.admin_addr`) that should only be
//! reachable by operators.
//!
//! Endpoints:
//! - GET    /admin/credentials               list credentials with status
//! - DELETE /admin/credentials/{id}/retired  reinstate a retired credential
//! - GET    /admin/usage?app=&device=&model= current usage for one ledger key
//! - PUT    /admin/usage                     overwrite usage for one ledger key

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use key_pool::{CredentialPool, ModelKind, UsageKey, UsageLedger};
use serde::Deserialize;
use tracing::info;

use crate::error::ApiError;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<CredentialPool>,
    ledger: Arc<UsageLedger>,
}

impl AdminState {
    pub fn new(pool: Arc<CredentialPool>, ledger: Arc<UsageLedger>) -> Self {
        Self { pool, ledger }
    }
}

/// Build the admin router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/credentials", get(list_credentials))
        .route("/admin/credentials/{id}/retired", delete(reinstate_credential))
        .route("/admin/usage", get(get_usage).put(put_usage))
        .with_state(state)
}

fn json_ok(body: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /admin/credentials: fingerprints and status, never the secrets.
async fn list_credentials(State(state): State<AdminState>) -> Result<Response, ApiError> {
    let retired = state.pool.retired_ids().await?;
    let status = |id: &str| if retired.contains(id) { "retired" } else { "live" };

    let credentials: Vec<serde_json::Value> = state
        .pool
        .keys()
        .iter()
        .map(|k| {
            serde_json::json!({
                "id": k.id(),
                "masked": k.masked(),
                "status": status(k.id()),
            })
        })
        .collect();
    let mut pinned: Vec<serde_json::Value> = state
        .pool
        .pinned()
        .iter()
        .map(|(pin, k)| {
            serde_json::json!({
                "pin": pin,
                "id": k.id(),
                "masked": k.masked(),
                "status": status(k.id()),
            })
        })
        .collect();
    pinned.sort_by(|a, b| a["pin"].as_str().cmp(&b["pin"].as_str()));

    Ok(json_ok(serde_json::json!({
        "credentials": credentials,
        "pinned": pinned,
    })))
}

/// DELETE /admin/credentials/{id}/retired: return a credential to rotation.
async fn reinstate_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !state.pool.knows(&id) {
        return Err(ApiError::NotFound(format!("unknown credential: {id}")));
    }
    let was_retired = state.pool.reinstate(&id).await?;
    info!(credential_id = %id, was_retired, "credential reinstated via admin API");
    Ok(json_ok(serde_json::json!({
        "id": id,
        "status": "live",
        "was_retired": was_retired,
    })))
}

#[derive(Deserialize)]
struct UsageQuery {
    app: String,
    device: String,
    model: String,
}

impl UsageQuery {
    fn usage_key(&self) -> Result<UsageKey, ApiError> {
        let model: ModelKind = self.model.parse()?;
        Ok(UsageKey::new(self.app.as_str(), self.device.as_str(), model))
    }
}

/// GET /admin/usage: tokens used in the current window for one key.
async fn get_usage(
    State(state): State<AdminState>,
    Query(query): Query<UsageQuery>,
) -> Result<Response, ApiError> {
    let key = query.usage_key()?;
    let tokens = state.ledger.current_usage(&key).await?.unwrap_or(0);
    let remaining = state.ledger.remaining_window(&key).await?;
    let ceiling = state.ledger.limits().ceiling(key.model.quota_class());

    Ok(json_ok(serde_json::json!({
        "app": key.app_name,
        "device": key.device_id,
        "model": key.model.as_str(),
        "tokens": tokens,
        "ceiling": ceiling,
        "remaining_secs": remaining.map(|d| d.as_secs()),
    })))
}

#[derive(Deserialize)]
struct UsageOverride {
    app: String,
    device: String,
    model: String,
    tokens: u64,
}

/// PUT /admin/usage: overwrite usage and start a fresh window.
async fn put_usage(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<UsageOverride>,
) -> Result<Response, ApiError> {
    let model: ModelKind = body.model.parse()?;
    let key = UsageKey::new(body.app, body.device, model);
    state.ledger.override_usage(&key, body.tokens).await?;
    info!(
        app_name = %key.app_name,
        device_id = %key.device_id,
        model = %key.model,
        tokens = body.tokens,
        "usage overridden via admin API"
    );

    Ok(json_ok(serde_json::json!({
        "app": key.app_name,
        "device": key.device_id,
        "model": key.model.as_str(),
        "tokens": body.tokens,
        "window_secs": state.ledger.window().as_secs(),
    })))
}
