//! Usage statistics sink
//!
//! Records are append-only. Outgoing records describe tokens served to a
//! client; incoming records (optional) note each admitted request. Writes are
//! best effort: a failing sink is logged and never fails the request that
//! produced the record.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use device_auth::RollingTokenVerifier;
use key_pool::{ModelKind, QueryType, count_words};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// One statistics row.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub device_id: String,
    pub app_name: String,
    pub tokens: u64,
    pub query_type: String,
    pub model: String,
}

impl UsageRecord {
    pub fn outgoing(
        device_id: impl Into<String>,
        app_name: impl Into<String>,
        tokens: u64,
        query_type: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            direction: Direction::Outgoing,
            device_id: device_id.into(),
            app_name: app_name.into(),
            tokens,
            query_type: query_type.into(),
            model: model.into(),
        }
    }

    pub fn incoming(
        device_id: impl Into<String>,
        app_name: impl Into<String>,
        query_type: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            direction: Direction::Incoming,
            ..Self::outgoing(device_id, app_name, 0, query_type, model)
        }
    }
}

/// Destination for usage records.
pub trait UsageSink: Send + Sync {
    fn record(
        &self,
        record: UsageRecord,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + '_>>;
}

/// Writes one JSON object per line to an append-only file.
pub struct JsonlUsageSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlUsageSink {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        info!(path = %path.display(), "usage statistics file opened");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UsageSink for JsonlUsageSink {
    fn record(
        &self,
        record: UsageRecord,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            let mut file = self.file.lock().await;
            file.write_all(&line).await?;
            file.flush().await
        })
    }
}

/// Sink used when no statistics file is configured.
pub struct LogUsageSink;

impl UsageSink for LogUsageSink {
    fn record(
        &self,
        record: UsageRecord,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + '_>> {
        Box::pin(async move {
            info!(
                direction = ?record.direction,
                device_id = %record.device_id,
                app_name = %record.app_name,
                tokens = record.tokens,
                query_type = %record.query_type,
                model = %record.model,
                "usage statistics"
            );
            Ok(())
        })
    }
}

/// Body of `POST /api/statistics/chat`: words a client produced locally that
/// should be counted as served tokens.
#[derive(Debug, Deserialize)]
pub struct ChatStatistics {
    pub device_id: String,
    pub app_name: String,
    pub word_list: Vec<String>,
    pub type_model: String,
}

#[derive(Debug, Serialize)]
pub struct ChatStatisticsReply {
    pub tokens: u64,
    pub device_id: String,
    pub type_model: String,
}

/// Count `word_list` with the model's tokenizer and write an outgoing record.
///
/// Only the statistics sink is touched; the usage ledger is left alone.
pub async fn record_chat_statistics(
    verifier: Option<&RollingTokenVerifier>,
    sink: &dyn UsageSink,
    request_headers: &HeaderMap,
    body: &[u8],
) -> Result<ChatStatisticsReply, ApiError> {
    headers::authenticate(verifier, request_headers)?;
    let payload: ChatStatistics = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid statistics body: {e}")))?;
    let model: ModelKind = payload.type_model.parse()?;

    let tokens = count_words(model.tokenizer(), &payload.word_list);
    let record = UsageRecord::outgoing(
        payload.device_id.as_str(),
        payload.app_name.as_str(),
        tokens,
        QueryType::Chat.as_str(),
        model.as_str(),
    );
    if let Err(e) = sink.record(record).await {
        warn!(error = %e, "failed to write chat statistics");
    }

    Ok(ChatStatisticsReply {
        tokens,
        device_id: payload.device_id,
        type_model: payload.type_model,
    })
}
