//! Error types for key rotation and quota operations

use crate::routing::QuotaClass;

/// Errors from pool, selector, ledger and store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no live upstream credential")]
    NoLiveCredential,

    #[error("{} tokens limit exceeded: {used} used, ceiling {ceiling}", class.label())]
    QuotaExceeded {
        class: QuotaClass,
        used: u64,
        ceiling: u64,
    },

    #[error("unknown {kind}: {value}")]
    Unknown { kind: &'static str, value: String },

    #[error("shared store error: {0}")]
    Store(String),

    #[error("alert delivery failed: {0}")]
    Alert(String),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Store(err.to_string())
    }
}

/// Result alias for key-pool operations.
pub type Result<T> = std::result::Result<T, Error>;
