//! Error types for device authentication

/// Errors from device token verification.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing device token")]
    MissingToken,

    #[error("device token not valid for device {device_id}")]
    InvalidToken { device_id: String },

    #[error("invalid UTC offset: {0} hours")]
    InvalidOffset(i32),
}

/// Result alias for device auth operations.
pub type Result<T> = std::result::Result<T, Error>;
