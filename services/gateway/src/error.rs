//! Request-level error taxonomy and its HTTP mapping
//!
//! Every error leaves the gateway as
//! `{"error":{"type","code","message","request_id"}}`. Upstream business
//! errors never become an `ApiError`: those responses are passed through
//! verbatim by the dispatch loop.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use key_pool::QuotaClass;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Unauthorized, token not valid")]
    Unauthenticated,

    #[error("{message}")]
    QuotaExceeded { class: QuotaClass, message: String },

    #[error("Service temporarily unavailable")]
    AllCredentialsExhausted,

    #[error("upstream error: {0}")]
    UpstreamTransport(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::AllCredentialsExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "invalid_request_error",
            ApiError::Unauthenticated => "authentication_error",
            ApiError::QuotaExceeded { .. } => "rate_limit_error",
            ApiError::AllCredentialsExhausted => "service_unavailable",
            ApiError::UpstreamTransport(_) => "upstream_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Machine-readable code. Quota rejections carry a per-tier code.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Unauthenticated => "invalid_device_token",
            ApiError::QuotaExceeded { class, .. } => class.error_code(),
            ApiError::AllCredentialsExhausted => "all_credentials_exhausted",
            ApiError::UpstreamTransport(_) => "upstream_unreachable",
            ApiError::NotFound(_) => "not_found",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Render as a JSON error response tagged with `request_id`.
    pub fn to_response(&self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "code": self.code(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
        self.to_response(&request_id)
    }
}

impl From<key_pool::Error> for ApiError {
    fn from(err: key_pool::Error) -> Self {
        match err {
            key_pool::Error::NoLiveCredential => ApiError::AllCredentialsExhausted,
            key_pool::Error::QuotaExceeded { class, .. } => ApiError::QuotaExceeded {
                class,
                message: err.to_string(),
            },
            key_pool::Error::Unknown { .. } => ApiError::BadRequest(err.to_string()),
            key_pool::Error::Store(_) | key_pool::Error::Alert(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<device_auth::Error> for ApiError {
    fn from(err: device_auth::Error) -> Self {
        match err {
            device_auth::Error::MissingToken => {
                ApiError::BadRequest("missing header: authorization".into())
            }
            device_auth::Error::InvalidToken { .. } => ApiError::Unauthenticated,
            device_auth::Error::InvalidOffset(_) => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn response_carries_all_fields() {
        let response = ApiError::BadRequest("missing header: device-id".into())
            .to_response("req_abc123");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["code"], "bad_request");
        assert_eq!(json["error"]["message"], "missing header: device-id");
        assert_eq!(json["error"]["request_id"], "req_abc123");
    }

    #[tokio::test]
    async fn quota_error_uses_tier_code() {
        let err: ApiError = key_pool::Error::QuotaExceeded {
            class: QuotaClass::Premium,
            used: 150,
            ceiling: 100,
        }
        .into();
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);

        let json = body_json(err.to_response("req_1")).await;
        assert_eq!(json["error"]["code"], "premium_quota_exceeded");
        assert_eq!(
            json["error"]["message"],
            "GPT-4 tokens limit exceeded: 150 used, ceiling 100"
        );
    }

    #[test]
    fn no_live_credential_is_503_not_429() {
        let err: ApiError = key_pool::Error::NoLiveCredential.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "all_credentials_exhausted");
    }

    #[test]
    fn device_auth_errors_map_to_400_and_401() {
        let missing: ApiError = device_auth::Error::MissingToken.into();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let invalid: ApiError = device_auth::Error::InvalidToken {
            device_id: "dev".into(),
        }
        .into();
        assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn unknown_model_is_bad_request() {
        let err: ApiError = "gpt-5".parse::<key_pool::ModelKind>().unwrap_err().into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "unknown model: gpt-5");
    }
}
