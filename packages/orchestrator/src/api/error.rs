use crate::error::{SandboxError, ServiceFailure};
use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Seconds a client should back off after port exhaustion
const RETRY_AFTER_SECS: u64 = 30;

/// Error type returned by every API handler
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Malformed request body: {0}")]
    BadRequest(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Structured error response format for API consistency
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
    request_id: String,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failures: Option<Vec<ServiceFailure>>,
}

impl ApiError {
    fn to_status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Sandbox(err) => match err {
                SandboxError::ResourceExhausted(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "RESOURCE_EXHAUSTED")
                }
                SandboxError::UnknownService(_) => (StatusCode::BAD_REQUEST, "UNKNOWN_SERVICE"),
                SandboxError::InvalidConfig { .. } => (StatusCode::BAD_REQUEST, "INVALID_CONFIG"),
                SandboxError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
                SandboxError::Launch { .. } => (StatusCode::BAD_GATEWAY, "LAUNCH_FAILED"),
                SandboxError::AllServicesFailed(_) => {
                    (StatusCode::BAD_GATEWAY, "ALL_SERVICES_FAILED")
                }
                SandboxError::NotFound(_) => (StatusCode::NOT_FOUND, "SANDBOX_NOT_FOUND"),
                SandboxError::Expired(_) => (StatusCode::GONE, "SANDBOX_EXPIRED"),
                SandboxError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
                SandboxError::QuotaExceeded { .. } => {
                    (StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED")
                }
                SandboxError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR"),
                SandboxError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
                }
            },
        }
    }

    /// Sanitized message; internal details stay in the logs
    fn to_user_message(&self) -> String {
        match self {
            ApiError::Sandbox(SandboxError::Storage(_)) => "Data storage error".to_string(),
            ApiError::Sandbox(SandboxError::Internal(_)) => {
                "An internal server error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = Uuid::new_v4().to_string();
        let (status_code, error_code) = self.to_status_and_code();
        let user_message = self.to_user_message();

        let mut retry_after = None;
        let mut failures = None;
        match &self {
            ApiError::Sandbox(SandboxError::Storage(_) | SandboxError::Internal(_)) => {
                error!(
                    request_id = %request_id,
                    error = %self,
                    "Internal server error occurred"
                );
            }
            ApiError::Sandbox(SandboxError::ResourceExhausted(msg)) => {
                retry_after = Some(RETRY_AFTER_SECS);
                warn!(
                    request_id = %request_id,
                    retry_after = RETRY_AFTER_SECS,
                    "Port pool exhausted: {}",
                    msg
                );
            }
            ApiError::Sandbox(SandboxError::AllServicesFailed(list)) => {
                failures = Some(list.clone());
                warn!(
                    request_id = %request_id,
                    "No service could be started: {:?}",
                    list
                );
            }
            _ => {
                info!(
                    request_id = %request_id,
                    error_code = %error_code,
                    error = %self,
                    "Request failed"
                );
            }
        }

        let body = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: error_code.to_string(),
                message: user_message,
                retry_after,
                failures,
            },
            request_id,
        };

        let mut response = (status_code, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn render(err: SandboxError) -> (StatusCode, Value) {
        let response = ApiError::from(err).into_response();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_exhaustion_is_retryable_503() {
        let (status, body) = render(SandboxError::ResourceExhausted("full".into())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "RESOURCE_EXHAUSTED");
        assert_eq!(body["error"]["retry_after"], RETRY_AFTER_SECS);
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let cases = [
            (SandboxError::UnknownService("jira".into()), StatusCode::BAD_REQUEST),
            (SandboxError::NotFound("sbx".into()), StatusCode::NOT_FOUND),
            (SandboxError::Expired("sbx".into()), StatusCode::GONE),
            (SandboxError::Forbidden("no".into()), StatusCode::FORBIDDEN),
            (
                SandboxError::QuotaExceeded {
                    owner_ref: "a".into(),
                    limit: 1,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, expected) in cases {
            let (status, body) = render(err).await;
            assert_eq!(status, expected);
            assert!(body["error"].get("retry_after").is_none());
        }
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let (status, body) = render(SandboxError::Internal("secret detail".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["message"], "An internal server error occurred");
    }
}
