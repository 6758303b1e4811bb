//! API error types and response handling.
//!
//! A unified error type for all API handlers with automatic conversion to
//! HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use eldsync_core::SyncError;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - Device or resource does not exist.
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - Not allowed in the current connection state.
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// The device or link failed: 499 cancelled, 502 link failure, 504 timeout.
    Device {
        /// HTTP status to answer with.
        status: u16,
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error - Unexpected server-side error.
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details.
        details: Option<String>,
    },

    /// 503 Service Unavailable - Bluetooth is off or missing.
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "invalid_bluetooth_address",
    "message": "Invalid Bluetooth MAC address: C4:A8",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "connect_failed").
    #[schema(example = "connect_failed")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Connection failed with status -1")]
    pub message: String,

    /// Optional additional details for debugging.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message, details) = match self {
            Self::BadRequest {
                error_code,
                message,
            } => (StatusCode::BAD_REQUEST, error_code, message, None),
            Self::NotFound {
                error_code,
                message,
            } => (StatusCode::NOT_FOUND, error_code, message, None),
            Self::Conflict {
                error_code,
                message,
            } => (StatusCode::CONFLICT, error_code, message, None),
            Self::Device {
                status,
                error_code,
                message,
            } => (
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                error_code,
                message,
                None,
            ),
            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_code,
                    message,
                    details.map(serde_json::Value::String),
                )
            }
            Self::ServiceUnavailable {
                error_code,
                message,
            } => (StatusCode::SERVICE_UNAVAILABLE, error_code, message, None),
        };

        (
            status,
            Json(ErrorResponse {
                error,
                message,
                details,
            }),
        )
            .into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest { message, .. } => write!(f, "Bad Request: {message}"),
            Self::NotFound { message, .. } => write!(f, "Not Found: {message}"),
            Self::Conflict { message, .. } => write!(f, "Conflict: {message}"),
            Self::Device {
                status, message, ..
            } => write!(f, "Device Error ({status}): {message}"),
            Self::InternalError { message, .. } => write!(f, "Internal Error: {message}"),
            Self::ServiceUnavailable { message, .. } => {
                write!(f, "Service Unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for ApiError {}

/// Convert from eldsync-core errors using their HTTP classification.
impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        let error_code = err.error_code().to_ascii_lowercase();
        let message = err.to_string();
        match err.http_status_code() {
            400 => Self::BadRequest {
                error_code,
                message,
            },
            404 => Self::NotFound {
                error_code,
                message,
            },
            409 => Self::Conflict {
                error_code,
                message,
            },
            503 => Self::ServiceUnavailable {
                error_code,
                message,
            },
            status @ (499 | 502 | 504) => Self::Device {
                status,
                error_code,
                message,
            },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eldsync_core::connection::ConnectionState;

    #[test]
    fn test_bad_request_error() {
        let err = ApiError::BadRequest {
            error_code: "test_error".to_string(),
            message: "Test message".to_string(),
        };
        assert!(err.to_string().contains("Bad Request"));
    }

    #[test]
    fn test_error_response_serialization() {
        let response = ErrorResponse {
            error: "test_error".to_string(),
            message: "Test message".to_string(),
            details: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test_error"));
    }

    #[test]
    fn test_sync_errors_map_to_statuses() {
        let cases = [
            (SyncError::DeviceNotFound("C4:A8:28:43:14:9A".into()), 404),
            (
                SyncError::InvalidTransition {
                    state: ConnectionState::Ready.to_string(),
                    event: "start_scan".into(),
                },
                409,
            ),
            (SyncError::BluetoothDisabled, 503),
            (SyncError::UnexpectedDisconnect, 502),
            (
                SyncError::Timeout {
                    phase: "authentication",
                    secs: 15,
                },
                504,
            ),
            (SyncError::Cancelled, 499),
        ];
        for (err, status) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status().as_u16(), status);
        }
    }

    #[test]
    fn test_error_codes_are_lowercase() {
        match ApiError::from(SyncError::UnexpectedDisconnect) {
            ApiError::Device { error_code, .. } => {
                assert_eq!(error_code, "unexpected_disconnect");
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
