//! API error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// Handler error carrying the HTTP status it should surface as. Anything
/// without a specific status becomes a logged 500 with a generic message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

impl From<gatewatch_core::Error> for ApiError {
    fn from(e: gatewatch_core::Error) -> Self {
        tracing::error!("Handler failed: {e}");
        ApiError::internal()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("Query failed: {e}");
        ApiError::internal()
    }
}

impl From<gatewatch_unifi::UnifiError> for ApiError {
    fn from(e: gatewatch_unifi::UnifiError) -> Self {
        let status = StatusCode::from_u16(e.api_status())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let message = match &e {
            gatewatch_unifi::UnifiError::Status { status: 403, .. } => {
                "Insufficient permissions. Ensure your controller API key belongs to a \
                 Local Admin account with Network permissions."
                    .to_string()
            }
            gatewatch_unifi::UnifiError::Status { status: 422, .. } => {
                "The controller rejected this change. The rule may have been modified \
                 or removed on the controller."
                    .to_string()
            }
            other => other.to_string(),
        };
        ApiError::new(status, message)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
