use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use crate::error::GatewayError;

/// Uniform error body: `{error, message, code}` where `code` is the HTTP status.
pub fn json_error(
    status: StatusCode,
    error: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": error,
            "message": message.into(),
            "code": status.as_u16(),
        })),
    )
        .into_response()
}

pub fn gateway_error_to_response(err: GatewayError) -> axum::response::Response {
    let status = match &err {
        GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
        GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
        GatewayError::JobNotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Internal(_) => {
            error!(code = err.code(), "internal error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_error(status, err.code(), err.public_message())
}

/// Body for requests whose JSON could not be parsed into the expected shape.
pub fn malformed_request() -> axum::response::Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "invalid_request",
        "Request validation failed",
    )
}
