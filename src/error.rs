use thiserror::Error;

use crate::quota::Plan;

/// Errors surfaced to callers of the gateway.
///
/// Every variant maps to exactly one caller-visible error code. Provider
/// failures never appear here: they are absorbed by the fallback chain and
/// kept in the job's own diagnostic trail.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("too many requests from origin")]
    RateLimited,

    #[error("daily {plan} quota exceeded")]
    QuotaExceeded { plan: Plan },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "invalid_request",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::JobNotFound(_) => "not_found",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to hand back to a caller. Internal detail is dropped.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Internal(_) => "Internal server error".to_string(),
            GatewayError::RateLimited => "Too many requests from IP".to_string(),
            GatewayError::QuotaExceeded { plan } => format!("Daily {plan} quota exceeded"),
            GatewayError::JobNotFound(_) => "task not found".to_string(),
            GatewayError::Validation(msg) => msg.clone(),
        }
    }
}
