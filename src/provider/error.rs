//! Error types for image generation backends.
//!
//! [`ProviderError`] splits failures into the transient class, which the
//! retry client absorbs with backoff, and everything else, which makes the
//! fallback orchestrator step down one tier.

use thiserror::Error;

use super::Tier;

/// HTTP statuses treated as overload/unavailability and retried.
pub const TRANSIENT_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Overload status or connection-level failure. Retryable.
    /// `status` is `None` for connection failures.
    #[error("transient failure{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Transient { status: Option<u16>, message: String },

    /// Non-retryable HTTP status from the backend.
    #[error("http_{status}: {message}")]
    Rejected { status: u16, message: String },

    /// Any other non-retryable failure (malformed response, bad payload).
    #[error("{0}")]
    Permanent(String),

    /// The tier has no credentials or model configured.
    #[error("{0}_not_configured")]
    NotConfigured(Tier),

    /// The upstream job reached its failed state.
    #[error("upstream_task_failed: {0}")]
    UpstreamFailed(String),

    /// The poll loop ran out of attempts before a terminal status.
    #[error("task_timeout after {attempts} polls")]
    PollTimeout { attempts: u32 },

    /// The result could not be written to the artifact store.
    #[error("artifact_error: {0}")]
    Artifact(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    /// Short class of the failure, safe to log. The display text may carry
    /// upstream response bodies and belongs only in the job's trail.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transient { .. } => "transient",
            ProviderError::Rejected { .. } => "rejected",
            ProviderError::Permanent(_) => "permanent",
            ProviderError::NotConfigured(_) => "not_configured",
            ProviderError::UpstreamFailed(_) => "upstream_failed",
            ProviderError::PollTimeout { .. } => "poll_timeout",
            ProviderError::Artifact(_) => "artifact",
        }
    }

    /// HTTP status behind the failure, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Transient { status, .. } => *status,
            ProviderError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify an HTTP status returned by a backend.
    pub fn from_status(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        if TRANSIENT_STATUSES.contains(&status) {
            ProviderError::Transient {
                status: Some(status),
                message: snippet,
            }
        } else {
            ProviderError::Rejected {
                status,
                message: snippet,
            }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        // Connection refused, DNS, timeouts: no response was produced.
        if err.is_connect() || err.is_timeout() || err.is_request() {
            ProviderError::Transient {
                status: None,
                message: err.without_url().to_string(),
            }
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), "")
        } else {
            ProviderError::Permanent(err.without_url().to_string())
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        ProviderError::Artifact(err.to_string())
    }
}
