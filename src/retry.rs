//! Outbound HTTP with bounded exponential-backoff retry.
//!
//! Every remote provider call goes through [`RetryClient`]. A request is built
//! once into an [`OutboundRequest`] and the identical method, headers and body
//! are replayed on each attempt. Only [`ProviderError::Transient`] failures
//! (overload statuses, connection-level errors) are retried.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::provider::ProviderError;

/// Retry behaviour for a single outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles on each further failure.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(800),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (1-indexed).
    /// delay = base_delay * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt.saturating_sub(1))
    }
}

/// A fully built request, replayed unchanged across attempts.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers,
            body: None,
        }
    }

    pub fn post_json(
        url: impl Into<String>,
        mut headers: HeaderMap,
        body: &impl Serialize,
    ) -> Result<Self, ProviderError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| ProviderError::Permanent(format!("request_encoding: {e}")))?;
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Ok(Self {
            method: Method::POST,
            url: url.into(),
            headers,
            body: Some(bytes),
        })
    }
}

pub struct RetryClient {
    client: Client,
    policy: RetryPolicy,
}

impl RetryClient {
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Permanent(format!("http_client: {e}")))?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `req`, retrying transient failures with exponential backoff.
    pub async fn call(&self, req: &OutboundRequest) -> Result<Vec<u8>, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.send_once(req).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        status = ?err.status(),
                        "transient provider failure, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(attempt, error_kind = err.kind(), status = ?err.status(), "provider call failed");
                    return Err(err);
                }
            }
        }
    }

    /// Execute `req` and decode the JSON response body.
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        req: &OutboundRequest,
    ) -> Result<T, ProviderError> {
        let body = self.call(req).await?;
        serde_json::from_slice(&body)
            .map_err(|e| ProviderError::Permanent(format!("malformed_response: {e}")))
    }

    async fn send_once(&self, req: &OutboundRequest) -> Result<Vec<u8>, ProviderError> {
        let mut builder = self
            .client
            .request(req.method.clone(), &req.url)
            .headers(req.headers.clone());
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), &text));
        }
        Ok(response.bytes().await?.to_vec())
    }
}
