//! Image generation backends behind one capability interface.
//!
//! The set of backends is closed: [`Provider`] is an enum over the three
//! adapter shapes, so the fallback order in the orchestrator stays exhaustive.
//! Every adapter speaks the same two-step contract ([`Submission`] then
//! optionally [`PollStatus`]) and every result is materialised into the
//! artifact store before a reference is handed back.

pub mod error;
pub mod local;
pub mod remote_poll;
pub mod remote_sync;

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifact::{ArtifactRef, ArtifactStore};
use crate::jobs::JobId;

pub use error::ProviderError;
pub use local::LocalRenderer;
pub use remote_poll::{RemotePollAdapter, RemotePollSettings};
pub use remote_sync::{RemoteSyncAdapter, RemoteSyncSettings};

/// Default edge length when the caller does not ask for one.
pub const DEFAULT_SIZE: u32 = 1024;

/// Ranked provider category. Fallback only ever moves downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Premium,
    Standard,
    Local,
}

impl Tier {
    /// The tier attempted after this one fails. `Local` is the floor.
    pub fn next_lower(self) -> Option<Tier> {
        match self {
            Tier::Premium => Some(Tier::Standard),
            Tier::Standard => Some(Tier::Local),
            Tier::Local => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Premium => write!(f, "premium"),
            Tier::Standard => write!(f, "standard"),
            Tier::Local => write!(f, "local"),
        }
    }
}

/// Generation constraints extracted from the caller's free-form map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConstraints {
    /// Square edge length in pixels.
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
}

impl Default for GenerationConstraints {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE,
            negative_prompt: None,
        }
    }
}

impl GenerationConstraints {
    /// Lenient extraction: an unparsable `size` falls back to the default.
    /// Out-of-range integers saturate and are left to the plan bounds.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let size = match map.get("size") {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .map(|v| v.clamp(0, i64::from(u32::MAX)) as u32)
        .unwrap_or(DEFAULT_SIZE);

        let negative_prompt = map
            .get("negative_prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Self {
            size,
            negative_prompt,
        }
    }

    pub fn with_size_bounds(mut self, min: u32, max: u32) -> Self {
        self.size = self.size.clamp(min, max);
        self
    }
}

/// Raw output of a backend before it is materialised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResult {
    /// Externally hosted image that must be fetched into the artifact store.
    Hosted(String),
    /// Encoded image bytes.
    Inline(Vec<u8>),
}

impl ProviderResult {
    /// Interpret an image reference returned by a backend: either a
    /// `data:image/...;base64,` URI or a plain URL.
    pub fn from_reference(reference: &str) -> Result<Self, ProviderError> {
        let reference = reference.trim();
        if let Some(rest) = reference.strip_prefix("data:image/") {
            let (_, payload) = rest
                .split_once(',')
                .ok_or_else(|| ProviderError::Permanent("invalid_data_uri".into()))?;
            return Self::from_base64(payload);
        }
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Ok(ProviderResult::Hosted(reference.to_string()));
        }
        Err(ProviderError::Permanent("unrecognized_image_reference".into()))
    }

    pub fn from_base64(payload: &str) -> Result<Self, ProviderError> {
        BASE64
            .decode(payload.trim())
            .map(ProviderResult::Inline)
            .map_err(|e| ProviderError::Permanent(format!("invalid_base64_payload: {e}")))
    }
}

/// Opaque handle for a job running on an asynchronous backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle(pub String);

/// Outcome of submitting a prompt to a backend.
#[derive(Debug)]
pub enum Submission {
    Ready(ProviderResult),
    Pending(JobHandle),
}

/// Observed state of an asynchronous backend job.
#[derive(Debug, PartialEq, Eq)]
pub enum PollStatus {
    Queued,
    Running,
    Succeeded(ProviderResult),
    Failed(String),
}

/// Provider credential. Never printed.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().trim().to_string())
    }

    pub fn is_configured(&self) -> bool {
        !self.0.trim().is_empty()
    }

    pub(crate) fn bearer(&self) -> Result<HeaderValue, ProviderError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.0.trim()))
            .map_err(|_| ProviderError::Permanent("invalid_api_key_format".into()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_configured() {
            write!(f, "ApiKey(***)")
        } else {
            write!(f, "ApiKey(<unset>)")
        }
    }
}

/// One backend, dispatched statically.
pub enum Provider {
    RemoteSync(RemoteSyncAdapter),
    RemotePoll(RemotePollAdapter),
    Local(LocalRenderer),
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::RemoteSync(_) => "remote-sync",
            Provider::RemotePoll(_) => "remote-poll",
            Provider::Local(_) => "local",
        }
    }

    pub async fn submit(
        &self,
        prompt: &str,
        constraints: &GenerationConstraints,
    ) -> Result<Submission, ProviderError> {
        match self {
            Provider::RemoteSync(adapter) => adapter.submit(prompt, constraints).await,
            Provider::RemotePoll(adapter) => adapter.submit(prompt, constraints).await,
            Provider::Local(renderer) => renderer.submit(prompt, constraints).await,
        }
    }

    /// Run one full attempt: submit, wait if needed, then persist the image
    /// under `job_id`.
    pub async fn generate(
        &self,
        job_id: &JobId,
        prompt: &str,
        constraints: &GenerationConstraints,
        artifacts: &ArtifactStore,
    ) -> Result<ArtifactRef, ProviderError> {
        let result = match self.submit(prompt, constraints).await? {
            Submission::Ready(result) => result,
            Submission::Pending(handle) => match self {
                Provider::RemotePoll(adapter) => adapter.wait(&handle).await?,
                _ => {
                    return Err(ProviderError::Permanent(format!(
                        "{} returned a job handle but cannot be polled",
                        self.name()
                    )));
                }
            },
        };
        artifacts.materialize(job_id, result).await
    }
}
