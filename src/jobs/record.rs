use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::CallerId;
use crate::provider::{GenerationConstraints, Tier};

const ID_PREFIX: &str = "tsk_";

/// Job identifier: `tsk_` followed by 32 lowercase hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(format!("{ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Accepts only well-formed ids, so an id is always safe to use as a
    /// file name.
    pub fn parse(raw: &str) -> Option<Self> {
        let hex = raw.strip_prefix(ID_PREFIX)?;
        let well_formed = hex.len() == 32
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded failure cause, tagged with the tier that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub tier: Tier,
    pub cause: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tier, self.cause)
    }
}

/// Immutable inputs of a job, fixed at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub prompt: String,
    /// One-way digest of the prompt; the only form of it that is ever logged.
    pub prompt_fingerprint: String,
    pub constraints: GenerationConstraints,
    pub caller: CallerId,
    pub tier: Tier,
    pub style: Option<String>,
}

impl JobSpec {
    pub fn new(
        prompt: String,
        style: Option<String>,
        constraints: GenerationConstraints,
        caller: CallerId,
        tier: Tier,
    ) -> Self {
        Self {
            prompt_fingerprint: prompt_fingerprint(&prompt),
            prompt,
            constraints,
            caller,
            tier,
            style,
        }
    }
}

/// A generation job and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub status: JobStatus,
    /// In [0, 1]; never decreases.
    pub progress: f32,
    /// Present iff `status == Completed`.
    pub result_ref: Option<String>,
    /// Ordered failure causes. May be non-empty on a completed job.
    pub diagnostics: Vec<Diagnostic>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            spec,
            status: JobStatus::Pending,
            progress: 0.0,
            result_ref: None,
            diagnostics: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Trail rendered as `tier:cause` entries joined by `; `.
    pub fn diagnostic_summary(&self) -> Option<String> {
        if self.diagnostics.is_empty() {
            return None;
        }
        Some(
            self.diagnostics
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Caller-facing snapshot returned by a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: Some(job.progress),
            result_ref: job.result_ref.clone(),
            error: job.diagnostic_summary(),
        }
    }
}

/// First 16 hex chars of the blake3 digest.
pub fn prompt_fingerprint(prompt: &str) -> String {
    let digest = blake3::hash(prompt.as_bytes());
    hex::encode(&digest.as_bytes()[..8])
}
