//! In-memory job store with single-writer ownership.
//!
//! [`JobStore::create`] hands out exactly one [`JobWriter`] per job. The writer
//! is not `Clone`, so the execution context that owns it is the only code that
//! can mutate the record. Readers get cloned snapshots taken under the shard
//! lock, so a poll never sees a half-applied update. Dropping a writer
//! before the job reaches a terminal status fails the job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::warn;

use super::lifecycle::LifecycleError;
use super::record::{Diagnostic, Job, JobId, JobSpec};

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: DashMap<JobId, Job>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending job and return its snapshot plus the sole writer.
    pub fn create(self: &Arc<Self>, spec: JobSpec) -> (Job, JobWriter) {
        let job = Job::new(spec.clone());
        let writer = JobWriter {
            store: Arc::clone(self),
            id: job.id.clone(),
            spec,
        };
        self.jobs.insert(job.id.clone(), job.clone());
        (job, writer)
    }

    /// Copy-on-read snapshot.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drop terminal jobs last updated before `cutoff`. Jobs still owned by
    /// a running writer are never terminal, so they are never evicted.
    pub fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|entry| entry.status.is_terminal() && entry.updated_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.jobs
                .remove_if(id, |_, job| job.status.is_terminal() && job.updated_at < cutoff);
        }
        expired
    }
}

/// Cause recorded when a writer goes away while its job is still live.
pub const ABANDONED_CAUSE: &str = "internal: execution_abandoned";

/// Exclusive mutation handle for one job.
#[derive(Debug)]
pub struct JobWriter {
    store: Arc<JobStore>,
    id: JobId,
    spec: JobSpec,
}

impl JobWriter {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    fn mutate(
        &self,
        apply: impl FnOnce(&mut Job) -> Result<(), LifecycleError>,
    ) -> Result<(), LifecycleError> {
        let mut entry = self.store.jobs.get_mut(&self.id).ok_or(LifecycleError::Missing)?;
        apply(&mut entry)
    }

    pub fn begin_processing(&self) -> Result<(), LifecycleError> {
        self.mutate(Job::begin_processing)
    }

    pub fn advance(&self, progress: f32) -> Result<(), LifecycleError> {
        self.mutate(|job| job.advance(progress))
    }

    pub fn complete(self, result_ref: String, diagnostics: Vec<Diagnostic>) -> Result<(), LifecycleError> {
        self.mutate(|job| job.complete(result_ref, diagnostics))
    }

    pub fn fail(self, diagnostics: Vec<Diagnostic>) -> Result<(), LifecycleError> {
        self.mutate(|job| job.fail(diagnostics))
    }

    /// Fail the job from its current live state with a single extra cause.
    pub fn abandon(self, cause: impl Into<String>) -> Result<(), LifecycleError> {
        let cause = Diagnostic {
            tier: self.spec.tier,
            cause: cause.into(),
        };
        self.mutate(|job| job.abandon(cause))
    }
}

impl Drop for JobWriter {
    fn drop(&mut self) {
        let Some(mut job) = self.store.jobs.get_mut(&self.id) else {
            return;
        };
        if job.status.is_terminal() {
            return;
        }
        let cause = Diagnostic {
            tier: self.spec.tier,
            cause: ABANDONED_CAUSE.to_string(),
        };
        if job.abandon(cause).is_ok() {
            warn!(job_id = %self.id, "job dropped before finishing, marked failed");
        }
    }
}
