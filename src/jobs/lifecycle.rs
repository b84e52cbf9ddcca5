use chrono::Utc;
use thiserror::Error;

use super::record::{Diagnostic, Job, JobStatus};

/// A rejected job mutation. The job is left unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("progress {requested} is below current {current}")]
    ProgressRegressed { current: f32, requested: f32 },

    #[error("progress {0} is outside [0, 1]")]
    ProgressOutOfRange(f32),

    #[error("progress can only move while processing (status {0})")]
    NotProcessing(JobStatus),

    #[error("a failed job needs at least one diagnostic")]
    EmptyTrail,

    #[error("job record is gone")]
    Missing,
}

/// Legal status edges: Pending → Processing → {Completed, Failed}.
pub fn transition_allowed(from: JobStatus, to: JobStatus) -> bool {
    matches!(
        (from, to),
        (JobStatus::Pending, JobStatus::Processing)
            | (JobStatus::Processing, JobStatus::Completed)
            | (JobStatus::Processing, JobStatus::Failed)
    )
}

impl Job {
    fn transition(&mut self, to: JobStatus) -> Result<(), LifecycleError> {
        if !transition_allowed(self.status, to) {
            return Err(LifecycleError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn begin_processing(&mut self) -> Result<(), LifecycleError> {
        self.transition(JobStatus::Processing)
    }

    /// Raise progress. Equal values are accepted, lower ones rejected.
    pub fn advance(&mut self, progress: f32) -> Result<(), LifecycleError> {
        if self.status != JobStatus::Processing {
            return Err(LifecycleError::NotProcessing(self.status));
        }
        if !(0.0..=1.0).contains(&progress) {
            return Err(LifecycleError::ProgressOutOfRange(progress));
        }
        if progress < self.progress {
            return Err(LifecycleError::ProgressRegressed {
                current: self.progress,
                requested: progress,
            });
        }
        self.progress = progress;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Finish successfully. `diagnostics` carries causes from tiers that
    /// failed before the one that produced the result.
    pub fn complete(
        &mut self,
        result_ref: String,
        diagnostics: Vec<Diagnostic>,
    ) -> Result<(), LifecycleError> {
        self.transition(JobStatus::Completed)?;
        self.progress = 1.0;
        self.result_ref = Some(result_ref);
        self.diagnostics = diagnostics;
        Ok(())
    }

    pub fn fail(&mut self, diagnostics: Vec<Diagnostic>) -> Result<(), LifecycleError> {
        if diagnostics.is_empty() {
            return Err(LifecycleError::EmptyTrail);
        }
        self.transition(JobStatus::Failed)?;
        self.diagnostics = diagnostics;
        Ok(())
    }

    /// Fail a job from whatever non-terminal state it is in, keeping any
    /// causes already recorded.
    pub fn abandon(&mut self, cause: Diagnostic) -> Result<(), LifecycleError> {
        if self.status == JobStatus::Pending {
            self.transition(JobStatus::Processing)?;
        }
        self.transition(JobStatus::Failed)?;
        self.diagnostics.push(cause);
        Ok(())
    }
}
