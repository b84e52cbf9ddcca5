//! Job records, their lifecycle rules and the in-memory store.

pub mod lifecycle;
pub mod record;
pub mod store;

pub use lifecycle::{LifecycleError, transition_allowed};
pub use record::{Diagnostic, Job, JobId, JobSpec, JobStatus, JobView, prompt_fingerprint};
pub use store::{JobStore, JobWriter};
