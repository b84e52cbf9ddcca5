//! Job executor behind two concurrency gates.
//!
//! Each job runs on its own task. Before doing any work it takes a permit
//! from the global gate and then one from its caller's gate, always in that
//! order. With both permits held it moves the job to processing, plays the
//! progress simulation and hands off to the fallback orchestrator. A run that
//! stops early for any reason, a panic included, leaves the job failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::identity::CallerId;
use crate::jobs::{JobWriter, LifecycleError};
use crate::orchestrator::FallbackOrchestrator;

/// Fixed progress stages played while a job runs.
///
/// This is a simulation. None of the backends report real progress, so the
/// executor walks these stages with a pause between each before calling the
/// orchestrator. The values carry no meaning beyond being monotonic.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSimulation {
    pub stages: Vec<f32>,
    pub pause: Duration,
}

impl Default for ProgressSimulation {
    fn default() -> Self {
        Self {
            stages: vec![0.1, 0.25, 0.5, 0.7, 0.9],
            pause: Duration::from_millis(400),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub global_limit: usize,
    pub per_caller_limit: usize,
    pub progress: ProgressSimulation,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            global_limit: 3,
            per_caller_limit: 3,
            progress: ProgressSimulation::default(),
        }
    }
}

pub struct Scheduler {
    global: Arc<Semaphore>,
    per_caller_limit: usize,
    callers: DashMap<CallerId, Arc<Semaphore>>,
    orchestrator: Arc<FallbackOrchestrator>,
    progress: ProgressSimulation,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<FallbackOrchestrator>, config: SchedulerConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.global_limit.max(1))),
            per_caller_limit: config.per_caller_limit.max(1),
            callers: DashMap::new(),
            orchestrator,
            progress: config.progress,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn orchestrator(&self) -> &Arc<FallbackOrchestrator> {
        &self.orchestrator
    }

    /// Spawn execution of the job owned by `writer` and return at once.
    pub fn submit(self: &Arc<Self>, writer: JobWriter) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.execute(writer).await })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Highest number of jobs seen holding both gates at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    fn caller_gate(&self, caller: &CallerId) -> Arc<Semaphore> {
        self.callers
            .entry(caller.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_caller_limit)))
            .clone()
    }

    /// Forget caller gates nobody is holding or waiting on.
    pub fn prune_idle_gates(&self) {
        let limit = self.per_caller_limit;
        self.callers
            .retain(|_, gate| Arc::strong_count(gate) > 1 || gate.available_permits() < limit);
    }

    async fn acquire_gates(
        &self,
        caller: &CallerId,
    ) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), String> {
        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| "global gate closed".to_string())?;
        let per_caller = self
            .caller_gate(caller)
            .acquire_owned()
            .await
            .map_err(|_| "caller gate closed".to_string())?;
        Ok((global, per_caller))
    }

    async fn execute(&self, writer: JobWriter) {
        let job_id = writer.id().clone();
        let _permits = match self.acquire_gates(&writer.spec().caller).await {
            Ok(permits) => permits,
            Err(cause) => {
                fail_internal(writer, &cause);
                return;
            }
        };

        let slot = InFlight::enter(&self.in_flight);
        self.peak_in_flight.fetch_max(slot.count, Ordering::Relaxed);
        debug!(job_id = %job_id, in_flight = slot.count, "job acquired gates");

        self.run(writer).await;
    }

    async fn run(&self, writer: JobWriter) {
        if let Err(err) = self.simulate_progress(&writer).await {
            fail_internal(writer, &format!("lifecycle: {err}"));
            return;
        }

        let spec = writer.spec();
        let outcome = self
            .orchestrator
            .run(writer.id(), &spec.prompt, &spec.constraints, spec.tier)
            .await;
        let job_id = writer.id().clone();
        let recorded = match outcome {
            Ok(generation) => {
                info!(
                    job_id = %job_id,
                    prompt_fp = %spec.prompt_fingerprint,
                    tier = %generation.tier,
                    "job completed"
                );
                writer.complete(generation.artifact.url, generation.trail)
            }
            Err(exhausted) => {
                // The local tier failed too; the trail says why.
                error!(job_id = %job_id, causes = exhausted.trail.len(), "fallback chain exhausted");
                writer.fail(exhausted.trail)
            }
        };
        // A rejected terminal write leaves the job live; the dropped writer
        // then fails it.
        if let Err(err) = recorded {
            error!(job_id = %job_id, error = %err, "could not record job outcome");
        }
    }

    async fn simulate_progress(&self, writer: &JobWriter) -> Result<(), LifecycleError> {
        writer.begin_processing()?;
        for &stage in &self.progress.stages {
            sleep(self.progress.pause).await;
            writer.advance(stage)?;
        }
        Ok(())
    }
}

/// Counts a job as in flight until dropped.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    count: usize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
        Self { counter, count }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

fn fail_internal(writer: JobWriter, cause: &str) {
    let job_id = writer.id().clone();
    error!(job_id = %job_id, cause, "internal scheduler fault");
    if let Err(err) = writer.abandon(format!("internal: {cause}")) {
        error!(job_id = %job_id, error = %err, "could not record job failure");
    }
}
