use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactRef, ArtifactStore};
use crate::jobs::{Diagnostic, JobId};
use crate::provider::{
    GenerationConstraints, LocalRenderer, Provider, ProviderError, RemotePollAdapter,
    RemotePollSettings, RemoteSyncAdapter, RemoteSyncSettings, Tier, local,
};
use crate::quota::Plan;
use crate::retry::RetryClient;

/// Result of a successful fallback run.
#[derive(Debug, Clone)]
pub struct Generation {
    pub artifact: ArtifactRef,
    /// Tier that produced the artifact.
    pub tier: Tier,
    /// Failures from tiers attempted before `tier`.
    pub trail: Vec<Diagnostic>,
}

/// Every tier down to the floor failed.
#[derive(Debug, Clone, Error)]
#[error("all provider tiers failed")]
pub struct Exhausted {
    pub trail: Vec<Diagnostic>,
}

/// Walks the tier order Premium → Standard → Local, stepping down one tier
/// per failure and never back up.
pub struct FallbackOrchestrator {
    premium: Option<Provider>,
    standard: Option<Provider>,
    local: Provider,
    artifacts: Arc<ArtifactStore>,
}

impl FallbackOrchestrator {
    pub fn new(
        premium: Option<Provider>,
        standard: Option<Provider>,
        local: LocalRenderer,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        Self {
            premium,
            standard,
            local: Provider::Local(local),
            artifacts,
        }
    }

    /// Build the chain from backend settings. Unconfigured remote tiers are
    /// left empty and report `NotConfigured` when reached.
    pub fn from_settings(
        premium: RemoteSyncSettings,
        standard: RemotePollSettings,
        local: LocalRenderer,
        http: Arc<RetryClient>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        let premium = match RemoteSyncAdapter::new(premium, Arc::clone(&http)) {
            Ok(adapter) => Some(Provider::RemoteSync(adapter)),
            Err(err) => {
                debug!(tier = %Tier::Premium, reason = %err, "tier disabled");
                None
            }
        };
        let standard = match RemotePollAdapter::new(standard, http) {
            Ok(adapter) => Some(Provider::RemotePoll(adapter)),
            Err(err) => {
                debug!(tier = %Tier::Standard, reason = %err, "tier disabled");
                None
            }
        };
        Self::new(premium, standard, local, artifacts)
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    pub fn is_configured(&self, tier: Tier) -> bool {
        match tier {
            Tier::Premium => self.premium.is_some(),
            Tier::Standard => self.standard.is_some(),
            Tier::Local => true,
        }
    }

    /// Pro callers start at Premium when it is usable; everyone else starts
    /// at the best configured tier below it.
    pub fn starting_tier(&self, plan: Plan) -> Tier {
        if plan == Plan::Pro && self.premium.is_some() {
            Tier::Premium
        } else if self.standard.is_some() {
            Tier::Standard
        } else {
            Tier::Local
        }
    }

    fn provider(&self, tier: Tier) -> Result<&Provider, ProviderError> {
        match tier {
            Tier::Premium => self.premium.as_ref().ok_or(ProviderError::NotConfigured(tier)),
            Tier::Standard => self.standard.as_ref().ok_or(ProviderError::NotConfigured(tier)),
            Tier::Local => Ok(&self.local),
        }
    }

    pub async fn run(
        &self,
        job_id: &JobId,
        prompt: &str,
        constraints: &GenerationConstraints,
        start: Tier,
    ) -> Result<Generation, Exhausted> {
        let constraints = constraints
            .clone()
            .with_size_bounds(local::MIN_SIZE, local::MAX_SIZE);
        let mut trail = Vec::new();
        let mut next = Some(start);

        while let Some(tier) = next {
            let attempt = match self.provider(tier) {
                Ok(provider) => {
                    provider
                        .generate(job_id, prompt, &constraints, &self.artifacts)
                        .await
                }
                Err(err) => Err(err),
            };
            match attempt {
                Ok(artifact) => {
                    info!(job_id = %job_id, tier = %tier, fallbacks = trail.len(), "generation succeeded");
                    return Ok(Generation {
                        artifact,
                        tier,
                        trail,
                    });
                }
                Err(err) => {
                    warn!(
                        job_id = %job_id,
                        tier = %tier,
                        error_kind = err.kind(),
                        status = ?err.status(),
                        "tier failed, stepping down"
                    );
                    trail.push(Diagnostic {
                        tier,
                        cause: err.to_string(),
                    });
                    next = tier.next_lower();
                }
            }
        }
        Err(Exhausted { trail })
    }
}
