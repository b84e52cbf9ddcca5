//! Admission and query surface of the service, independent of transport.
//!
//! A submission passes validation, then the per-origin rate limiter, then
//! the quota ledger. Only after all three does a job exist. The ledger
//! reservation counts the job in the same step that admits it, so rejected
//! submissions never touch the count.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::artifact::ArtifactStore;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::identity::Caller;
use crate::jobs::{JobId, JobSpec, JobStore, JobView};
use crate::orchestrator::FallbackOrchestrator;
use crate::provider::{GenerationConstraints, LocalRenderer, Tier};
use crate::quota::{Plan, QuotaLedger, QuotaView};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryClient;
use crate::scheduler::Scheduler;

pub const MAX_PROMPT_CHARS: usize = 2000;

/// Decoded receipts shorter than this are rejected.
pub const MIN_RECEIPT_BYTES: usize = 16;

/// Size bounds applied at admission.
const BYPASS_SIZE: (u32, u32) = (256, 1440);
const FREE_SIZE: (u32, u32) = (256, 512);
const PRO_SIZE: (u32, u32) = (512, 1024);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default, alias = "parameters")]
    pub constraints: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAccepted {
    pub job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptOutcome {
    pub success: bool,
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub ok: bool,
    pub time: DateTime<Utc>,
}

pub struct Gateway {
    rate: RateLimiter,
    ledger: QuotaLedger,
    jobs: Arc<JobStore>,
    scheduler: Arc<Scheduler>,
    job_ttl: Option<Duration>,
}

impl Gateway {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Arc<Self>> {
        let http = Arc::new(RetryClient::new(config.retry_policy(), config.http_timeout())?);
        let artifacts = Arc::new(ArtifactStore::new(
            config.artifact_dir.clone(),
            config.public_base(),
            Arc::clone(&http),
        ));
        let orchestrator = Arc::new(FallbackOrchestrator::from_settings(
            config.remote_sync_settings(),
            config.remote_poll_settings(),
            LocalRenderer::with_seed(config.local_seed),
            http,
            artifacts,
        ));
        Ok(Arc::new(Self {
            rate: RateLimiter::new(config.ip_rpm_limit),
            ledger: QuotaLedger::new(config.plan_limits(), config.bypass_policy()),
            jobs: Arc::new(JobStore::new()),
            scheduler: Arc::new(Scheduler::new(orchestrator, config.scheduler_config())),
            job_ttl: config.job_ttl(),
        }))
    }

    fn orchestrator(&self) -> &FallbackOrchestrator {
        self.scheduler.orchestrator()
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        self.orchestrator().artifacts()
    }

    pub fn job_ttl(&self) -> Option<Duration> {
        self.job_ttl
    }

    /// Admit a generation request and schedule it. Returns as soon as the
    /// job exists.
    pub fn submit(
        &self,
        caller: &Caller,
        request: SubmitRequest,
    ) -> Result<SubmitAccepted, GatewayError> {
        let constraints = validate(&request)?;

        if !self.rate.admit(&caller.origin) {
            warn!(origin = %caller.origin, "rate limit exceeded");
            return Err(GatewayError::RateLimited);
        }

        let bypass = self.ledger.bypass_for(&caller.id);
        let record = self
            .ledger
            .reserve_at(&caller.id, caller.plan, bypass, Utc::now())?;

        let (min, max) = match (bypass, record.plan) {
            (Some(_), _) => BYPASS_SIZE,
            (None, Plan::Free) => FREE_SIZE,
            (None, Plan::Pro) => PRO_SIZE,
        };
        let constraints = constraints.with_size_bounds(min, max);

        // Under bypass the claimed plan routes; otherwise the ledger's.
        let routing_plan = if bypass.is_some() { caller.plan } else { record.plan };
        let tier = self.orchestrator().starting_tier(routing_plan);

        let spec = JobSpec::new(
            request.prompt,
            request.style,
            constraints,
            caller.id.clone(),
            tier,
        );
        let (job, writer) = self.jobs.create(spec);
        self.scheduler.submit(writer);

        info!(
            job_id = %job.id,
            prompt_fp = %job.spec.prompt_fingerprint,
            tier = %tier,
            plan = %routing_plan,
            size = job.spec.constraints.size,
            bypass = bypass.is_some(),
            "job accepted"
        );
        Ok(SubmitAccepted { job_id: job.id })
    }

    pub fn poll(&self, raw_id: &str) -> Result<JobView, GatewayError> {
        JobId::parse(raw_id)
            .and_then(|id| self.jobs.get(&id))
            .map(|job| JobView::from(&job))
            .ok_or_else(|| GatewayError::JobNotFound(raw_id.to_string()))
    }

    pub fn quota(&self, caller: &Caller) -> QuotaView {
        self.ledger.quota_at(&caller.id, caller.plan, Utc::now())
    }

    /// Check a store receipt and, when it is structurally valid, grant the
    /// caller the pro plan. The receipt itself is never logged.
    pub fn verify_receipt(
        &self,
        caller: &Caller,
        receipt: &str,
    ) -> Result<ReceiptOutcome, GatewayError> {
        let receipt = receipt.trim();
        if receipt.is_empty() {
            return Err(GatewayError::Validation("missing receipt".into()));
        }

        let valid = BASE64
            .decode(receipt)
            .is_ok_and(|decoded| decoded.len() >= MIN_RECEIPT_BYTES);
        if !valid {
            info!(caller = %caller.id, "receipt rejected");
            return Ok(ReceiptOutcome {
                success: false,
                plan: Plan::Free,
                expires_at: None,
            });
        }

        let expires_at = self.ledger.grant_entitlement_at(&caller.id, Utc::now());
        info!(caller = %caller.id, expires_at = %expires_at, "pro entitlement granted");
        Ok(ReceiptOutcome {
            success: true,
            plan: Plan::Pro,
            expires_at: Some(expires_at),
        })
    }

    pub fn health(&self) -> Health {
        Health {
            ok: true,
            time: Utc::now(),
        }
    }

    /// Evict terminal jobs older than `ttl` along with their artifacts.
    pub async fn evict_expired(&self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let evicted = self.jobs.evict_terminal_before(now - ttl);
        for id in &evicted {
            self.artifacts().remove(id).await;
        }
        self.scheduler.prune_idle_gates();
        self.rate.prune(Instant::now());
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "expired jobs evicted");
        }
        evicted.len()
    }

    pub fn log_startup_diagnostics(&self, config: &GatewayConfig) {
        let state = |tier: Tier| {
            if self.orchestrator().is_configured(tier) {
                "configured"
            } else {
                "not-configured"
            }
        };
        info!(
            tier = %Tier::Premium,
            state = state(Tier::Premium),
            base_url = %config.dashscope.base_url,
            model = %config.dashscope.model,
            "provider"
        );
        info!(
            tier = %Tier::Standard,
            state = state(Tier::Standard),
            base_url = %config.modelscope.base_url,
            model = %config.modelscope.model,
            "provider"
        );
        info!(
            free = ?config.free_daily_limit,
            pro = ?config.pro_daily_limit,
            bypass = config.bypass_quota,
            ip_rpm_limit = config.ip_rpm_limit,
            "quota settings"
        );
        if config.bypass_quota {
            warn!("quota bypass is enabled for every caller");
        }
    }

    pub fn provider_states(&self) -> Vec<(Tier, bool)> {
        [Tier::Premium, Tier::Standard, Tier::Local]
            .into_iter()
            .map(|tier| (tier, self.orchestrator().is_configured(tier)))
            .collect()
    }
}

fn validate(request: &SubmitRequest) -> Result<GenerationConstraints, GatewayError> {
    let prompt = request.prompt.trim();
    if prompt.is_empty() {
        return Err(GatewayError::Validation("prompt must not be empty".into()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(GatewayError::Validation(format!(
            "prompt must be at most {MAX_PROMPT_CHARS} characters"
        )));
    }
    match &request.constraints {
        None | Some(Value::Null) => Ok(GenerationConstraints::from_map(&Map::new())),
        Some(Value::Object(map)) => Ok(GenerationConstraints::from_map(map)),
        Some(_) => Err(GatewayError::Validation("constraints must be an object".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::provider::ApiKey;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(dir: &tempfile::TempDir) -> GatewayConfig {
        GatewayConfig {
            artifact_dir: dir.path().to_path_buf(),
            progress_pause_ms: 1,
            ..GatewayConfig::default()
        }
    }

    fn request(prompt: &str) -> SubmitRequest {
        SubmitRequest {
            prompt: prompt.into(),
            ..SubmitRequest::default()
        }
    }

    fn caller(id: &str, plan: Plan) -> Caller {
        Caller::new(id, plan, "203.0.113.7")
    }

    async fn wait_terminal(gateway: &Gateway, id: &JobId) -> JobView {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let view = gateway.poll(id.as_str()).unwrap();
                if view.status == JobStatus::Completed || view.status == JobStatus::Failed {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn accepted_job_completes_locally() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();

        let accepted = gateway
            .submit(&caller("u-1", Plan::Free), request("a red fox"))
            .unwrap();
        let view = wait_terminal(&gateway, &accepted.job_id).await;

        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, Some(1.0));
        let url = view.result_ref.unwrap();
        assert_eq!(
            url,
            format!("http://127.0.0.1:8787/static/{}.png", accepted.job_id)
        );
        // Remote tiers are unconfigured, so free callers start at Local.
        assert!(view.error.is_none());
    }

    #[tokio::test]
    async fn fallback_completion_reports_failed_tiers() {
        let standard = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
            .expect(1)
            .mount(&standard)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(&dir);
        cfg.modelscope.base_url = standard.uri();
        cfg.modelscope.api_key = ApiKey::new("ms-test");
        let gateway = Gateway::new(&cfg).unwrap();

        let accepted = gateway
            .submit(&caller("u-1", Plan::Free), request("a red fox"))
            .unwrap();
        let view = wait_terminal(&gateway, &accepted.job_id).await;

        assert_eq!(view.status, JobStatus::Completed);
        assert!(view.result_ref.is_some());
        assert_eq!(view.error.as_deref(), Some("standard:http_400: bad model"));
    }

    #[tokio::test]
    async fn failed_job_polls_as_failed_with_summary() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("artifacts");
        std::fs::write(&blocker, b"file").unwrap();
        let gateway = Gateway::new(&GatewayConfig {
            artifact_dir: blocker,
            ..config(&dir)
        })
        .unwrap();

        let accepted = gateway
            .submit(&caller("u-1", Plan::Free), request("a red fox"))
            .unwrap();
        let view = wait_terminal(&gateway, &accepted.job_id).await;

        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.result_ref.is_none());
        let summary = view.error.clone().unwrap();
        assert!(summary.starts_with("local:artifact_error"));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], summary);
    }

    #[tokio::test]
    async fn pro_caller_without_premium_starts_local() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();
        let accepted = gateway
            .submit(&caller("u-pro", Plan::Pro), request("lighthouse"))
            .unwrap();
        let job = gateway.jobs.get(&accepted.job_id).unwrap();
        assert_eq!(job.spec.tier, Tier::Local);
    }

    #[tokio::test]
    async fn validation_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();
        let who = caller("u-1", Plan::Free);

        for bad in [
            request("   "),
            request(&"x".repeat(MAX_PROMPT_CHARS + 1)),
            SubmitRequest {
                prompt: "ok".into(),
                constraints: Some(json!([1, 2])),
                ..SubmitRequest::default()
            },
        ] {
            let err = gateway.submit(&who, bad).unwrap_err();
            assert_eq!(err.code(), "invalid_request");
        }
        assert_eq!(gateway.quota(&who).remaining, 2);
        assert_eq!(gateway.jobs.len(), 0);
    }

    #[tokio::test]
    async fn free_quota_blocks_third_submission() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();
        let who = caller("u-1", Plan::Free);

        gateway.submit(&who, request("one")).unwrap();
        gateway.submit(&who, request("two")).unwrap();
        let err = gateway.submit(&who, request("three")).unwrap_err();

        assert!(matches!(err, GatewayError::QuotaExceeded { plan: Plan::Free }));
        assert_eq!(gateway.jobs.len(), 2);
        let quota = gateway.quota(&who);
        assert_eq!(quota.remaining, 0);
        assert_eq!(quota.limit, Some(2));
    }

    #[tokio::test]
    async fn rate_limit_leaves_quota_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&GatewayConfig {
            ip_rpm_limit: 1,
            ..config(&dir)
        })
        .unwrap();
        let who = caller("u-1", Plan::Free);

        gateway.submit(&who, request("one")).unwrap();
        let err = gateway.submit(&who, request("two")).unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited));
        assert_eq!(gateway.quota(&who).remaining, 1);
    }

    #[tokio::test]
    async fn size_is_capped_by_plan() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();
        let big = |prompt: &str| SubmitRequest {
            prompt: prompt.into(),
            constraints: Some(json!({"size": 4096})),
            ..SubmitRequest::default()
        };

        let free = gateway.submit(&caller("u-free", Plan::Free), big("a")).unwrap();
        let pro = gateway.submit(&caller("u-pro", Plan::Pro), big("b")).unwrap();
        let dev = gateway.submit(&caller("dev-me", Plan::Free), big("c")).unwrap();

        let negative = gateway
            .submit(
                &caller("u-neg", Plan::Free),
                SubmitRequest {
                    prompt: "d".into(),
                    constraints: Some(json!({"size": -5})),
                    ..SubmitRequest::default()
                },
            )
            .unwrap();

        let size = |id: &JobId| gateway.jobs.get(id).unwrap().spec.constraints.size;
        assert_eq!(size(&free.job_id), 512);
        assert_eq!(size(&pro.job_id), 1024);
        assert_eq!(size(&dev.job_id), 1440);
        assert_eq!(size(&negative.job_id), 256);
    }

    #[tokio::test]
    async fn developer_identity_bypasses_quota() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();
        let dev = caller("dev-alice", Plan::Free);
        for i in 0..5 {
            gateway.submit(&dev, request(&format!("icon {i}"))).unwrap();
        }
        let quota = gateway.quota(&dev);
        assert_eq!(quota.remaining, crate::quota::UNLIMITED_REMAINING);
        assert_eq!(quota.limit, None);
    }

    #[tokio::test]
    async fn receipt_verification() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();
        let who = caller("u-1", Plan::Free);

        let short = gateway.verify_receipt(&who, &BASE64.encode(b"tiny")).unwrap();
        assert!(!short.success);
        assert_eq!(short.expires_at, None);

        let garbage = gateway.verify_receipt(&who, "%%% not base64 %%%").unwrap();
        assert!(!garbage.success);

        assert!(gateway.verify_receipt(&who, "  ").is_err());

        let before = Utc::now();
        let ok = gateway
            .verify_receipt(&who, &BASE64.encode(b"a-structurally-valid-receipt"))
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.plan, Plan::Pro);
        let expires = ok.expires_at.unwrap();
        let window = expires - before;
        assert!(window >= chrono::Duration::days(30));
        assert!(window < chrono::Duration::days(30) + chrono::Duration::minutes(1));

        // The entitlement overrides the claimed plan.
        assert_eq!(gateway.quota(&who).plan, Plan::Pro);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();
        assert!(matches!(
            gateway.poll("tsk_0123456789abcdef0123456789abcdef"),
            Err(GatewayError::JobNotFound(_))
        ));
        assert!(matches!(gateway.poll("nope"), Err(GatewayError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn eviction_removes_job_and_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::new(&config(&dir)).unwrap();
        let accepted = gateway
            .submit(&caller("u-1", Plan::Free), request("a red fox"))
            .unwrap();
        wait_terminal(&gateway, &accepted.job_id).await;
        let file = dir.path().join(format!("{}.png", accepted.job_id));
        assert!(file.exists());

        let later = Utc::now() + chrono::Duration::hours(2);
        let evicted = gateway.evict_expired(Duration::from_secs(3600), later).await;
        assert_eq!(evicted, 1);
        assert!(gateway.poll(accepted.job_id.as_str()).is_err());
        assert!(!file.exists());
    }

    #[test]
    fn submit_request_accepts_parameters_alias() {
        let request: SubmitRequest =
            serde_json::from_value(json!({"prompt": "x", "parameters": {"size": 300}})).unwrap();
        assert_eq!(request.constraints, Some(json!({"size": 300})));
    }
}
