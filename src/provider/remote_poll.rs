//! Submit-then-poll backend (ModelScope async-inference shape).

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{
    ApiKey, GenerationConstraints, JobHandle, PollStatus, ProviderError, ProviderResult,
    Submission, Tier,
};
use crate::retry::{OutboundRequest, RetryClient};

#[derive(Debug, Clone)]
pub struct RemotePollSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: ApiKey,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl RemotePollSettings {
    pub fn is_configured(&self) -> bool {
        self.api_key.is_configured() && !self.model.trim().is_empty()
    }
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    #[serde(default)]
    task_status: Option<String>,
    #[serde(default)]
    output_images: Vec<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct RemotePollAdapter {
    settings: RemotePollSettings,
    http: Arc<RetryClient>,
}

impl RemotePollAdapter {
    /// Returns `NotConfigured` when credentials or model are missing.
    pub fn new(settings: RemotePollSettings, http: Arc<RetryClient>) -> Result<Self, ProviderError> {
        if !settings.is_configured() {
            return Err(ProviderError::NotConfigured(Tier::Standard));
        }
        Ok(Self { settings, http })
    }

    fn base(&self) -> &str {
        self.settings.base_url.trim_end_matches('/')
    }

    /// `{base}/tasks/{id}` with the upstream id as one escaped path segment.
    fn task_url(&self, task_id: &str) -> Result<Url, ProviderError> {
        let invalid = || ProviderError::Permanent("invalid_base_url".into());
        let mut url = Url::parse(&format!("{}/tasks/", self.base())).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .push(task_id);
        Ok(url)
    }

    fn auth_headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.settings.api_key.bearer()?);
        Ok(headers)
    }

    pub async fn submit(
        &self,
        prompt: &str,
        constraints: &GenerationConstraints,
    ) -> Result<Submission, ProviderError> {
        let mut headers = self.auth_headers()?;
        headers.insert("x-modelscope-async-mode", HeaderValue::from_static("true"));
        let body = SubmitRequest {
            model: &self.settings.model,
            prompt,
            negative_prompt: constraints.negative_prompt.as_deref(),
        };
        let request =
            OutboundRequest::post_json(format!("{}/images/generations", self.base()), headers, &body)?;

        let response: SubmitResponse = self.http.call_json(&request).await?;
        let task_id = response
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::Permanent("no_task_id".into()))?;
        debug!(model = %self.settings.model, "remote-poll task submitted");
        Ok(Submission::Pending(JobHandle(task_id)))
    }

    pub async fn poll(&self, handle: &JobHandle) -> Result<PollStatus, ProviderError> {
        let mut headers = self.auth_headers()?;
        headers.insert(
            "x-modelscope-task-type",
            HeaderValue::from_static("image_generation"),
        );
        let request = OutboundRequest::get(self.task_url(&handle.0)?, headers);
        let task: TaskResponse = self.http.call_json(&request).await?;

        let status = match task.task_status.as_deref() {
            Some("SUCCEED") => {
                let image = task
                    .output_images
                    .first()
                    .ok_or_else(|| ProviderError::Permanent("no_image_url".into()))?;
                PollStatus::Succeeded(ProviderResult::from_reference(image)?)
            }
            Some("FAILED") => {
                PollStatus::Failed(task.message.unwrap_or_else(|| "Unknown error".to_string()))
            }
            Some("QUEUING") => PollStatus::Queued,
            Some("RUNNING") => PollStatus::Running,
            other => {
                debug!(status = ?other, "unrecognised task status, treating as running");
                PollStatus::Running
            }
        };
        Ok(status)
    }

    /// Poll at a fixed interval until a terminal status or `max_polls` is hit.
    /// Transient poll failures count as an attempt and polling continues.
    pub async fn wait(&self, handle: &JobHandle) -> Result<ProviderResult, ProviderError> {
        let max = self.settings.max_polls;
        for attempt in 1..=max {
            match self.poll(handle).await {
                Ok(PollStatus::Succeeded(result)) => return Ok(result),
                Ok(PollStatus::Failed(cause)) => return Err(ProviderError::UpstreamFailed(cause)),
                Ok(PollStatus::Queued | PollStatus::Running) => {}
                Err(err) if err.is_transient() => {
                    warn!(attempt, max_polls = max, status = ?err.status(), "poll failed, continuing");
                }
                Err(err) => return Err(err),
            }
            if attempt < max {
                sleep(self.settings.poll_interval).await;
            }
        }
        Err(ProviderError::PollTimeout { attempts: max })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: String, max_polls: u32) -> RemotePollAdapter {
        let http = RetryClient::new(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            Duration::from_secs(5),
        )
        .unwrap();
        RemotePollAdapter::new(
            RemotePollSettings {
                base_url,
                model: "Qwen/Qwen-Image".into(),
                api_key: ApiKey::new("ms-test"),
                poll_interval: Duration::from_millis(1),
                max_polls,
            },
            Arc::new(http),
        )
        .unwrap()
    }

    async fn mount_submit(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .and(header("x-modelscope-async-mode", "true"))
            .and(body_partial_json(json!({"model": "Qwen/Qwen-Image", "prompt": "a red fox"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_id": "t-1"})))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn submit_returns_handle() {
        let server = MockServer::start().await;
        mount_submit(&server).await;

        let submission = adapter(server.uri(), 3)
            .submit("a red fox", &GenerationConstraints::default())
            .await
            .unwrap();
        assert!(matches!(submission, Submission::Pending(JobHandle(ref id)) if id == "t-1"));
    }

    #[tokio::test]
    async fn submit_without_task_id_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"request_id": "x"})))
            .mount(&server)
            .await;

        let err = adapter(server.uri(), 3)
            .submit("a red fox", &GenerationConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no_task_id");
    }

    #[tokio::test]
    async fn wait_polls_through_running_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/t-1"))
            .and(header("x-modelscope-task-type", "image_generation"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_status": "QUEUING"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/t-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_status": "RUNNING"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tasks/t-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_status": "SUCCEED",
                "output_images": ["https://cdn.test/fox.png"]
            })))
            .mount(&server)
            .await;

        let result = adapter(server.uri(), 5)
            .wait(&JobHandle("t-1".into()))
            .await
            .unwrap();
        assert_eq!(result, ProviderResult::Hosted("https://cdn.test/fox.png".into()));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn upstream_failure_carries_cause() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_status": "FAILED",
                "message": "content rejected"
            })))
            .mount(&server)
            .await;

        let err = adapter(server.uri(), 5)
            .wait(&JobHandle("t-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UpstreamFailed(ref c) if c == "content rejected"));
    }

    #[tokio::test]
    async fn exhausting_polls_is_a_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_status": "RUNNING"})))
            .expect(4)
            .mount(&server)
            .await;

        let err = adapter(server.uri(), 4)
            .wait(&JobHandle("t-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::PollTimeout { attempts: 4 }));
    }

    #[tokio::test]
    async fn succeeded_without_images_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_status": "SUCCEED"})))
            .expect(1)
            .mount(&server)
            .await;

        let err = adapter(server.uri(), 4)
            .wait(&JobHandle("t-1".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no_image_url");
    }

    #[tokio::test]
    async fn task_id_is_escaped_into_one_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tasks/a%2Fb%3Fc%23d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_status": "RUNNING"})))
            .expect(1)
            .mount(&server)
            .await;

        let status = adapter(server.uri(), 1)
            .poll(&JobHandle("a/b?c#d".into()))
            .await
            .unwrap();
        assert_eq!(status, PollStatus::Running);
    }
}
