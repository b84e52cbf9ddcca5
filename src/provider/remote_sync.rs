//! Single-call synchronous backend (DashScope multimodal-generation shape).
//!
//! One POST returns the image reference directly. Two response shapes are
//! recognised: the multimodal `output.choices[0].message.content[0].image`
//! and the OpenAI-compatible `data[0].url` / `data[0].b64_json`.

use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{ApiKey, GenerationConstraints, ProviderError, ProviderResult, Submission, Tier};
use crate::retry::{OutboundRequest, RetryClient};

/// The backend only renders this square size.
const OUTPUT_SIZE: &str = "1328*1328";

#[derive(Debug, Clone)]
pub struct RemoteSyncSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: ApiKey,
}

impl RemoteSyncSettings {
    pub fn is_configured(&self) -> bool {
        self.api_key.is_configured() && !self.model.trim().is_empty()
    }
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    input: GenerationInput<'a>,
    parameters: GenerationParameters<'a>,
}

#[derive(Debug, Serialize)]
struct GenerationInput<'a> {
    messages: Vec<InputMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct InputMessage<'a> {
    role: &'a str,
    content: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerationParameters<'a> {
    size: &'a str,
    prompt_extend: bool,
    watermark: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<&'a str>,
}

pub struct RemoteSyncAdapter {
    settings: RemoteSyncSettings,
    http: Arc<RetryClient>,
}

impl RemoteSyncAdapter {
    /// Returns `NotConfigured` when credentials or model are missing.
    pub fn new(settings: RemoteSyncSettings, http: Arc<RetryClient>) -> Result<Self, ProviderError> {
        if !settings.is_configured() {
            return Err(ProviderError::NotConfigured(Tier::Premium));
        }
        Ok(Self { settings, http })
    }

    pub async fn submit(
        &self,
        prompt: &str,
        constraints: &GenerationConstraints,
    ) -> Result<Submission, ProviderError> {
        let url = format!("{}/generation", self.settings.base_url.trim_end_matches('/'));
        let body = GenerationRequest {
            model: &self.settings.model,
            input: GenerationInput {
                messages: vec![InputMessage {
                    role: "user",
                    content: vec![TextPart { text: prompt }],
                }],
            },
            parameters: GenerationParameters {
                size: OUTPUT_SIZE,
                prompt_extend: true,
                watermark: false,
                negative_prompt: constraints.negative_prompt.as_deref(),
            },
        };

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.settings.api_key.bearer()?);
        let request = OutboundRequest::post_json(url, headers, &body)?;

        let response: Value = self.http.call_json(&request).await?;
        let reference = extract_reference(&response)?;
        debug!(model = %self.settings.model, "remote-sync generation returned an image");
        Ok(Submission::Ready(reference))
    }
}

/// Pull the image out of either supported response shape.
fn extract_reference(response: &Value) -> Result<ProviderResult, ProviderError> {
    if let Some(image) = response
        .pointer("/output/choices/0/message/content/0/image")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        return ProviderResult::from_reference(image);
    }
    if let Some(url) = response
        .pointer("/data/0/url")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    {
        return ProviderResult::from_reference(url);
    }
    if let Some(b64) = response.pointer("/data/0/b64_json").and_then(Value::as_str) {
        return ProviderResult::from_base64(b64);
    }

    let upstream_code = response
        .get("code")
        .and_then(Value::as_str)
        .map(|c| format!(" ({c})"))
        .unwrap_or_default();
    Err(ProviderError::Permanent(format!("no_result{upstream_code}")))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::retry::RetryPolicy;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: String) -> RemoteSyncAdapter {
        let http = RetryClient::new(
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            Duration::from_secs(5),
        )
        .unwrap();
        RemoteSyncAdapter::new(
            RemoteSyncSettings {
                base_url,
                model: "qwen-image".into(),
                api_key: ApiKey::new("sk-test"),
            },
            Arc::new(http),
        )
        .unwrap()
    }

    #[test]
    fn requires_credentials() {
        let http = Arc::new(RetryClient::new(RetryPolicy::default(), Duration::from_secs(1)).unwrap());
        let result = RemoteSyncAdapter::new(
            RemoteSyncSettings {
                base_url: "http://localhost".into(),
                model: "qwen-image".into(),
                api_key: ApiKey::default(),
            },
            http,
        );
        assert!(matches!(result, Err(ProviderError::NotConfigured(Tier::Premium))));
    }

    #[tokio::test]
    async fn parses_multimodal_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generation"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "qwen-image",
                "input": {"messages": [{"role": "user", "content": [{"text": "a red fox"}]}]},
                "parameters": {"size": "1328*1328", "watermark": false}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": {"choices": [{"message": {"content": [{"image": "https://cdn.test/fox.png"}]}}]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let submission = adapter(server.uri())
            .submit("a red fox", &GenerationConstraints::default())
            .await
            .unwrap();
        assert!(matches!(
            submission,
            Submission::Ready(ProviderResult::Hosted(ref url)) if url == "https://cdn.test/fox.png"
        ));
    }

    #[tokio::test]
    async fn parses_openai_compatible_inline_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"b64_json": "aWNvbg=="}]
            })))
            .mount(&server)
            .await;

        let submission = adapter(server.uri())
            .submit("icon", &GenerationConstraints::default())
            .await
            .unwrap();
        assert!(matches!(
            submission,
            Submission::Ready(ProviderResult::Inline(ref bytes)) if bytes == b"icon"
        ));
    }

    #[tokio::test]
    async fn missing_payload_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "DataInspectionFailed",
                "output": {"choices": []}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = adapter(server.uri())
            .submit("icon", &GenerationConstraints::default())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "no_result (DataInspectionFailed)");
    }

    #[tokio::test]
    async fn negative_prompt_is_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"parameters": {"negative_prompt": "blurry"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"url": "https://cdn.test/a.png"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let constraints = GenerationConstraints {
            negative_prompt: Some("blurry".into()),
            ..Default::default()
        };
        adapter(server.uri()).submit("icon", &constraints).await.unwrap();
    }
}
