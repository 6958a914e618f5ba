// src/provider/openai.rs — OpenAI Chat Completions provider (and compatible endpoints)

use async_trait::async_trait;
use std::time::{Duration, Instant};

use super::{ChatRequest, ChatResponse, ProviderAdapter, SamplingParams, TokenUsage};
use crate::infra::errors::PipelineError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    id: String,
    api_key: Option<String>,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAIProvider {
    /// Hosted OpenAI. An API key is mandatory.
    pub fn new(api_key: String) -> Result<Self, PipelineError> {
        if api_key.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "openai: API key is empty".into(),
            ));
        }
        Self::build("openai", Some(api_key), DEFAULT_BASE_URL.into(), 120)
    }

    /// Any OpenAI-compatible endpoint (vLLM, LiteLLM, Together, ...).
    /// The endpoint URL is mandatory; the key is optional.
    pub fn compatible(
        id: impl Into<String>,
        api_key: Option<String>,
        base_url: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        let id = id.into();
        let base_url = base_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                PipelineError::Configuration(format!("{id}: base_url is required"))
            })?;
        Self::build(id, api_key, base_url, timeout_secs)
    }

    fn build(
        id: impl Into<String>,
        api_key: Option<String>,
        base_url: String,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        let id = id.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("{id}: {e}")))?;
        Ok(Self {
            id,
            api_key,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// Build the Chat Completions request body.
pub(crate) fn build_body(request: &ChatRequest) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = request
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": request.model,
        "messages": messages,
    });
    apply_params(&mut body, &request.params);
    if let Some(seed) = request.seed {
        body["seed"] = serde_json::json!(seed);
    }
    body
}

fn apply_params(body: &mut serde_json::Value, params: &SamplingParams) {
    if let Some(t) = params.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(p) = params.top_p {
        body["top_p"] = serde_json::json!(p);
    }
    if let Some(max_tokens) = params.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if let Some(p) = params.presence_penalty {
        body["presence_penalty"] = serde_json::json!(p);
    }
    if let Some(p) = params.frequency_penalty {
        body["frequency_penalty"] = serde_json::json!(p);
    }
    if !params.stop.is_empty() {
        body["stop"] = serde_json::json!(params.stop);
    }
}

/// Extract text and usage from a Chat Completions response.
pub(crate) fn parse_response(resp: &serde_json::Value) -> (String, TokenUsage) {
    let text = resp["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("")
        .to_string();
    let usage = TokenUsage::new(
        resp["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        resp["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
    );
    (text, usage)
}

#[async_trait]
impl ProviderAdapter for OpenAIProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let body = build_body(&request);
        let started = Instant::now();

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| PipelineError::transport(&self.id, &e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(
                &self.id,
                status.as_u16(),
                &error_body,
            ));
        }

        let resp: serde_json::Value =
            response.json().await.map_err(|e| PipelineError::Provider {
                provider: self.id.clone(),
                status: status.as_u16(),
                message: format!("Failed to parse response: {}", e),
                retriable: false,
                retry_after_ms: None,
            })?;

        let (text, usage) = parse_response(&resp);
        let model_id = resp["model"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| request.model.clone());

        Ok(ChatResponse {
            text,
            usage,
            latency_ms: started.elapsed().as_millis() as u64,
            cached: false,
            model_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    #[test]
    fn test_new_requires_key() {
        assert!(matches!(
            OpenAIProvider::new("  ".into()),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_compatible_requires_endpoint() {
        let err = OpenAIProvider::compatible("local", None, None, 30).err();
        assert!(matches!(err, Some(PipelineError::Configuration(_))));
        let ok = OpenAIProvider::compatible(
            "local",
            None,
            Some("http://localhost:8000/v1/".into()),
            30,
        )
        .unwrap();
        assert_eq!(ok.base_url, "http://localhost:8000/v1");
        assert_eq!(ok.id(), "local");
    }

    #[test]
    fn test_build_body_includes_params_and_seed() {
        let req = ChatRequest::new(
            "gpt-4.1",
            vec![Message::system("sys"), Message::user("hello")],
        )
        .with_params(SamplingParams {
            temperature: Some(0.2),
            max_tokens: Some(256),
            stop: vec!["END".into()],
            ..Default::default()
        })
        .with_seed(Some(7));

        let body = build_body(&req);
        assert_eq!(body["model"], "gpt-4.1");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["seed"], 7);
        assert_eq!(body["stop"][0], "END");
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn test_parse_response() {
        let resp = serde_json::json!({
            "model": "gpt-4.1-2025",
            "choices": [{"message": {"role": "assistant", "content": "Hi"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        });
        let (text, usage) = parse_response(&resp);
        assert_eq!(text, "Hi");
        assert_eq!(usage, TokenUsage::new(12, 3));
    }

    #[test]
    fn test_parse_response_missing_fields() {
        let (text, usage) = parse_response(&serde_json::json!({}));
        assert!(text.is_empty());
        assert_eq!(usage.total_tokens, 0);
    }
}
