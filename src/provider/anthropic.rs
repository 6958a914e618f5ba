// src/provider/anthropic.rs — Anthropic Messages API provider

use async_trait::async_trait;
use std::time::{Duration, Instant};

use super::{ChatRequest, ChatResponse, ProviderAdapter, Role, SamplingParams, TokenUsage};
use crate::infra::errors::PipelineError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    api_key: String,
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, PipelineError> {
        if api_key.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "anthropic: API key is empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("anthropic: {e}")))?;
        Ok(Self {
            api_key,
            client,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn build_request_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
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
            "max_tokens": request.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        if let Some(system) = request.system_text() {
            body["system"] = serde_json::json!(system);
        }
        apply_params(&mut body, &request.params);
        body
    }
}

// The Messages API has no seed or penalty parameters; those are dropped here.
fn apply_params(body: &mut serde_json::Value, params: &SamplingParams) {
    if let Some(t) = params.temperature {
        body["temperature"] = serde_json::json!(t.min(1.0));
    }
    if let Some(p) = params.top_p {
        body["top_p"] = serde_json::json!(p);
    }
    if !params.stop.is_empty() {
        body["stop_sequences"] = serde_json::json!(params.stop);
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let body = self.build_request_body(&request);
        let started = Instant::now();

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::transport("anthropic", &e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            // 529 = Anthropic "overloaded"
            return Err(PipelineError::from_status(
                "anthropic",
                status.as_u16(),
                &error_body,
            ));
        }

        let resp: serde_json::Value =
            response.json().await.map_err(|e| PipelineError::Provider {
                provider: "anthropic".into(),
                status: status.as_u16(),
                message: format!("Failed to parse response: {}", e),
                retriable: false,
                retry_after_ms: None,
            })?;

        let text = resp["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = TokenUsage::new(
            resp["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            resp["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        );

        Ok(ChatResponse {
            text,
            usage,
            latency_ms: started.elapsed().as_millis() as u64,
            cached: false,
            model_id: resp["model"]
                .as_str()
                .map(str::to_string)
                .unwrap_or(request.model),
        })
    }

    fn validate_model(&self, model: &str, params: &SamplingParams) -> Result<(), PipelineError> {
        super::default_validate("anthropic", model, params)?;
        if let Some(t) = params.temperature {
            if t > 1.0 {
                return Err(PipelineError::Configuration(format!(
                    "anthropic/{model}: temperature {t} above 1.0"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Message;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new("sk-test".into(), None, 30).unwrap()
    }

    #[test]
    fn test_requires_key() {
        assert!(AnthropicProvider::new(String::new(), None, 30).is_err());
    }

    #[test]
    fn test_system_moves_out_of_messages() {
        let req = ChatRequest::new(
            "claude-sonnet-4",
            vec![Message::system("rules"), Message::user("question")],
        );
        let body = provider().build_request_body(&req);
        assert_eq!(body["system"], "rules");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_stop_sequences_mapped() {
        let req = ChatRequest::new("claude-sonnet-4", vec![Message::user("q")]).with_params(
            SamplingParams {
                stop: vec!["###".into()],
                max_tokens: Some(100),
                ..Default::default()
            },
        );
        let body = provider().build_request_body(&req);
        assert_eq!(body["stop_sequences"][0], "###");
        assert_eq!(body["max_tokens"], 100);
    }

    #[test]
    fn test_validate_temperature_ceiling() {
        let params = SamplingParams {
            temperature: Some(1.4),
            ..Default::default()
        };
        assert!(provider().validate_model("claude-sonnet-4", &params).is_err());
    }
}
