// src/provider/ollama.rs — Ollama local model provider

use async_trait::async_trait;
use std::time::{Duration, Instant};

use super::{ChatRequest, ChatResponse, ProviderAdapter, SamplingParams, TokenUsage};
use crate::infra::errors::PipelineError;

pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>, timeout_secs: u64) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("ollama: {e}")))?;
        Ok(Self {
            base_url: base_url
                .unwrap_or_else(|| "http://localhost:11434".into())
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }
}

fn build_options(params: &SamplingParams, seed: Option<u64>) -> Option<serde_json::Value> {
    let mut options = serde_json::Map::new();
    if let Some(t) = params.temperature {
        options.insert("temperature".into(), serde_json::json!(t));
    }
    if let Some(p) = params.top_p {
        options.insert("top_p".into(), serde_json::json!(p));
    }
    if let Some(n) = params.max_tokens {
        options.insert("num_predict".into(), serde_json::json!(n));
    }
    if let Some(p) = params.presence_penalty {
        options.insert("presence_penalty".into(), serde_json::json!(p));
    }
    if let Some(p) = params.frequency_penalty {
        options.insert("frequency_penalty".into(), serde_json::json!(p));
    }
    if !params.stop.is_empty() {
        options.insert("stop".into(), serde_json::json!(params.stop));
    }
    if let Some(seed) = seed {
        options.insert("seed".into(), serde_json::json!(seed));
    }
    if options.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(options))
    }
}

#[async_trait]
impl ProviderAdapter for OllamaProvider {
    fn id(&self) -> &str {
        "ollama"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
        });
        if let Some(options) = build_options(&request.params, request.seed) {
            body["options"] = options;
        }

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::transport("ollama", &e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status(
                "ollama",
                status.as_u16(),
                &error_body,
            ));
        }

        let resp: serde_json::Value =
            response.json().await.map_err(|e| PipelineError::Provider {
                provider: "ollama".into(),
                status: status.as_u16(),
                message: format!("Failed to parse response: {}", e),
                retriable: false,
                retry_after_ms: None,
            })?;

        let text = resp["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        let usage = TokenUsage::new(
            resp["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
            resp["eval_count"].as_u64().unwrap_or(0) as u32,
        );

        Ok(ChatResponse {
            text,
            usage,
            latency_ms: started.elapsed().as_millis() as u64,
            cached: false,
            model_id: request.model,
        })
    }

    fn estimate_cost(&self, _model: &str, _prompt_tokens: u32, _completion_tokens: u32) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_base_url() {
        let p = OllamaProvider::new(None, 30).unwrap();
        assert_eq!(p.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_options_mapping() {
        let params = SamplingParams {
            temperature: Some(0.0),
            max_tokens: Some(64),
            ..Default::default()
        };
        let opts = build_options(&params, Some(42)).unwrap();
        assert_eq!(opts["num_predict"], 64);
        assert_eq!(opts["seed"], 42);
        assert!(build_options(&SamplingParams::default(), None).is_none());
    }

    #[test]
    fn test_local_models_are_free() {
        let p = OllamaProvider::new(None, 30).unwrap();
        assert_eq!(p.estimate_cost("anything", 1_000_000, 1_000_000), 0.0);
    }
}
