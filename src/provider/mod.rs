// src/provider/mod.rs — Model provider layer

pub mod anthropic;
pub mod cached;
pub mod ollama;
pub mod openai;
pub mod pricing;
pub mod resolver;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::infra::errors::PipelineError;

/// Contract every model provider implements.
///
/// Implementations normalize the provider's wire format into a [`ChatResponse`];
/// no raw provider payload leaves this module.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Send one chat turn.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError>;

    /// Advisory USD cost for a call. Never blocks a call.
    fn estimate_cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        pricing::estimate_cost(model, prompt_tokens, completion_tokens)
    }

    /// Reject sampling parameters the provider cannot honour.
    fn validate_model(&self, model: &str, params: &SamplingParams) -> Result<(), PipelineError> {
        default_validate(self.id(), model, params)
    }
}

/// Range checks shared by every provider.
pub fn default_validate(
    provider: &str,
    model: &str,
    params: &SamplingParams,
) -> Result<(), PipelineError> {
    if model.trim().is_empty() {
        return Err(PipelineError::Configuration(format!(
            "provider '{provider}': model id is empty"
        )));
    }
    if let Some(t) = params.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err(PipelineError::Configuration(format!(
                "{provider}/{model}: temperature {t} outside 0.0-2.0"
            )));
        }
    }
    if let Some(p) = params.top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err(PipelineError::Configuration(format!(
                "{provider}/{model}: top_p {p} outside 0.0-1.0"
            )));
        }
    }
    if params.max_tokens == Some(0) {
        return Err(PipelineError::Configuration(format!(
            "{provider}/{model}: max_tokens must be positive"
        )));
    }
    Ok(())
}

/// Sampling parameters. Field order here is the canonical order used in cache fingerprints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub params: SamplingParams,
    pub seed: Option<u64>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            params: SamplingParams::default(),
            seed: None,
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// System turns joined, for providers that take the system prompt out of band.
    pub fn system_text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub cached: bool,
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Reference to a specific model on a specific provider.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}
