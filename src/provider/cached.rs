// src/provider/cached.rs — Cache-through wrapper for any provider
//
// Every adapter handed to the pipeline is wrapped here: the cache is read
// before a network call and written after a successful one.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ChatRequest, ChatResponse, ProviderAdapter, SamplingParams};
use crate::cache::{fingerprint, ResponseCache};
use crate::infra::errors::PipelineError;

pub struct CachedProvider {
    inner: Arc<dyn ProviderAdapter>,
    cache: Arc<ResponseCache>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn ProviderAdapter>, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl ProviderAdapter for CachedProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let key = fingerprint(self.inner.id(), &request);

        if let Some(hit) = self.cache.read(&key) {
            tracing::debug!(provider = self.inner.id(), model = %request.model, key = %key, "Cache hit");
            return Ok(hit);
        }

        let response = self.inner.chat(request).await?;
        self.cache.write(key, &response);
        Ok(response)
    }

    fn estimate_cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        self.inner
            .estimate_cost(model, prompt_tokens, completion_tokens)
    }

    fn validate_model(&self, model: &str, params: &SamplingParams) -> Result<(), PipelineError> {
        self.inner.validate_model(model, params)
    }
}
