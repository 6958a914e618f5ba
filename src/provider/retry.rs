// src/provider/retry.rs — Retry with exponential backoff for model providers
//
// Retries: rate limits (429), server errors (5xx), timeouts, connection resets.
// Does NOT retry: bad request (400), auth errors (401, 403), configuration errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatRequest, ChatResponse, ProviderAdapter, SamplingParams};
use crate::infra::config::RetrySettings;
use crate::infra::errors::PipelineError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            initial_delay: s.initial_delay(),
            backoff_factor: s.backoff_factor,
            max_delay: s.max_delay(),
            jitter_fraction: s.jitter_fraction,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. Used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            backoff_factor: 1.0,
            max_delay: Duration::ZERO,
            jitter_fraction: 0.0,
        }
    }

    /// Delay for a given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32, rate_limit_delay: Option<Duration>) -> Duration {
        // If the server told us how long to wait, use that (with a small buffer).
        if let Some(rl_delay) = rate_limit_delay {
            return rl_delay + Duration::from_millis(100);
        }

        let base_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);
        let jitter = deterministic_jitter(attempt, self.jitter_fraction);

        Duration::from_millis((capped_ms * jitter).max(0.0) as u64)
    }
}

/// A provider wrapper that adds retry with exponential backoff.
pub struct RetryProvider {
    inner: Arc<dyn ProviderAdapter>,
    config: RetryConfig,
}

impl RetryProvider {
    pub fn new(inner: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            inner,
            config: RetryConfig::default(),
        }
    }

    pub fn with_config(inner: Arc<dyn ProviderAdapter>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

/// Extract rate-limit retry delay from the error, if available.
fn rate_limit_delay(error: &PipelineError) -> Option<Duration> {
    match error {
        PipelineError::Provider {
            retry_after_ms: Some(ms),
            ..
        } if *ms > 0 => Some(Duration::from_millis(*ms)),
        _ => None,
    }
}

/// Deterministic jitter for a given attempt to keep retries reproducible in tests.
/// Returns a multiplier in [1 - fraction, 1 + fraction].
fn deterministic_jitter(attempt: u32, fraction: f64) -> f64 {
    let hash = (attempt.wrapping_mul(2654435761)) as f64 / u32::MAX as f64;
    1.0 + fraction * (2.0 * hash - 1.0)
}

#[async_trait]
impl ProviderAdapter for RetryProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let mut attempt = 0;
        loop {
            match self.inner.chat(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if !e.is_retriable() || attempt >= self.config.max_retries {
                        return Err(e);
                    }

                    let delay = self.config.delay_for_attempt(attempt, rate_limit_delay(&e));
                    tracing::warn!(
                        provider = self.inner.id(),
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after error: {}",
                        e
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn estimate_cost(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        self.inner
            .estimate_cost(model, prompt_tokens, completion_tokens)
    }

    fn validate_model(&self, model: &str, params: &SamplingParams) -> Result<(), PipelineError> {
        self.inner.validate_model(model, params)
    }
}
