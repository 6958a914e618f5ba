// src/provider/resolver.rs — Build the provider registry from config and environment

use std::collections::HashMap;
use std::sync::Arc;

use super::anthropic::AnthropicProvider;
use super::cached::CachedProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAIProvider;
use super::retry::{RetryConfig, RetryProvider};
use super::{ModelRef, ProviderAdapter, SamplingParams};
use crate::cache::ResponseCache;
use crate::infra::config::{Config, ProviderEntry, ProviderKind};
use crate::infra::errors::PipelineError;

/// Process-wide set of provider adapters, each wrapped as Cached(Retry(provider)).
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    cache: Arc<ResponseCache>,
    retry: RetryConfig,
}

impl ProviderRegistry {
    pub fn new(cache: Arc<ResponseCache>, retry: RetryConfig) -> Self {
        Self {
            adapters: HashMap::new(),
            cache,
            retry,
        }
    }

    /// Build from `[providers.*]`, falling back to well-known env vars when the
    /// section is empty. Construction errors are fatal.
    pub fn from_config(config: &Config, cache: Arc<ResponseCache>) -> Result<Self, PipelineError> {
        Self::from_config_with_env(config, cache, |k| std::env::var(k).ok())
    }

    pub fn from_config_with_env(
        config: &Config,
        cache: Arc<ResponseCache>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PipelineError> {
        let mut registry = Self::new(cache, RetryConfig::from(&config.retry));

        if config.providers.is_empty() {
            for (id, entry) in discover_from_env(&env) {
                registry.register(&id, build_adapter(&id, &entry, &env)?);
            }
        } else {
            let mut ids: Vec<&String> = config.providers.keys().collect();
            ids.sort();
            for id in ids {
                let entry = &config.providers[id];
                registry.register(id, build_adapter(id, entry, &env)?);
            }
        }

        tracing::info!(providers = ?registry.ids(), "Provider registry ready");
        Ok(registry)
    }

    /// Register a concrete adapter under `id`, wrapping it with retry and cache.
    pub fn register(&mut self, id: &str, adapter: Arc<dyn ProviderAdapter>) {
        let retrying: Arc<dyn ProviderAdapter> =
            Arc::new(RetryProvider::with_config(adapter, self.retry.clone()));
        let cached: Arc<dyn ProviderAdapter> =
            Arc::new(CachedProvider::new(retrying, self.cache.clone()));
        self.adapters.insert(id.to_string(), cached);
    }

    pub fn get(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>, PipelineError> {
        self.adapters.get(provider).cloned().ok_or_else(|| {
            PipelineError::Configuration(format!("provider '{provider}' is not configured"))
        })
    }

    /// Resolve and validate a model reference before any work is dispatched.
    pub fn validate(&self, model: &ModelRef, params: &SamplingParams) -> Result<(), PipelineError> {
        self.get(&model.provider)?.validate_model(&model.model, params)
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn default_key_env(kind: ProviderKind) -> Option<&'static str> {
    match kind {
        ProviderKind::Openai => Some("OPENAI_API_KEY"),
        ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
        ProviderKind::OpenaiCompat | ProviderKind::Ollama => None,
    }
}

fn discover_from_env(env: &impl Fn(&str) -> Option<String>) -> Vec<(String, ProviderEntry)> {
    let mut found = Vec::new();
    let entry = |kind, base_url| ProviderEntry {
        kind,
        base_url,
        api_key_env: None,
        timeout_seconds: 120,
    };
    if env("ANTHROPIC_API_KEY").is_some() {
        found.push(("anthropic".to_string(), entry(ProviderKind::Anthropic, None)));
    }
    if env("OPENAI_API_KEY").is_some() {
        found.push(("openai".to_string(), entry(ProviderKind::Openai, None)));
    }
    if let Some(host) = env("OLLAMA_HOST") {
        found.push(("ollama".to_string(), entry(ProviderKind::Ollama, Some(host))));
    }
    found
}

fn build_adapter(
    id: &str,
    entry: &ProviderEntry,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn ProviderAdapter>, PipelineError> {
    let key_var = entry.api_key_env.as_deref().or(default_key_env(entry.kind));
    let api_key = key_var.and_then(env).filter(|k| !k.trim().is_empty());

    let adapter: Arc<dyn ProviderAdapter> = match entry.kind {
        ProviderKind::Openai => {
            let key = api_key.ok_or_else(|| missing_key(id, key_var))?;
            match &entry.base_url {
                Some(url) => Arc::new(OpenAIProvider::compatible(
                    id,
                    Some(key),
                    Some(url.clone()),
                    entry.timeout_seconds,
                )?),
                None => Arc::new(OpenAIProvider::new(key)?),
            }
        }
        ProviderKind::OpenaiCompat => Arc::new(OpenAIProvider::compatible(
            id,
            api_key,
            entry.base_url.clone(),
            entry.timeout_seconds,
        )?),
        ProviderKind::Anthropic => {
            let key = api_key.ok_or_else(|| missing_key(id, key_var))?;
            Arc::new(AnthropicProvider::new(
                key,
                entry.base_url.clone(),
                entry.timeout_seconds,
            )?)
        }
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(
            entry.base_url.clone(),
            entry.timeout_seconds,
        )?),
    };
    Ok(adapter)
}

fn missing_key(id: &str, var: Option<&str>) -> PipelineError {
    PipelineError::Configuration(format!(
        "provider '{id}': API key not set (expected env var {})",
        var.unwrap_or("<unset>")
    ))
}
