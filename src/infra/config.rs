// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::infra::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Provider endpoints keyed by provider id (e.g. `openai`, `local-vllm`).
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,

    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stricter re-prompts allowed after an unparseable judge response.
    pub judge_parse_retries: u32,
    /// Start the next iteration as soon as refinement produces a new version.
    pub auto_continue: bool,
    pub enable_safety: bool,
    pub enable_generate: bool,
    /// Dataset cases requested from the generator per iteration.
    pub generate_count: u32,
    /// Lowest-scoring outputs shown to the refiner.
    pub refine_examples: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            judge_parse_retries: 2,
            auto_continue: true,
            enable_safety: true,
            enable_generate: false,
            generate_count: 3,
            refine_examples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter_fraction: 0.2,
        }
    }
}

impl RetrySettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub default_per_provider: usize,
    pub providers: HashMap<String, usize>,
    /// Cap on concurrently running jobs for stages that make no provider call.
    pub stage_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_per_provider: 4,
            providers: HashMap::new(),
            stage_workers: 16,
        }
    }
}

impl ConcurrencyConfig {
    pub fn limit_for(&self, provider: &str) -> usize {
        self.providers
            .get(provider)
            .copied()
            .unwrap_or(self.default_per_provider)
            .max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    OpenaiCompat,
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub deny_patterns: Vec<DenyPattern>,
    /// Findings at or above this severity (0-10) block the iteration.
    pub block_severity: u8,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            deny_patterns: Vec::new(),
            block_severity: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenyPattern {
    pub pattern: String,
    pub label: String,
    #[serde(default = "default_severity")]
    pub severity: u8,
}

fn default_severity() -> u8 {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
    pub tokens: Vec<ApiToken>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7878,
            tokens: Vec::new(),
        }
    }
}

/// A bearer token bound to a principal and the projects it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiToken {
    pub token: String,
    pub principal: String,
    #[serde(default)]
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            path: None,
        }
    }
}

impl Config {
    /// Load config from file, falling back to defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = paths::config_file();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
