// tests/common/mod.rs — Shared fixtures: scripted provider, experiment builder, pipeline harness

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use promptloop::cache::ResponseCache;
use promptloop::infra::config::{Config, StorageBackend};
use promptloop::infra::errors::PipelineError;
use promptloop::pipeline::queue::Stage;
use promptloop::pipeline::runtime::run_job;
use promptloop::pipeline::types::{
    Criterion, DatasetCase, Experiment, JudgeConfig, ModelConfig, PromptVersion, Rubric,
    StopRules,
};
use promptloop::pipeline::{Pipeline, WorkerContext};
use promptloop::provider::resolver::ProviderRegistry;
use promptloop::provider::retry::RetryConfig;
use promptloop::provider::{ChatRequest, ChatResponse, ProviderAdapter, Role, TokenUsage};
use promptloop::store::{MemoryStore, PipelineStore};

pub const PROVIDER: &str = "scripted";
pub const JUDGE_MODEL: &str = "judge";
pub const REFINER_MODEL: &str = "refiner";
pub const REFINED_PROMPT: &str = "Answer precisely: {{ input }}";

/// How the scripted provider answers. Writers echo their prompt, the judge
/// scores by writer, the refiner returns a fixed rewrite.
#[derive(Clone, Default)]
pub struct Script {
    /// Execute calls fail with HTTP 500 when "<writer>|<prompt>" contains any of these.
    pub fail_execute_when: Vec<String>,
    /// Judge calls whose body contains any of these get prose instead of JSON.
    pub garble_judge_when: Vec<String>,
    /// Per-writer accuracy score; writers not listed get 0.5.
    pub scores: Vec<(String, f64)>,
}

impl Script {
    fn respond(&self, request: &ChatRequest) -> Result<String, PipelineError> {
        let body = last_user(request);
        match request.model.as_str() {
            JUDGE_MODEL => {
                if self.garble_judge_when.iter().any(|m| body.contains(m.as_str())) {
                    return Ok("Honestly it reads fine to me.".into());
                }
                let score = self
                    .scores
                    .iter()
                    .find(|(writer, _)| body.contains(&format!("{writer}: ")))
                    .map(|(_, s)| *s)
                    .unwrap_or(0.5);
                if body.contains("Output PREVIOUS:") {
                    return Ok(format!(
                        r#"{{"scores": {{"accuracy": {score}}}, "preference": "current", "rationale": "graded"}}"#
                    ));
                }
                Ok(format!(
                    r#"{{"scores": {{"accuracy": {score}}}, "rationale": "graded"}}"#
                ))
            }
            REFINER_MODEL => Ok(format!(
                r#"{{"prompt": "{REFINED_PROMPT}", "system": "Be exact."}}"#
            )),
            writer => {
                let probe = format!("{writer}|{body}");
                if self.fail_execute_when.iter().any(|m| probe.contains(m.as_str())) {
                    return Err(PipelineError::from_status(PROVIDER, 500, "scripted outage"));
                }
                Ok(format!("{writer}: {body}"))
            }
        }
    }
}

pub fn last_user(request: &ChatRequest) -> &str {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

type Hook = Box<dyn Fn(&ChatRequest) + Send + Sync>;

/// In-process provider that records every request it actually receives
/// (cache hits never reach it).
pub struct ScriptedProvider {
    script: Script,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
    on_judge: Mutex<Option<Hook>>,
}

impl ScriptedProvider {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            on_judge: Mutex::new(None),
        }
    }

    /// Run `hook` inside every judge call, before the reply is produced.
    pub fn on_judge_call(&self, hook: impl Fn(&ChatRequest) + Send + Sync + 'static) {
        *self.on_judge.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn requests_for(&self, model: &str) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.model == model)
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, model: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.model == model)
            .count()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn id(&self) -> &str {
        PROVIDER
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if request.model == JUDGE_MODEL {
            if let Some(hook) = self.on_judge.lock().unwrap().as_ref() {
                hook(&request);
            }
        }
        let text = self.script.respond(&request)?;
        Ok(ChatResponse {
            text,
            usage: TokenUsage::new(120, 40),
            latency_ms: 5,
            cached: false,
            model_id: request.model.clone(),
        })
    }
}

pub fn model(name: &str) -> ModelConfig {
    ModelConfig::new(PROVIDER, name)
}

/// `writers` × `cases` execute units, `judges` pointwise judges, one
/// `accuracy` criterion. Case inputs are "question 1", "question 2", ...
pub fn experiment(id: &str, writers: &[&str], cases: usize, judges: usize) -> (Experiment, PromptVersion) {
    let experiment = Experiment {
        id: id.to_string(),
        project_id: "proj-1".into(),
        name: format!("{id} experiment"),
        objective: "Answer the customer question correctly".into(),
        rubric: Rubric {
            criteria: vec![Criterion {
                name: "accuracy".into(),
                description: "The answer is correct".into(),
                weight: 1.0,
            }],
        },
        models: writers.iter().map(|w| model(w)).collect(),
        judges: (1..=judges)
            .map(|i| JudgeConfig {
                id: format!("j{i}"),
                model: model(JUDGE_MODEL),
                mode: Default::default(),
                system_prompt: None,
            })
            .collect(),
        refiner: model(REFINER_MODEL),
        generator: None,
        dataset: (1..=cases)
            .map(|i| DatasetCase {
                id: format!("case-{i}"),
                input: format!("question {i}"),
                expected: None,
            })
            .collect(),
        stop_rules: StopRules {
            max_iterations: 5,
            target_score: 0.9,
            plateau_window: 2,
            plateau_delta: 0.01,
        },
        current_version: 1,
        created_at: Utc::now(),
    };
    let seed = PromptVersion::new(id, 1, "Answer: {{ input }}");
    (experiment, seed)
}

pub struct Harness {
    pub pipeline: Pipeline,
    pub provider: Arc<ScriptedProvider>,
}

impl Harness {
    /// In-memory store, immediate retries (one retry), `auto_continue` off.
    pub fn new(script: Script) -> Self {
        Self::with_config(script, |_| {})
    }

    pub fn with_config(script: Script, tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config.pipeline.auto_continue = false;
        tweak(&mut config);
        Self::with_store(script, config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(script: Script, config: Config, store: Arc<dyn PipelineStore>) -> Self {
        let provider = Arc::new(ScriptedProvider::new(script));
        let mut registry =
            ProviderRegistry::new(Arc::new(ResponseCache::new()), RetryConfig::immediate(1));
        registry.register(PROVIDER, provider.clone());
        let pipeline = Pipeline::new(config, store, registry).unwrap();
        Self { pipeline, provider }
    }

    pub fn ctx(&self) -> WorkerContext {
        self.pipeline.context()
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.pipeline.store
    }

    pub fn register(&self, experiment: &Experiment, seed: &PromptVersion) {
        self.pipeline
            .orchestrator
            .register_experiment(experiment, seed)
            .unwrap();
    }

    pub fn start(&self, experiment_id: &str, version: u32) -> String {
        self.pipeline
            .orchestrator
            .start_iteration(experiment_id, &PromptVersion::id_for(experiment_id, version))
            .unwrap()
    }

    /// Run every queued job of one stage, in queue order.
    pub async fn drain_stage(&self, stage: Stage) -> usize {
        let ctx = self.ctx();
        let jobs = self.pipeline.queues.drain(stage);
        let n = jobs.len();
        for job in jobs {
            run_job(&ctx, job).await;
        }
        n
    }

    /// Keep draining stages in pipeline order until every queue is empty.
    pub async fn drain(&self) -> usize {
        let mut total = 0;
        loop {
            let mut ran = 0;
            for stage in Stage::ALL {
                ran += self.drain_stage(stage).await;
            }
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }
}
