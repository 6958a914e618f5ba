// src/pipeline/mod.rs — Execute → judge → aggregate → refine loop

pub mod cost;
pub mod fan_in;
pub mod orchestrator;
pub mod prompt;
pub mod queue;
pub mod runtime;
pub mod stop_rule;
pub mod types;
pub mod workers;

use std::sync::Arc;

use crate::infra::config::Config;
use crate::infra::errors::PipelineError;
use crate::provider::resolver::ProviderRegistry;
use crate::store::PipelineStore;

pub use orchestrator::{IterationStatus, Orchestrator, PipelineEvent};
pub use runtime::PipelineRuntime;
pub use workers::{SafetyFilter, WorkerContext};

/// Everything a process needs to run the pipeline, wired once at startup.
pub struct Pipeline {
    pub store: Arc<dyn PipelineStore>,
    pub queues: Arc<queue::QueueSet>,
    pub orchestrator: Arc<Orchestrator>,
    pub providers: Arc<ProviderRegistry>,
    pub costs: Arc<cost::CostTracker>,
    config: Config,
    safety: Arc<SafetyFilter>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<dyn PipelineStore>,
        providers: ProviderRegistry,
    ) -> Result<Self, PipelineError> {
        let queues = Arc::new(queue::QueueSet::new());
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            queues.clone(),
            config.pipeline.clone(),
        ));
        let safety = Arc::new(SafetyFilter::new(&config.safety)?);
        Ok(Self {
            store,
            queues,
            orchestrator,
            providers: Arc::new(providers),
            costs: Arc::new(cost::CostTracker::new()),
            config,
            safety,
        })
    }

    pub fn context(&self) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            providers: self.providers.clone(),
            orchestrator: self.orchestrator.clone(),
            costs: self.costs.clone(),
            safety: self.safety.clone(),
        }
    }

    /// Start one worker pool per stage. Call once per pipeline.
    pub fn start_workers(&self) -> Result<PipelineRuntime, PipelineError> {
        PipelineRuntime::start(self.context(), &self.queues, self.config.concurrency.clone())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
