// src/pipeline/workers/mod.rs — Stage workers
//
// Workers are stateless between jobs: everything they need is loaded from the
// store, and they hand outcomes to the orchestrator instead of deciding stage
// transitions themselves.

pub mod aggregate;
pub mod execute;
pub mod generate;
pub mod judge;
pub mod refine;
pub mod safety;

use std::sync::Arc;

use tracing::debug;

use super::cost::CostTracker;
use super::orchestrator::Orchestrator;
use super::queue::{Job, Stage};
use super::types::{Iteration, IterationState, ModelConfig};
use crate::infra::config::PipelineConfig;
use crate::infra::errors::PipelineError;
use crate::provider::resolver::ProviderRegistry;
use crate::provider::{ChatRequest, ChatResponse, Message};
use crate::store::PipelineStore;

pub use safety::SafetyFilter;

/// Dependencies injected into every worker at startup.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn PipelineStore>,
    pub providers: Arc<ProviderRegistry>,
    pub orchestrator: Arc<Orchestrator>,
    pub costs: Arc<CostTracker>,
    pub safety: Arc<SafetyFilter>,
}

impl WorkerContext {
    pub fn config(&self) -> &PipelineConfig {
        self.orchestrator.config()
    }

    /// Load the job's iteration, or `None` when it no longer wants work for
    /// `state` (cancelled, finished, or already past that stage).
    pub(crate) fn live_iteration(
        &self,
        iteration_id: &str,
        state: IterationState,
    ) -> Result<Option<Iteration>, PipelineError> {
        let it = self.store.iteration(iteration_id)?;
        if it.accepts_work() && it.state == state {
            Ok(Some(it))
        } else {
            debug!(iteration_id, state = %it.state, wanted = %state, "Skipping job for inactive iteration");
            Ok(None)
        }
    }

    /// One model call through the cached, retrying adapter, charged to `stage`.
    pub(crate) async fn call(
        &self,
        stage: Stage,
        model: &ModelConfig,
        messages: Vec<Message>,
    ) -> Result<ChatResponse, PipelineError> {
        let provider = self.providers.get(&model.provider)?;
        provider.validate_model(&model.model, &model.params)?;
        let request = ChatRequest::new(&model.model, messages)
            .with_params(model.params.clone())
            .with_seed(model.seed);
        let response = provider.chat(request).await?;
        let cost = provider.estimate_cost(
            &model.model,
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
        );
        self.costs.record(stage, &model.key(), &response, cost);
        Ok(response)
    }
}

/// Route a job to its stage's worker. The match is exhaustive over the closed
/// job enum, so no job can reach the wrong worker.
pub async fn handle(ctx: &WorkerContext, job: Job) -> Result<(), PipelineError> {
    match job {
        Job::Execute(j) => execute::run(ctx, j).await,
        Job::Judge(j) => judge::run(ctx, j).await,
        Job::Aggregate { iteration_id } => aggregate::run(ctx, &iteration_id).await,
        Job::Refine { iteration_id } => refine::run(ctx, &iteration_id).await,
        Job::Generate(j) => generate::run(ctx, j).await,
        Job::Safety(j) => safety::run(ctx, j).await,
    }
}
