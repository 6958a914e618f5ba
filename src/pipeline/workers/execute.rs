// src/pipeline/workers/execute.rs — Run the prompt version against one (model, case)

use chrono::Utc;
use tracing::{debug, info, warn};

use super::WorkerContext;
use crate::infra::errors::PipelineError;
use crate::pipeline::fan_in::UnitOutcome;
use crate::pipeline::prompt;
use crate::pipeline::queue::{ExecuteJob, Stage};
use crate::pipeline::types::{ExecKey, ExecutionResult, IterationState};

pub async fn run(ctx: &WorkerContext, job: ExecuteJob) -> Result<(), PipelineError> {
    let key = ExecKey::new(job.model.key(), &job.case_id);
    let Some(it) = ctx.live_iteration(&job.iteration_id, IterationState::Executing)? else {
        return Ok(());
    };
    let execution_id = key.execution_id(&it.id);

    // Redelivered after the result was stored but before completion was reported.
    if ctx.store.get_execution(&execution_id)?.is_some() {
        debug!(iteration_id = %it.id, unit = %key.unit(), "Execution already stored");
        return ctx
            .orchestrator
            .report_execution(&it.id, &key, UnitOutcome::Succeeded);
    }

    let experiment = ctx.store.experiment(&it.experiment_id)?;
    let version = ctx.store.prompt_version(&it.prompt_version_id)?;
    let case = experiment
        .case(&job.case_id)
        .ok_or_else(|| PipelineError::not_found("dataset case", &job.case_id))?;
    let messages = prompt::execution_messages(&version, case)?;

    let response = match ctx.call(Stage::Execute, &job.model, messages).await {
        Ok(r) => r,
        Err(e @ PipelineError::Configuration(_)) => return Err(e),
        Err(e) => {
            warn!(iteration_id = %it.id, unit = %key.unit(), "Execution failed permanently: {}", e);
            return ctx
                .orchestrator
                .report_execution(&it.id, &key, UnitOutcome::Failed(e.to_string()));
        }
    };

    let result = ExecutionResult {
        id: execution_id,
        iteration_id: it.id.clone(),
        key: key.clone(),
        output: response.text,
        usage: response.usage,
        latency_ms: response.latency_ms,
        cached: response.cached,
        model_id: response.model_id,
        created_at: Utc::now(),
    };
    ctx.store.put_execution(&result)?;
    info!(
        iteration_id = %it.id,
        stage = "execute",
        unit = %key.unit(),
        cached = result.cached,
        latency_ms = result.latency_ms,
        "Execution stored"
    );
    ctx.orchestrator
        .report_execution(&it.id, &key, UnitOutcome::Succeeded)
}
