// src/pipeline/workers/generate.rs — Propose new dataset cases

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use super::WorkerContext;
use crate::evaluator::parser::extract_json_array;
use crate::infra::errors::PipelineError;
use crate::pipeline::fan_in::UnitOutcome;
use crate::pipeline::prompt;
use crate::pipeline::queue::{ScopedJob, Stage};
use crate::pipeline::types::GeneratedCase;

#[derive(Debug, Deserialize)]
struct Proposal {
    input: String,
    #[serde(default)]
    expected: Option<String>,
}

/// Generation never gates the decision. Any failure is recorded on the
/// stage counter and the iteration carries on.
pub async fn run(ctx: &WorkerContext, job: ScopedJob) -> Result<(), PipelineError> {
    let outcome = match generate(ctx, &job).await {
        Ok(stored) => {
            info!(iteration_id = %job.iteration_id, stage = "generate", stored, "Dataset proposals stored");
            UnitOutcome::Succeeded
        }
        Err(e) => {
            warn!(iteration_id = %job.iteration_id, stage = "generate", "Generation failed: {}", e);
            UnitOutcome::Failed(e.to_string())
        }
    };
    ctx.orchestrator
        .record_maintenance(&job.iteration_id, Stage::Generate, outcome)
}

async fn generate(ctx: &WorkerContext, job: &ScopedJob) -> Result<usize, PipelineError> {
    let it = ctx.store.iteration(&job.iteration_id)?;
    if it.cancel_requested {
        return Ok(0);
    }
    let experiment = ctx.store.experiment(&it.experiment_id)?;
    let model = experiment
        .generator
        .as_ref()
        .unwrap_or(&experiment.refiner)
        .clone();
    let messages = prompt::generate_messages(&experiment, ctx.config().generate_count)?;
    let response = ctx.call(Stage::Generate, &model, messages).await?;

    let proposals = parse_proposals(&response.text)?;
    let mut stored = 0;
    for (i, p) in proposals
        .into_iter()
        .take(ctx.config().generate_count as usize)
        .enumerate()
    {
        let case = GeneratedCase {
            id: format!("{}#gen{}", it.id, i + 1),
            experiment_id: experiment.id.clone(),
            iteration_id: it.id.clone(),
            input: p.input,
            expected: p.expected.filter(|e| !e.trim().is_empty()),
            created_at: Utc::now(),
        };
        if ctx.store.put_generated_case(&case)? {
            stored += 1;
        }
    }
    Ok(stored)
}

fn parse_proposals(reply: &str) -> Result<Vec<Proposal>, PipelineError> {
    let json = extract_json_array(reply).ok_or_else(|| {
        PipelineError::Validation("generator reply contains no JSON array".into())
    })?;
    let proposals: Vec<Proposal> = serde_json::from_str(json)?;
    Ok(proposals
        .into_iter()
        .filter(|p| !p.input.trim().is_empty())
        .collect())
}
