// src/pipeline/workers/refine.rs — Rewrite the prompt from aggregated feedback

use serde::Deserialize;
use tracing::info;

use super::WorkerContext;
use crate::evaluator::parser::extract_json;
use crate::infra::errors::PipelineError;
use crate::pipeline::prompt::{self, FailureExample};
use crate::pipeline::queue::Stage;
use crate::pipeline::types::{Experiment, Iteration, IterationState};
use crate::util::excerpt;

/// Longest output excerpt shown to the refiner per failure.
const EXCERPT_CHARS: usize = 1200;

#[derive(Debug, Deserialize)]
struct RefinedPrompt {
    prompt: String,
    #[serde(default)]
    system: Option<String>,
}

pub async fn run(ctx: &WorkerContext, iteration_id: &str) -> Result<(), PipelineError> {
    let Some(it) = ctx.live_iteration(iteration_id, IterationState::Refining)? else {
        return Ok(());
    };
    let experiment = ctx.store.experiment(&it.experiment_id)?;
    let version = ctx.store.prompt_version(&it.prompt_version_id)?;
    let report = it.report.clone().unwrap_or_default();
    let failures = weakest_outputs(ctx, &experiment, &it, ctx.config().refine_examples)?;

    let messages = prompt::refine_messages(&experiment, &version, &report, &failures)?;
    let response = ctx.call(Stage::Refine, &experiment.refiner, messages).await?;
    let (text, system) = parse_refinement(&response.text)?;

    info!(
        iteration_id,
        stage = "refine",
        from_version = version.version,
        examples = failures.len(),
        "Refinement received"
    );
    ctx.orchestrator.complete_refine(iteration_id, text, system)?;
    Ok(())
}

/// The lowest-scoring judged outputs, one entry per judgment.
fn weakest_outputs(
    ctx: &WorkerContext,
    experiment: &Experiment,
    it: &Iteration,
    limit: usize,
) -> Result<Vec<FailureExample>, PipelineError> {
    let mut scores = ctx.store.list_judge_scores(&it.id)?;
    scores.sort_by(|a, b| a.overall.total_cmp(&b.overall));

    let mut out = Vec::with_capacity(limit);
    for score in scores.into_iter().take(limit) {
        let Some(execution) = ctx.store.get_execution(&score.key.execution_id)? else {
            continue;
        };
        let input = experiment
            .case(&execution.key.case_id)
            .map(|c| c.input.clone())
            .unwrap_or_default();
        out.push(FailureExample {
            model: execution.key.model.clone(),
            input,
            output: excerpt(&execution.output, EXCERPT_CHARS),
            score: score.overall,
            rationale: score.rationale,
        });
    }
    Ok(out)
}

/// Read `{"prompt", "system"}`; a reply without JSON is taken as the prompt itself.
pub(crate) fn parse_refinement(reply: &str) -> Result<(String, Option<String>), PipelineError> {
    if let Some(json) = extract_json(reply) {
        if let Ok(refined) = serde_json::from_str::<RefinedPrompt>(json) {
            if !refined.prompt.trim().is_empty() {
                return Ok((refined.prompt, refined.system));
            }
        }
    }
    let text = reply.trim();
    if text.is_empty() {
        return Err(PipelineError::Validation(
            "refiner returned an empty prompt".into(),
        ));
    }
    Ok((text.to_string(), None))
}
