// src/pipeline/workers/judge.rs — Score one execution with one judge
//
// Unparseable replies are retried with a stricter re-prompt. The changed
// prompt also changes the cache fingerprint, so a retry is a real new call.
// A unit that never yields a score is stored as a JudgeFailure.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::WorkerContext;
use crate::evaluator::parse_judgment;
use crate::infra::errors::PipelineError;
use crate::pipeline::fan_in::UnitOutcome;
use crate::pipeline::prompt;
use crate::pipeline::queue::{JudgeJob, Stage};
use crate::pipeline::types::{
    ExecutionResult, Experiment, Iteration, IterationState, JudgeFailure, JudgeMode, JudgeScore,
    ScoreKey,
};

pub async fn run(ctx: &WorkerContext, job: JudgeJob) -> Result<(), PipelineError> {
    let key = ScoreKey::new(&job.execution_id, &job.judge.id);
    let unit = key.unit();
    let Some(it) = ctx.live_iteration(&job.iteration_id, IterationState::Judging)? else {
        return Ok(());
    };

    if ctx.store.has_judgment(&unit)? {
        debug!(iteration_id = %it.id, unit = %unit, "Judgment already stored");
        let failed = ctx
            .store
            .list_judge_failures(&it.id)?
            .into_iter()
            .find(|f| f.id == unit);
        let outcome = match failed {
            Some(f) => UnitOutcome::Failed(f.reason),
            None => UnitOutcome::Succeeded,
        };
        return ctx.orchestrator.report_judgment(&it.id, &key, outcome);
    }

    let execution = ctx.store.execution(&job.execution_id)?;
    let experiment = ctx.store.experiment(&it.experiment_id)?;
    let case = experiment
        .case(&execution.key.case_id)
        .ok_or_else(|| PipelineError::not_found("dataset case", &execution.key.case_id))?;
    let previous = match job.judge.mode {
        JudgeMode::Pairwise => previous_output(ctx, &experiment, &it, &execution)?,
        JudgeMode::Pointwise => None,
    };

    let max_attempts = ctx.config().judge_parse_retries + 1;
    let mut reason = String::new();
    let mut attempts = 0;
    for attempt in 0..max_attempts {
        // a cancel can land while the previous attempt was in flight
        if attempt > 0 && ctx.live_iteration(&it.id, IterationState::Judging)?.is_none() {
            debug!(iteration_id = %it.id, unit = %unit, attempt, "Iteration no longer judging; dropping re-prompt");
            return Ok(());
        }
        attempts = attempt + 1;
        let messages = prompt::judge_messages(
            &experiment,
            job.judge.system_prompt.as_deref(),
            case,
            &execution.output,
            previous.as_deref(),
            attempt,
        )?;
        let response = match ctx.call(Stage::Judge, &job.judge.model, messages).await {
            Ok(r) => r,
            Err(e @ PipelineError::Configuration(_)) => return Err(e),
            Err(e) => {
                // Provider retries are already exhausted inside the adapter.
                reason = e.to_string();
                break;
            }
        };
        match parse_judgment(&response.text, &experiment.rubric) {
            Ok(parsed) => {
                let score = JudgeScore {
                    id: unit.clone(),
                    iteration_id: it.id.clone(),
                    key: key.clone(),
                    exec: execution.key.clone(),
                    overall: experiment.rubric.overall(&parsed.scores),
                    criteria: parsed.scores,
                    rationale: parsed.rationale,
                    preference: previous.as_ref().and(parsed.preference),
                    created_at: Utc::now(),
                };
                ctx.store.put_judge_score(&score)?;
                info!(
                    iteration_id = %it.id,
                    stage = "judge",
                    unit = %unit,
                    overall = score.overall,
                    attempts,
                    "Judgment stored"
                );
                return ctx
                    .orchestrator
                    .report_judgment(&it.id, &key, UnitOutcome::Succeeded);
            }
            Err(e) => {
                warn!(iteration_id = %it.id, unit = %unit, attempt = attempts, "Judge reply unparseable: {}", e);
                reason = e.to_string();
            }
        }
    }

    let failure = JudgeFailure {
        id: unit.clone(),
        iteration_id: it.id.clone(),
        key: key.clone(),
        exec: execution.key.clone(),
        reason: reason.clone(),
        attempts,
        created_at: Utc::now(),
    };
    ctx.store.put_judge_failure(&failure)?;
    warn!(iteration_id = %it.id, unit = %unit, attempts, "Judge failure recorded");
    ctx.orchestrator
        .report_judgment(&it.id, &key, UnitOutcome::Failed(reason))
}

/// Output of the same (model, case) in the preceding iteration, if any.
fn previous_output(
    ctx: &WorkerContext,
    experiment: &Experiment,
    it: &Iteration,
    execution: &ExecutionResult,
) -> Result<Option<String>, PipelineError> {
    if it.ordinal <= 1 {
        return Ok(None);
    }
    let prior = ctx
        .store
        .list_iterations(&experiment.id)?
        .into_iter()
        .find(|i| i.ordinal == it.ordinal - 1);
    let Some(prior) = prior else {
        return Ok(None);
    };
    Ok(ctx
        .store
        .get_execution(&execution.key.execution_id(&prior.id))?
        .map(|e| e.output))
}
