// src/pipeline/workers/aggregate.rs — Summarize judgments and decide continue/stop

use std::collections::BTreeMap;

use tracing::{debug, error, info};

use super::WorkerContext;
use crate::infra::errors::PipelineError;
use crate::pipeline::stop_rule;
use crate::pipeline::types::{AggregateReport, Iteration, JudgeScore};

pub async fn run(ctx: &WorkerContext, iteration_id: &str) -> Result<(), PipelineError> {
    let it = ctx.store.iteration(iteration_id)?;
    if it.decision.is_some() || it.state.is_terminal() {
        debug!(iteration_id, state = %it.state, "Aggregate already ran");
        return Ok(());
    }
    if let Err(e) = it.check_aggregation_ready() {
        error!(iteration_id, state = %it.state, "Aggregate job ran before judge fan-in: {}", e);
        return Err(e);
    }

    let experiment = ctx.store.experiment(&it.experiment_id)?;
    let scores = ctx.store.list_judge_scores(iteration_id)?;
    let report = summarize(&it, &scores);

    let history: Vec<f64> = ctx
        .store
        .list_iterations(&experiment.id)?
        .iter()
        .filter(|i| i.ordinal < it.ordinal)
        .filter_map(Iteration::score)
        .collect();
    let decision = stop_rule::evaluate(&history, report.mean_score, &experiment.stop_rules);

    info!(
        iteration_id,
        stage = "aggregate",
        mean = report.mean_score,
        scored = report.scored,
        missing = report.missing_judgments,
        %decision,
        "Aggregated"
    );
    ctx.orchestrator.record_decision(iteration_id, decision, report)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Means over whatever judgments exist. Failed executions and judge failures
/// are counted, not scored, so a degraded iteration still aggregates.
pub fn summarize(it: &Iteration, scores: &[JudgeScore]) -> AggregateReport {
    let overall: Vec<f64> = scores.iter().map(|s| s.overall).collect();

    let mut by_criterion: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    let mut by_model: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for s in scores {
        for (name, value) in &s.criteria {
            by_criterion.entry(name.clone()).or_default().push(*value);
        }
        by_model
            .entry(s.exec.model.clone())
            .or_default()
            .push(s.overall);
    }

    AggregateReport {
        mean_score: mean(&overall),
        per_criterion: by_criterion.into_iter().map(|(k, v)| (k, mean(&v))).collect(),
        per_model: by_model.into_iter().map(|(k, v)| (k, mean(&v))).collect(),
        scored: scores.len(),
        missing_judgments: it.judge.failed().len(),
        failed_executions: it.execute.failed().len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fan_in::{StageFanIn, UnitOutcome};
    use crate::pipeline::types::{ExecKey, ScoreKey};
    use chrono::Utc;

    fn score(model: &str, case: &str, accuracy: f64, tone: f64) -> JudgeScore {
        let exec = ExecKey::new(model, case);
        let key = ScoreKey::new(exec.execution_id("it"), "j");
        JudgeScore {
            id: key.unit(),
            iteration_id: "it".into(),
            key,
            exec,
            criteria: BTreeMap::from([
                ("accuracy".to_string(), accuracy),
                ("tone".to_string(), tone),
            ]),
            overall: (accuracy + tone) / 2.0,
            rationale: String::new(),
            preference: None,
            created_at: Utc::now(),
        }
    }

    fn iteration() -> Iteration {
        serde_json::from_value(serde_json::json!({
            "id": "it",
            "experiment_id": "exp",
            "prompt_version_id": "exp@v1",
            "prompt_version": 1,
            "ordinal": 1,
            "state": "aggregating",
            "execute": StageFanIn::default(),
            "judge": StageFanIn::default(),
            "created_at": Utc::now(),
            "updated_at": Utc::now(),
        }))
        .unwrap()
    }

    #[test]
    fn test_summarize_means() {
        let scores = vec![
            score("a/m1", "c1", 1.0, 0.5),
            score("a/m1", "c2", 0.5, 0.5),
            score("a/m2", "c1", 0.0, 0.0),
        ];
        let r = summarize(&iteration(), &scores);
        assert_eq!(r.scored, 3);
        assert!((r.mean_score - (0.75 + 0.5 + 0.0) / 3.0).abs() < 1e-9);
        assert!((r.per_criterion["accuracy"] - 0.5).abs() < 1e-9);
        assert!((r.per_model["a/m1"] - 0.625).abs() < 1e-9);
        assert_eq!(r.per_model["a/m2"], 0.0);
    }

    #[test]
    fn test_summarize_counts_missing() {
        let mut it = iteration();
        it.judge = StageFanIn::new(["x", "y"]);
        it.judge.record("x", UnitOutcome::Failed("unparseable".into()));
        it.judge.record("y", UnitOutcome::Succeeded);
        let r = summarize(&it, &[score("a/m1", "c1", 0.8, 0.8)]);
        assert_eq!(r.missing_judgments, 1);
        assert_eq!(r.failed_executions, 0);
    }

    #[test]
    fn test_no_scores_is_zero() {
        let r = summarize(&iteration(), &[]);
        assert_eq!(r.mean_score, 0.0);
        assert!(r.per_model.is_empty());
    }
}
