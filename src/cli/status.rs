// src/cli/status.rs — Stored iteration status

use std::collections::BTreeMap;

use crate::infra::config::Config;
use crate::pipeline::queue::Stage;
use crate::pipeline::IterationStatus;
use crate::store;

/// Print the status of an iteration straight from the store.
pub fn show_iteration(config: &Config, iteration_id: &str, json: bool) -> anyhow::Result<()> {
    let store = store::open(&config.storage)?;
    let it = store.iteration(iteration_id)?;
    let status = IterationStatus::from(&it);

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render(&status));
    }
    Ok(())
}

pub fn render(status: &IterationStatus) -> String {
    let mut out = String::new();
    out.push_str(&format!("Iteration {}\n", status.iteration_id));
    out.push_str(&format!(
        "  Experiment: {} (#{} on prompt v{})\n",
        status.experiment_id, status.ordinal, status.prompt_version
    ));
    out.push_str(&format!("  State:      {}\n", status.state));
    if let Some(decision) = &status.decision {
        out.push_str(&format!("  Decision:   {decision}\n"));
    }
    if let Some(reason) = &status.reason {
        out.push_str(&format!("  Reason:     {reason}\n"));
    }
    if let Some(score) = status.score {
        out.push_str(&format!("  Score:      {score:.3}\n"));
    }
    out.push_str(&render_counts(&status.counts));

    if let Some(report) = &status.report {
        if !report.per_model.is_empty() {
            out.push_str("  Per model:\n");
            for (model, score) in &report.per_model {
                out.push_str(&format!("    {model}: {score:.3}\n"));
            }
        }
        if report.missing_judgments > 0 || report.failed_executions > 0 {
            out.push_str(&format!(
                "  Degraded:   {} missing judgment(s), {} failed execution(s)\n",
                report.missing_judgments, report.failed_executions
            ));
        }
    }
    if status.safety_blocked {
        out.push_str(&format!(
            "  Safety:     BLOCKED ({} finding(s))\n",
            status.safety_findings.len()
        ));
    }
    if let Some(next) = &status.next_iteration_id {
        out.push_str(&format!("  Next:       {next}\n"));
    }
    out
}

fn render_counts(counts: &BTreeMap<Stage, crate::pipeline::types::StageCounts>) -> String {
    let mut out = String::from("  Stages:\n");
    for (stage, c) in counts {
        if c.expected == 0 {
            continue;
        }
        let failed = if c.failed > 0 {
            format!(", {} failed", c.failed)
        } else {
            String::new()
        };
        out.push_str(&format!(
            "    {:<10} {}/{}{}\n",
            stage.as_str(),
            c.completed,
            c.expected,
            failed
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Decision, DecisionReason, IterationState, StageCounts};

    #[test]
    fn test_render_status() {
        let status = IterationStatus {
            iteration_id: "it-1".into(),
            experiment_id: "exp".into(),
            ordinal: 2,
            prompt_version: 2,
            state: IterationState::Stopped,
            counts: BTreeMap::from([
                (
                    Stage::Execute,
                    StageCounts {
                        expected: 6,
                        completed: 6,
                        failed: 1,
                    },
                ),
                (Stage::Refine, StageCounts::default()),
            ]),
            decision: Some(Decision::stop(DecisionReason::Cancelled)),
            reason: Some("cancelled".into()),
            score: None,
            report: None,
            safety_blocked: false,
            safety_findings: Vec::new(),
            next_iteration_id: None,
        };
        let text = render(&status);
        assert!(text.contains("State:      stopped"));
        assert!(text.contains("Decision:   stop(cancelled)"));
        assert!(text.contains("execute    6/6, 1 failed"));
        assert!(!text.contains("refine"));
        assert!(!text.contains("Score"));
    }
}
