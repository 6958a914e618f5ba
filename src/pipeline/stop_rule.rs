// src/pipeline/stop_rule.rs — Continue/stop decision for an aggregated iteration
//
// Precedence is fixed: iteration ceiling, then target, then plateau.

use super::types::{Decision, DecisionReason, StopRules};

/// Decide whether the experiment continues after the current iteration.
///
/// `history` holds the aggregate scores of earlier iterations, oldest first;
/// `current` is the score of the iteration being decided.
pub fn evaluate(history: &[f64], current: f64, rules: &StopRules) -> Decision {
    let completed = history.len() + 1;
    if completed >= rules.max_iterations as usize {
        return Decision::stop(DecisionReason::MaxIterations);
    }

    if current >= rules.target_score {
        return Decision::stop(DecisionReason::TargetReached);
    }

    if is_plateau(history, current, rules) {
        return Decision::stop(DecisionReason::Plateau);
    }

    Decision::proceed()
}

/// Improvement over the last `plateau_window` iterations is below
/// `plateau_delta`. Needs a full window of prior scores.
fn is_plateau(history: &[f64], current: f64, rules: &StopRules) -> bool {
    let window = rules.plateau_window;
    if window == 0 || history.len() < window {
        return false;
    }
    let baseline = history[history.len() - window];
    current - baseline < rules.plateau_delta
}
