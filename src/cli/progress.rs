// src/cli/progress.rs — Terminal progress renderer for pipeline events

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::pipeline::types::IterationState;
use crate::pipeline::PipelineEvent;

fn short(id: &str) -> &str {
    crate::util::truncate_str(id, 8)
}

/// One line per event worth showing; unit-level chatter only at stage ends.
pub fn render(event: &PipelineEvent) -> Option<String> {
    match event {
        PipelineEvent::IterationStarted {
            iteration_id,
            ordinal,
            prompt_version,
            units,
            ..
        } => Some(format!(
            "[iter {}] {} prompt v{} | executing {} unit(s)",
            ordinal,
            short(iteration_id),
            prompt_version,
            units,
        )),
        PipelineEvent::StageEntered {
            iteration_id,
            state,
            units,
        } => Some(format!("[{}] {} ({} job(s))", short(iteration_id), state, units)),
        PipelineEvent::UnitSettled {
            iteration_id,
            stage,
            settled,
            expected,
            failed: true,
        } => Some(format!(
            "[{}]   {} unit failed ({}/{})",
            short(iteration_id),
            stage,
            settled,
            expected,
        )),
        PipelineEvent::UnitSettled { .. } => None,
        PipelineEvent::Decided {
            ordinal,
            decision,
            score,
            ..
        } => Some(format!(
            "[iter {}] score={:.2} -> {}",
            ordinal, score, decision,
        )),
        PipelineEvent::SafetyBlocked {
            iteration_id,
            findings,
        } => Some(format!(
            "[safety] {} blocked: {} finding(s)",
            short(iteration_id),
            findings,
        )),
        PipelineEvent::IterationFinished {
            iteration_id,
            state,
            reason,
            continues,
            ..
        } => {
            let reason = reason.as_deref().unwrap_or("-");
            let tail = match (state, continues) {
                (IterationState::Completed, true) => " | refined, next iteration started",
                (IterationState::Completed, false) => "",
                _ => "",
            };
            Some(format!(
                "[{}] {} ({}){}",
                short(iteration_id),
                state,
                reason,
                tail,
            ))
        }
    }
}

/// Build a progress callback that writes formatted output to stderr.
///
/// All progress output goes to stderr so stdout stays clean for the final prompt.
pub fn terminal_progress() -> impl Fn(&PipelineEvent) + Send + 'static {
    move |event| {
        if let Some(line) = render(event) {
            eprintln!("{line}");
        }
    }
}

/// Feed events to `sink` until the channel closes.
pub fn spawn_printer(
    mut events: broadcast::Receiver<PipelineEvent>,
    sink: impl Fn(&PipelineEvent) + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => sink(&event),
                Err(RecvError::Lagged(n)) => eprintln!("[progress] {n} event(s) skipped"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::Stage;
    use crate::pipeline::types::{Decision, DecisionReason};
    use std::sync::{Arc, Mutex};

    /// Helper that captures progress output into a Vec instead of stderr.
    fn capturing_progress() -> (
        impl Fn(&PipelineEvent) + Send + 'static,
        Arc<Mutex<Vec<String>>>,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let cb = move |event: &PipelineEvent| {
            if let Some(line) = render(event) {
                log_clone.lock().unwrap().push(line);
            }
        };
        (cb, log)
    }

    #[test]
    fn test_iteration_started_format() {
        let (cb, log) = capturing_progress();
        cb(&PipelineEvent::IterationStarted {
            experiment_id: "exp".into(),
            iteration_id: "0123456789abcdef".into(),
            ordinal: 2,
            prompt_version: 3,
            units: 6,
        });
        assert_eq!(
            log.lock().unwrap()[0],
            "[iter 2] 01234567 prompt v3 | executing 6 unit(s)"
        );
    }

    #[test]
    fn test_decided_format() {
        let (cb, log) = capturing_progress();
        cb(&PipelineEvent::Decided {
            iteration_id: "it".into(),
            ordinal: 1,
            decision: Decision::stop(DecisionReason::TargetReached),
            score: 0.934,
        });
        assert_eq!(log.lock().unwrap()[0], "[iter 1] score=0.93 -> stop(target_reached)");
    }

    #[test]
    fn test_successful_units_are_quiet() {
        let (cb, log) = capturing_progress();
        for failed in [false, true] {
            cb(&PipelineEvent::UnitSettled {
                iteration_id: "it".into(),
                stage: Stage::Judge,
                settled: 3,
                expected: 6,
                failed,
            });
        }
        let msgs = log.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0], "[it]   judge unit failed (3/6)");
    }

    #[test]
    fn test_finished_format() {
        let (cb, log) = capturing_progress();
        cb(&PipelineEvent::IterationFinished {
            experiment_id: "exp".into(),
            iteration_id: "it".into(),
            state: IterationState::Completed,
            reason: Some("below_target".into()),
            continues: true,
        });
        cb(&PipelineEvent::IterationFinished {
            experiment_id: "exp".into(),
            iteration_id: "it".into(),
            state: IterationState::Stopped,
            reason: Some("cancelled".into()),
            continues: false,
        });
        let msgs = log.lock().unwrap();
        assert_eq!(msgs[0], "[it] completed (below_target) | refined, next iteration started");
        assert_eq!(msgs[1], "[it] stopped (cancelled)");
    }
}
