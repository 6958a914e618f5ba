// src/pipeline/orchestrator.rs — Iteration state machine and fan-in owner
//
// Workers never decide stage transitions. They report unit outcomes here, and
// a transition fires only when the stage's settled set equals its expected
// set. Every read-modify-write of an iteration happens under that
// iteration's lock, so exactly one caller observes fan-in.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::fan_in::{Recorded, StageFanIn, UnitOutcome};
use super::queue::{ExecuteJob, Job, JudgeJob, QueueSet, ScopedJob, Stage};
use super::types::*;
use crate::infra::config::PipelineConfig;
use crate::infra::errors::PipelineError;
use crate::store::PipelineStore;

/// Lifecycle notifications for progress rendering and waiters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    IterationStarted {
        experiment_id: String,
        iteration_id: String,
        ordinal: u32,
        prompt_version: u32,
        units: usize,
    },
    StageEntered {
        iteration_id: String,
        state: IterationState,
        units: usize,
    },
    UnitSettled {
        iteration_id: String,
        stage: Stage,
        settled: usize,
        expected: usize,
        failed: bool,
    },
    Decided {
        iteration_id: String,
        ordinal: u32,
        decision: Decision,
        score: f64,
    },
    SafetyBlocked {
        iteration_id: String,
        findings: usize,
    },
    /// The iteration reached a terminal state. `continues` is true when a
    /// follow-up iteration was started for the experiment.
    IterationFinished {
        experiment_id: String,
        iteration_id: String,
        state: IterationState,
        reason: Option<String>,
        continues: bool,
    },
}

/// Answer to `getIterationStatus`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationStatus {
    pub iteration_id: String,
    pub experiment_id: String,
    pub ordinal: u32,
    pub prompt_version: u32,
    pub state: IterationState,
    pub counts: BTreeMap<Stage, StageCounts>,
    pub decision: Option<Decision>,
    /// Decision reason, or the failure reason for `failed` iterations.
    pub reason: Option<String>,
    pub score: Option<f64>,
    pub report: Option<AggregateReport>,
    pub safety_blocked: bool,
    pub safety_findings: Vec<SafetyFinding>,
    pub next_iteration_id: Option<String>,
}

fn fan_in_counts(f: &StageFanIn) -> StageCounts {
    StageCounts {
        expected: f.expected_len(),
        completed: f.succeeded_len(),
        failed: f.failed().len(),
    }
}

impl From<&Iteration> for IterationStatus {
    fn from(it: &Iteration) -> Self {
        let mut counts = BTreeMap::new();
        counts.insert(Stage::Execute, fan_in_counts(&it.execute));
        counts.insert(Stage::Judge, fan_in_counts(&it.judge));
        for stage in [Stage::Aggregate, Stage::Refine, Stage::Generate, Stage::Safety] {
            counts.insert(stage, it.singles.get(&stage).copied().unwrap_or_default());
        }
        let reason = match (&it.failure_reason, &it.decision) {
            (Some(failure), _) => Some(failure.clone()),
            (None, Some(d)) => Some(d.reason.as_str().to_string()),
            (None, None) => None,
        };
        Self {
            iteration_id: it.id.clone(),
            experiment_id: it.experiment_id.clone(),
            ordinal: it.ordinal,
            prompt_version: it.prompt_version,
            state: it.state,
            counts,
            decision: it.decision,
            reason,
            score: it.score(),
            report: it.report.clone(),
            safety_blocked: it.safety_blocked,
            safety_findings: it.safety_findings.clone(),
            next_iteration_id: it.next_iteration_id.clone(),
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn PipelineStore>,
    queues: Arc<QueueSet>,
    config: PipelineConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn PipelineStore>, queues: Arc<QueueSet>, config: PipelineConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store,
            queues,
            config,
            locks: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget a terminal iteration's lock. `held` counts the clones the caller
    /// still owns; a lock another caller is waiting on stays in the map.
    fn release(&self, iteration_id: &str, held: usize) {
        self.locks
            .remove_if(iteration_id, |_, lock| Arc::strong_count(lock) <= held + 1);
    }

    fn save(&self, iteration: &mut Iteration) -> Result<(), PipelineError> {
        iteration.updated_at = Utc::now();
        self.store.save_iteration(iteration)
    }

    // ─── Experiments ────────────────────────────────────────────

    /// Store a new experiment with its seed prompt version.
    pub fn register_experiment(
        &self,
        experiment: &Experiment,
        seed: &PromptVersion,
    ) -> Result<(), PipelineError> {
        experiment.validate()?;
        if seed.experiment_id != experiment.id || seed.version != experiment.current_version {
            return Err(PipelineError::Validation(format!(
                "seed prompt must be version {} of experiment '{}'",
                experiment.current_version, experiment.id
            )));
        }
        if !self.store.put_experiment(experiment)? {
            return Err(PipelineError::Conflict(format!(
                "experiment '{}' already exists",
                experiment.id
            )));
        }
        self.store.put_prompt_version(seed)?;
        info!(experiment_id = %experiment.id, name = %experiment.name, "Experiment registered");
        Ok(())
    }

    // ─── Trigger API ────────────────────────────────────────────

    /// Create iteration N for a prompt version and dispatch its execute jobs.
    /// At most one iteration per experiment may be in flight.
    pub fn start_iteration(
        &self,
        experiment_id: &str,
        prompt_version_id: &str,
    ) -> Result<String, PipelineError> {
        let lock = self.lock_for(&format!("experiment:{experiment_id}"));
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let experiment = self.store.experiment(experiment_id)?;
        let version = self.store.prompt_version(prompt_version_id)?;
        if version.experiment_id != experiment.id {
            return Err(PipelineError::Validation(format!(
                "prompt version '{}' belongs to another experiment",
                version.id
            )));
        }

        let history = self.store.list_iterations(experiment_id)?;
        if let Some(active) = history.iter().find(|i| !i.state.is_terminal()) {
            return Err(PipelineError::Conflict(format!(
                "iteration '{}' of experiment '{}' is still {}",
                active.id, experiment_id, active.state
            )));
        }
        let ordinal = history.last().map(|i| i.ordinal + 1).unwrap_or(1);

        let mut iteration = Iteration::new(&experiment, &version, ordinal);
        let mut jobs = Vec::with_capacity(experiment.models.len() * experiment.dataset.len());
        let mut units = Vec::with_capacity(jobs.capacity());
        for model in &experiment.models {
            for case in &experiment.dataset {
                units.push(ExecKey::new(model.key(), &case.id).unit());
                jobs.push(Job::Execute(ExecuteJob {
                    iteration_id: iteration.id.clone(),
                    model: model.clone(),
                    case_id: case.id.clone(),
                }));
            }
        }
        iteration.execute = StageFanIn::new(units);
        self.save(&mut iteration)?;

        iteration.state = IterationState::Executing;
        self.save(&mut iteration)?;
        let units = jobs.len();
        for job in jobs {
            self.queues.push(job)?;
        }

        info!(
            experiment_id,
            iteration_id = %iteration.id,
            ordinal,
            prompt_version = version.version,
            units,
            "Iteration started"
        );
        self.emit(PipelineEvent::IterationStarted {
            experiment_id: experiment_id.to_string(),
            iteration_id: iteration.id.clone(),
            ordinal,
            prompt_version: version.version,
            units,
        });
        Ok(iteration.id)
    }

    pub fn iteration_status(&self, iteration_id: &str) -> Result<IterationStatus, PipelineError> {
        Ok(IterationStatus::from(&self.store.iteration(iteration_id)?))
    }

    // ─── Fan-in ─────────────────────────────────────────────────

    /// Record a terminal outcome for one execute unit.
    pub fn report_execution(
        &self,
        iteration_id: &str,
        key: &ExecKey,
        outcome: UnitOutcome,
    ) -> Result<(), PipelineError> {
        let lock = self.lock_for(iteration_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut it = self.store.iteration(iteration_id)?;
        if it.state != IterationState::Executing {
            debug!(iteration_id, state = %it.state, unit = %key.unit(), "Ignoring execute completion");
            if it.state.is_terminal() {
                self.release(iteration_id, 1);
            }
            return Ok(());
        }
        let failed = matches!(outcome, UnitOutcome::Failed(_));
        match it.execute.record(&key.unit(), outcome) {
            Recorded::New => {}
            Recorded::Duplicate => {
                debug!(iteration_id, unit = %key.unit(), "Duplicate execute completion");
                return Ok(());
            }
            Recorded::Unknown => {
                return Err(PipelineError::Validation(format!(
                    "execute unit '{}' is not part of iteration '{}'",
                    key.unit(),
                    iteration_id
                )))
            }
        }
        self.emit(PipelineEvent::UnitSettled {
            iteration_id: iteration_id.to_string(),
            stage: Stage::Execute,
            settled: it.execute.settled(),
            expected: it.execute.expected_len(),
            failed,
        });

        if !it.execute.is_complete() {
            return self.save(&mut it);
        }

        let experiment = self.store.experiment(&it.experiment_id)?;

        // A dataset case with no successful execution leaves nothing to judge it by.
        if let Some(case) = experiment.dataset.iter().find(|case| {
            experiment
                .models
                .iter()
                .all(|m| !it.execute.has_succeeded(&ExecKey::new(m.key(), &case.id).unit()))
        }) {
            let reason = format!("every execution for dataset case '{}' failed", case.id);
            return self.finish(&mut it, IterationState::Failed, Some(reason));
        }

        let mut units = Vec::new();
        let mut jobs = Vec::new();
        for model in &experiment.models {
            for case in &experiment.dataset {
                let key = ExecKey::new(model.key(), &case.id);
                if !it.execute.has_succeeded(&key.unit()) {
                    continue;
                }
                let execution_id = key.execution_id(&it.id);
                for judge in &experiment.judges {
                    units.push(ScoreKey::new(&execution_id, &judge.id).unit());
                    jobs.push(Job::Judge(JudgeJob {
                        iteration_id: it.id.clone(),
                        execution_id: execution_id.clone(),
                        judge: judge.clone(),
                    }));
                }
            }
        }

        it.judge = StageFanIn::new(units);
        it.state = IterationState::Judging;
        self.save(&mut it)?;
        let count = jobs.len();
        for job in jobs {
            self.queues.push(job)?;
        }
        info!(
            iteration_id,
            judge_jobs = count,
            failed_executions = it.execute.failed().len(),
            "Execute fan-in complete"
        );
        self.emit(PipelineEvent::StageEntered {
            iteration_id: iteration_id.to_string(),
            state: IterationState::Judging,
            units: count,
        });
        Ok(())
    }

    /// Record a terminal outcome (score or `JudgeFailure`) for one judge unit.
    pub fn report_judgment(
        &self,
        iteration_id: &str,
        key: &ScoreKey,
        outcome: UnitOutcome,
    ) -> Result<(), PipelineError> {
        let lock = self.lock_for(iteration_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut it = self.store.iteration(iteration_id)?;
        if it.state != IterationState::Judging {
            debug!(iteration_id, state = %it.state, unit = %key.unit(), "Ignoring judge completion");
            if it.state.is_terminal() {
                self.release(iteration_id, 1);
            }
            return Ok(());
        }
        let failed = matches!(outcome, UnitOutcome::Failed(_));
        match it.judge.record(&key.unit(), outcome) {
            Recorded::New => {}
            Recorded::Duplicate => {
                debug!(iteration_id, unit = %key.unit(), "Duplicate judge completion");
                return Ok(());
            }
            Recorded::Unknown => {
                return Err(PipelineError::Validation(format!(
                    "judge unit '{}' is not part of iteration '{}'",
                    key.unit(),
                    iteration_id
                )))
            }
        }
        self.emit(PipelineEvent::UnitSettled {
            iteration_id: iteration_id.to_string(),
            stage: Stage::Judge,
            settled: it.judge.settled(),
            expected: it.judge.expected_len(),
            failed,
        });

        if !it.judge.is_complete() {
            return self.save(&mut it);
        }

        it.state = IterationState::Aggregating;
        it.singles.insert(
            Stage::Aggregate,
            StageCounts {
                expected: 1,
                ..Default::default()
            },
        );
        self.save(&mut it)?;
        self.queues.push(Job::Aggregate {
            iteration_id: it.id.clone(),
        })?;
        info!(
            iteration_id,
            judge_failures = it.judge.failed().len(),
            "Judge fan-in complete"
        );
        self.emit(PipelineEvent::StageEntered {
            iteration_id: iteration_id.to_string(),
            state: IterationState::Aggregating,
            units: 1,
        });
        Ok(())
    }

    /// Write the aggregate decision. Stops finalize the iteration; a continue
    /// enqueues exactly one refine job.
    pub fn record_decision(
        &self,
        iteration_id: &str,
        decision: Decision,
        report: AggregateReport,
    ) -> Result<(), PipelineError> {
        let lock = self.lock_for(iteration_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut it = self.store.iteration(iteration_id)?;
        if it.decision.is_some() || it.state.is_terminal() {
            debug!(iteration_id, state = %it.state, "Decision already recorded");
            if it.state.is_terminal() {
                self.release(iteration_id, 1);
            }
            return Ok(());
        }
        if let Err(e) = it.check_aggregation_ready() {
            error!(iteration_id, state = %it.state, "Aggregation before fan-in: {}", e);
            return Err(e);
        }

        let score = report.mean_score;
        it.report = Some(report);
        it.decision = Some(decision);
        bump(&mut it.singles, Stage::Aggregate, UnitOutcome::Succeeded);

        let mut jobs = Vec::new();
        if decision.is_stop() {
            it.state = if decision.reason == DecisionReason::TargetReached {
                IterationState::Completed
            } else {
                IterationState::Stopped
            };
        } else {
            it.state = IterationState::Refining;
            expect(&mut it.singles, Stage::Refine);
            jobs.push(Job::Refine {
                iteration_id: it.id.clone(),
            });
            if self.config.enable_generate {
                expect(&mut it.singles, Stage::Generate);
                jobs.push(Job::Generate(ScopedJob {
                    iteration_id: it.id.clone(),
                    scope: "dataset".into(),
                }));
            }
        }
        if self.config.enable_safety {
            expect(&mut it.singles, Stage::Safety);
            jobs.push(Job::Safety(ScopedJob {
                iteration_id: it.id.clone(),
                scope: "outputs".into(),
            }));
        }

        self.save(&mut it)?;
        for job in jobs {
            self.queues.push(job)?;
        }

        info!(iteration_id, %decision, score, state = %it.state, "Iteration decided");
        self.emit(PipelineEvent::Decided {
            iteration_id: iteration_id.to_string(),
            ordinal: it.ordinal,
            decision,
            score,
        });
        if it.state.is_terminal() {
            self.emit(PipelineEvent::IterationFinished {
                experiment_id: it.experiment_id.clone(),
                iteration_id: it.id.clone(),
                state: it.state,
                reason: Some(decision.reason.as_str().to_string()),
                continues: false,
            });
            self.release(iteration_id, 1);
        }
        Ok(())
    }

    /// Store the refined prompt as the next version, close this iteration, and
    /// start the follow-up iteration when `auto_continue` is set.
    pub fn complete_refine(
        &self,
        iteration_id: &str,
        text: String,
        system: Option<String>,
    ) -> Result<Option<String>, PipelineError> {
        let (experiment_id, version_id) = {
            let lock = self.lock_for(iteration_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

            let mut it = self.store.iteration(iteration_id)?;
            if it.state != IterationState::Refining {
                debug!(iteration_id, state = %it.state, "Ignoring refine completion");
                if it.state.is_terminal() {
                    self.release(iteration_id, 1);
                }
                return Ok(it.next_iteration_id);
            }

            let experiment = self.store.experiment(&it.experiment_id)?;
            let current = self.store.prompt_version(&it.prompt_version_id)?;
            let version = self.next_version(&experiment, &current, &it, text, system)?;
            self.store.set_current_version(&experiment.id, version.version)?;

            it.state = IterationState::Completed;
            bump(&mut it.singles, Stage::Refine, UnitOutcome::Succeeded);
            self.save(&mut it)?;
            info!(iteration_id, version = version.version, "Prompt refined");
            (experiment.id, version.id)
        };

        // The experiment lock is taken inside start_iteration, never while an
        // iteration lock is held.
        let next = if self.config.auto_continue {
            Some(self.start_iteration(&experiment_id, &version_id))
        } else {
            None
        };

        let started = match &next {
            Some(Ok(id)) => {
                let lock = self.lock_for(iteration_id);
                let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
                let mut it = self.store.iteration(iteration_id)?;
                it.next_iteration_id = Some(id.clone());
                self.save(&mut it)?;
                true
            }
            Some(Err(e)) => {
                error!(iteration_id, "Could not start follow-up iteration: {}", e);
                false
            }
            None => false,
        };
        self.emit(PipelineEvent::IterationFinished {
            experiment_id,
            iteration_id: iteration_id.to_string(),
            state: IterationState::Completed,
            reason: Some(DecisionReason::BelowTarget.as_str().to_string()),
            continues: started,
        });
        self.release(iteration_id, 0);
        next.transpose()
    }

    /// The version this iteration's refinement creates. A redelivered refine
    /// finds the version it already wrote.
    fn next_version(
        &self,
        experiment: &Experiment,
        current: &PromptVersion,
        it: &Iteration,
        text: String,
        system: Option<String>,
    ) -> Result<PromptVersion, PipelineError> {
        let mut number = current.version + 1;
        loop {
            match self
                .store
                .get_prompt_version(&PromptVersion::id_for(&experiment.id, number))?
            {
                Some(existing) if existing.source_iteration.as_deref() == Some(it.id.as_str()) => {
                    return Ok(existing)
                }
                Some(_) => number += 1,
                None => break,
            }
        }

        let mut version = PromptVersion::new(&experiment.id, number, text);
        version.system = system
            .filter(|s| !s.trim().is_empty())
            .or_else(|| current.system.clone());
        version.examples = current.examples.clone();
        version.source_iteration = Some(it.id.clone());
        self.store.put_prompt_version(&version)?;
        Ok(version)
    }

    /// Move an in-flight iteration to `failed`. Recorded results stay queryable.
    pub fn fail_iteration(&self, iteration_id: &str, reason: &str) -> Result<(), PipelineError> {
        let lock = self.lock_for(iteration_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut it = self.store.iteration(iteration_id)?;
        if it.state.is_terminal() {
            self.release(iteration_id, 1);
            return Ok(());
        }
        if it.state == IterationState::Refining {
            bump(
                &mut it.singles,
                Stage::Refine,
                UnitOutcome::Failed(reason.to_string()),
            );
        }
        self.finish(&mut it, IterationState::Failed, Some(reason.to_string()))
    }

    fn finish(
        &self,
        it: &mut Iteration,
        state: IterationState,
        failure: Option<String>,
    ) -> Result<(), PipelineError> {
        it.state = state;
        it.failure_reason = failure.clone();
        self.save(it)?;
        warn!(iteration_id = %it.id, state = %state, reason = ?failure, "Iteration ended early");
        self.emit(PipelineEvent::IterationFinished {
            experiment_id: it.experiment_id.clone(),
            iteration_id: it.id.clone(),
            state,
            reason: failure,
            continues: false,
        });
        // callers hold the iteration lock
        self.release(&it.id, 1);
        Ok(())
    }

    // ─── Cancellation ───────────────────────────────────────────

    /// Stop an iteration. No further jobs are enqueued for it; in-flight
    /// provider calls may finish and record results, which are then ignored.
    pub fn cancel_iteration(&self, iteration_id: &str) -> Result<IterationState, PipelineError> {
        let lock = self.lock_for(iteration_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut it = self.store.iteration(iteration_id)?;
        if it.state.is_terminal() {
            self.release(iteration_id, 1);
            return Ok(it.state);
        }
        it.cancel_requested = true;
        it.state = IterationState::Stopped;
        it.decision = Some(Decision::stop(DecisionReason::Cancelled));
        self.save(&mut it)?;
        info!(iteration_id, "Iteration cancelled");
        self.emit(PipelineEvent::IterationFinished {
            experiment_id: it.experiment_id.clone(),
            iteration_id: it.id.clone(),
            state: it.state,
            reason: Some(DecisionReason::Cancelled.as_str().to_string()),
            continues: false,
        });
        self.release(iteration_id, 1);
        Ok(it.state)
    }

    /// Cancel whichever iteration of the experiment is in flight.
    pub fn cancel_experiment(&self, experiment_id: &str) -> Result<Option<String>, PipelineError> {
        self.store.experiment(experiment_id)?;
        let active = self
            .store
            .list_iterations(experiment_id)?
            .into_iter()
            .find(|i| !i.state.is_terminal());
        match active {
            Some(it) => {
                self.cancel_iteration(&it.id)?;
                Ok(Some(it.id))
            }
            None => Ok(None),
        }
    }

    // ─── Maintenance stages ─────────────────────────────────────

    /// Safety results never gate the decision; a blocking finding is surfaced
    /// on the iteration in any state.
    pub fn record_safety(
        &self,
        iteration_id: &str,
        findings: Vec<SafetyFinding>,
        blocked: bool,
    ) -> Result<(), PipelineError> {
        let lock = self.lock_for(iteration_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut it = self.store.iteration(iteration_id)?;
        if it.singles.get(&Stage::Safety).is_some_and(|c| c.completed > 0) {
            if it.state.is_terminal() {
                self.release(iteration_id, 1);
            }
            return Ok(());
        }
        let count = findings.len();
        it.safety_findings = findings;
        it.safety_blocked |= blocked;
        bump(&mut it.singles, Stage::Safety, UnitOutcome::Succeeded);
        self.save(&mut it)?;
        if blocked {
            warn!(iteration_id, findings = count, "Safety scan blocked iteration");
            self.emit(PipelineEvent::SafetyBlocked {
                iteration_id: iteration_id.to_string(),
                findings: count,
            });
        }
        if it.state.is_terminal() {
            self.release(iteration_id, 1);
        }
        Ok(())
    }

    /// Completion of a generate (or failed safety) job.
    pub fn record_maintenance(
        &self,
        iteration_id: &str,
        stage: Stage,
        outcome: UnitOutcome,
    ) -> Result<(), PipelineError> {
        let lock = self.lock_for(iteration_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut it = self.store.iteration(iteration_id)?;
        let counts = it.singles.get(&stage).copied().unwrap_or_default();
        if counts.completed + counts.failed < counts.expected.max(1) {
            if let UnitOutcome::Failed(reason) = &outcome {
                warn!(iteration_id, %stage, "Maintenance job failed: {}", reason);
            }
            bump(&mut it.singles, stage, outcome);
            self.save(&mut it)?;
        }
        if it.state.is_terminal() {
            self.release(iteration_id, 1);
        }
        Ok(())
    }
}

fn expect(singles: &mut BTreeMap<Stage, StageCounts>, stage: Stage) {
    singles.entry(stage).or_default().expected = 1;
}

fn bump(singles: &mut BTreeMap<Stage, StageCounts>, stage: Stage, outcome: UnitOutcome) {
    let c = singles.entry(stage).or_default();
    c.expected = c.expected.max(1);
    match outcome {
        UnitOutcome::Succeeded => c.completed += 1,
        UnitOutcome::Failed(_) => c.failed += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn experiment(models: usize, cases: usize) -> Experiment {
        Experiment {
            id: "exp-1".into(),
            project_id: "proj".into(),
            name: "t".into(),
            objective: "o".into(),
            rubric: Rubric {
                criteria: vec![Criterion {
                    name: "quality".into(),
                    description: "good".into(),
                    weight: 1.0,
                }],
            },
            models: (0..models)
                .map(|i| ModelConfig::new("mock", format!("m{i}")))
                .collect(),
            judges: vec![JudgeConfig {
                id: "j".into(),
                model: ModelConfig::new("mock", "judge"),
                mode: JudgeMode::Pointwise,
                system_prompt: None,
            }],
            refiner: ModelConfig::new("mock", "refiner"),
            generator: None,
            dataset: (0..cases)
                .map(|i| DatasetCase {
                    id: format!("c{i}"),
                    input: format!("input {i}"),
                    expected: None,
                })
                .collect(),
            stop_rules: StopRules::default(),
            current_version: 1,
            created_at: Utc::now(),
        }
    }

    fn setup(models: usize, cases: usize) -> (Orchestrator, Arc<QueueSet>, String) {
        let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());
        let queues = Arc::new(QueueSet::new());
        let orch = Orchestrator::new(store, queues.clone(), PipelineConfig::default());
        let exp = experiment(models, cases);
        let seed = PromptVersion::new(&exp.id, 1, "Answer: {{ input }}");
        orch.register_experiment(&exp, &seed).unwrap();
        (orch, queues, seed.id)
    }

    fn exec_key(job: &Job) -> ExecKey {
        match job {
            Job::Execute(j) => ExecKey::new(j.model.key(), &j.case_id),
            other => panic!("expected execute job, got {other:?}"),
        }
    }

    #[test]
    fn test_start_enqueues_one_job_per_model_case() {
        let (orch, queues, seed) = setup(2, 3);
        let id = orch.start_iteration("exp-1", &seed).unwrap();
        assert_eq!(queues.enqueued(Stage::Execute), 6);
        let status = orch.iteration_status(&id).unwrap();
        assert_eq!(status.state, IterationState::Executing);
        assert_eq!(status.counts[&Stage::Execute].expected, 6);
        assert_eq!(status.ordinal, 1);
    }

    #[test]
    fn test_double_dispatch_rejected() {
        let (orch, _queues, seed) = setup(1, 1);
        orch.start_iteration("exp-1", &seed).unwrap();
        let err = orch.start_iteration("exp-1", &seed).unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)));
    }

    #[test]
    fn test_judging_starts_only_at_full_fan_in() {
        let (orch, queues, seed) = setup(1, 3);
        let id = orch.start_iteration("exp-1", &seed).unwrap();
        let jobs = queues.drain(Stage::Execute);

        orch.report_execution(&id, &exec_key(&jobs[0]), UnitOutcome::Succeeded)
            .unwrap();
        orch.report_execution(&id, &exec_key(&jobs[1]), UnitOutcome::Failed("503".into()))
            .unwrap();
        assert_eq!(queues.enqueued(Stage::Judge), 0);

        // redelivery does not advance the counter
        orch.report_execution(&id, &exec_key(&jobs[0]), UnitOutcome::Succeeded)
            .unwrap();
        assert_eq!(orch.iteration_status(&id).unwrap().counts[&Stage::Execute].completed, 1);

        orch.report_execution(&id, &exec_key(&jobs[2]), UnitOutcome::Succeeded)
            .unwrap();
        // the failed case has no other model, so the iteration fails
        let status = orch.iteration_status(&id).unwrap();
        assert_eq!(status.state, IterationState::Failed);
        assert!(status.reason.unwrap().contains("c1"));
        assert_eq!(queues.enqueued(Stage::Judge), 0);
    }

    #[test]
    fn test_partial_model_failure_still_judges_survivors() {
        let (orch, queues, seed) = setup(2, 1);
        let id = orch.start_iteration("exp-1", &seed).unwrap();
        let jobs = queues.drain(Stage::Execute);
        orch.report_execution(&id, &exec_key(&jobs[0]), UnitOutcome::Failed("500".into()))
            .unwrap();
        orch.report_execution(&id, &exec_key(&jobs[1]), UnitOutcome::Succeeded)
            .unwrap();
        assert_eq!(queues.enqueued(Stage::Judge), 1);
        assert_eq!(
            orch.iteration_status(&id).unwrap().state,
            IterationState::Judging
        );
    }

    #[test]
    fn test_unknown_unit_rejected() {
        let (orch, _queues, seed) = setup(1, 1);
        let id = orch.start_iteration("exp-1", &seed).unwrap();
        let err = orch
            .report_execution(&id, &ExecKey::new("mock/zz", "c0"), UnitOutcome::Succeeded)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_decision_before_fan_in_is_defect() {
        let (orch, _queues, seed) = setup(1, 1);
        let id = orch.start_iteration("exp-1", &seed).unwrap();
        let err = orch
            .record_decision(&id, Decision::proceed(), AggregateReport::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::AggregationIncomplete { .. }));
    }

    #[test]
    fn test_cancel_is_terminal_and_idempotent() {
        let (orch, queues, seed) = setup(1, 2);
        let id = orch.start_iteration("exp-1", &seed).unwrap();
        assert_eq!(orch.cancel_experiment("exp-1").unwrap(), Some(id.clone()));
        assert_eq!(orch.cancel_iteration(&id).unwrap(), IterationState::Stopped);

        for job in queues.drain(Stage::Execute) {
            orch.report_execution(&id, &exec_key(&job), UnitOutcome::Succeeded)
                .unwrap();
        }
        let status = orch.iteration_status(&id).unwrap();
        assert_eq!(status.state, IterationState::Stopped);
        assert_eq!(status.reason.as_deref(), Some("cancelled"));
        assert_eq!(queues.enqueued(Stage::Judge), 0);
        assert_eq!(orch.cancel_experiment("exp-1").unwrap(), None);
    }

    /// Drive a 1×1 iteration to `aggregating`.
    fn judged(orch: &Orchestrator, queues: &QueueSet, seed: &str) -> String {
        let id = orch.start_iteration("exp-1", seed).unwrap();
        for job in queues.drain(Stage::Execute) {
            orch.report_execution(&id, &exec_key(&job), UnitOutcome::Succeeded)
                .unwrap();
        }
        for job in queues.drain(Stage::Judge) {
            let Job::Judge(j) = job else {
                panic!("expected judge job");
            };
            orch.report_judgment(&id, &ScoreKey::new(&j.execution_id, &j.judge.id), UnitOutcome::Succeeded)
                .unwrap();
        }
        assert_eq!(orch.iteration_status(&id).unwrap().state, IterationState::Aggregating);
        id
    }

    #[test]
    fn test_terminal_iterations_release_their_locks() {
        let (orch, queues, seed) = setup(1, 1);

        // cancel, then a late completion for the stopped iteration
        let cancelled = orch.start_iteration("exp-1", &seed).unwrap();
        orch.cancel_iteration(&cancelled).unwrap();
        assert!(!orch.locks.contains_key(&cancelled));
        for job in queues.drain(Stage::Execute) {
            orch.report_execution(&cancelled, &exec_key(&job), UnitOutcome::Succeeded)
                .unwrap();
        }
        assert!(!orch.locks.contains_key(&cancelled));

        // failure
        let failed = orch.start_iteration("exp-1", &seed).unwrap();
        let job = queues.drain(Stage::Execute).remove(0);
        orch.report_execution(&failed, &exec_key(&job), UnitOutcome::Failed("500".into()))
            .unwrap();
        assert_eq!(orch.iteration_status(&failed).unwrap().state, IterationState::Failed);
        assert!(!orch.locks.contains_key(&failed));

        // stop decision
        let stopped = judged(&orch, &queues, &seed);
        orch.record_decision(
            &stopped,
            Decision::stop(DecisionReason::TargetReached),
            AggregateReport::default(),
        )
        .unwrap();
        assert!(!orch.locks.contains_key(&stopped));
        // the pending safety job settles without leaving an entry behind
        orch.record_safety(&stopped, Vec::new(), false).unwrap();
        assert!(!orch.locks.contains_key(&stopped));

        // refine, which also starts the follow-up iteration
        let refined = judged(&orch, &queues, &seed);
        orch.record_decision(&refined, Decision::proceed(), AggregateReport::default())
            .unwrap();
        assert!(orch.locks.contains_key(&refined));
        let next = orch
            .complete_refine(&refined, "Answer well: {{ input }}".into(), None)
            .unwrap();
        assert!(next.is_some());
        assert!(!orch.locks.contains_key(&refined));

        // only the experiment dispatch lock remains
        assert_eq!(orch.locks.len(), 1);
    }

    #[test]
    fn test_register_rejects_mismatched_seed() {
        let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());
        let orch = Orchestrator::new(store, Arc::new(QueueSet::new()), PipelineConfig::default());
        let exp = experiment(1, 1);
        let seed = PromptVersion::new(&exp.id, 2, "x");
        assert!(matches!(
            orch.register_experiment(&exp, &seed),
            Err(PipelineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let (orch, _queues, seed) = setup(1, 1);
        let mut rx = orch.subscribe();
        let id = orch.start_iteration("exp-1", &seed).unwrap();
        match rx.recv().await.unwrap() {
            PipelineEvent::IterationStarted {
                iteration_id,
                units,
                ..
            } => {
                assert_eq!(iteration_id, id);
                assert_eq!(units, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
