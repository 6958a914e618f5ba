// src/store/memory.rs — In-process store for tests and `--storage memory`

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::PipelineStore;
use crate::infra::errors::PipelineError;
use crate::pipeline::types::{
    ExecutionResult, Experiment, GeneratedCase, Iteration, JudgeFailure, JudgeScore,
    PromptVersion,
};

#[derive(Default)]
pub struct MemoryStore {
    experiments: DashMap<String, Experiment>,
    versions: DashMap<String, PromptVersion>,
    iterations: DashMap<String, Iteration>,
    executions: DashMap<String, ExecutionResult>,
    scores: DashMap<String, JudgeScore>,
    failures: DashMap<String, JudgeFailure>,
    generated: DashMap<String, GeneratedCase>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn insert_new<T: Clone>(map: &DashMap<String, T>, id: &str, value: &T) -> bool {
    match map.entry(id.to_string()) {
        Entry::Occupied(_) => false,
        Entry::Vacant(slot) => {
            slot.insert(value.clone());
            true
        }
    }
}

fn collect<T: Clone>(
    map: &DashMap<String, T>,
    keep: impl Fn(&T) -> bool,
    sort_key: impl Fn(&T) -> String,
) -> Vec<T> {
    let mut out: Vec<T> = map
        .iter()
        .filter(|e| keep(e.value()))
        .map(|e| e.value().clone())
        .collect();
    out.sort_by_key(sort_key);
    out
}

impl PipelineStore for MemoryStore {
    fn put_experiment(&self, experiment: &Experiment) -> Result<bool, PipelineError> {
        Ok(insert_new(&self.experiments, &experiment.id, experiment))
    }

    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>, PipelineError> {
        Ok(self.experiments.get(id).map(|e| e.clone()))
    }

    fn list_experiments(&self) -> Result<Vec<Experiment>, PipelineError> {
        Ok(collect(&self.experiments, |_| true, |e| e.id.clone()))
    }

    fn set_current_version(&self, experiment_id: &str, version: u32) -> Result<(), PipelineError> {
        let mut exp = self
            .experiments
            .get_mut(experiment_id)
            .ok_or_else(|| PipelineError::not_found("experiment", experiment_id))?;
        exp.current_version = version;
        Ok(())
    }

    fn put_prompt_version(&self, version: &PromptVersion) -> Result<bool, PipelineError> {
        Ok(insert_new(&self.versions, &version.id, version))
    }

    fn get_prompt_version(&self, id: &str) -> Result<Option<PromptVersion>, PipelineError> {
        Ok(self.versions.get(id).map(|v| v.clone()))
    }

    fn save_iteration(&self, iteration: &Iteration) -> Result<(), PipelineError> {
        self.iterations
            .insert(iteration.id.clone(), iteration.clone());
        Ok(())
    }

    fn get_iteration(&self, id: &str) -> Result<Option<Iteration>, PipelineError> {
        Ok(self.iterations.get(id).map(|i| i.clone()))
    }

    fn list_iterations(&self, experiment_id: &str) -> Result<Vec<Iteration>, PipelineError> {
        let mut out = collect(
            &self.iterations,
            |i| i.experiment_id == experiment_id,
            |i| i.id.clone(),
        );
        out.sort_by_key(|i| i.ordinal);
        Ok(out)
    }

    fn put_execution(&self, result: &ExecutionResult) -> Result<bool, PipelineError> {
        Ok(insert_new(&self.executions, &result.id, result))
    }

    fn get_execution(&self, id: &str) -> Result<Option<ExecutionResult>, PipelineError> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    fn list_executions(&self, iteration_id: &str) -> Result<Vec<ExecutionResult>, PipelineError> {
        Ok(collect(
            &self.executions,
            |e| e.iteration_id == iteration_id,
            |e| e.id.clone(),
        ))
    }

    fn put_judge_score(&self, score: &JudgeScore) -> Result<bool, PipelineError> {
        Ok(insert_new(&self.scores, &score.id, score))
    }

    fn list_judge_scores(&self, iteration_id: &str) -> Result<Vec<JudgeScore>, PipelineError> {
        Ok(collect(
            &self.scores,
            |s| s.iteration_id == iteration_id,
            |s| s.id.clone(),
        ))
    }

    fn put_judge_failure(&self, failure: &JudgeFailure) -> Result<bool, PipelineError> {
        Ok(insert_new(&self.failures, &failure.id, failure))
    }

    fn list_judge_failures(&self, iteration_id: &str) -> Result<Vec<JudgeFailure>, PipelineError> {
        Ok(collect(
            &self.failures,
            |f| f.iteration_id == iteration_id,
            |f| f.id.clone(),
        ))
    }

    fn has_judgment(&self, id: &str) -> Result<bool, PipelineError> {
        Ok(self.scores.contains_key(id) || self.failures.contains_key(id))
    }

    fn put_generated_case(&self, case: &GeneratedCase) -> Result<bool, PipelineError> {
        Ok(insert_new(&self.generated, &case.id, case))
    }

    fn list_generated_cases(&self, experiment_id: &str) -> Result<Vec<GeneratedCase>, PipelineError> {
        Ok(collect(
            &self.generated,
            |c| c.experiment_id == experiment_id,
            |c| c.id.clone(),
        ))
    }
}
