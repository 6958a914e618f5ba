// src/store/mod.rs — Persistence boundary for pipeline records
//
// The pipeline only reads and writes records by key. Result writes are
// insert-or-ignore so a redelivered job can never duplicate a record.

pub mod memory;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;

use crate::infra::config::{StorageBackend, StorageConfig};
use crate::infra::errors::PipelineError;
use crate::infra::paths;
use crate::pipeline::types::{
    ExecutionResult, Experiment, GeneratedCase, Iteration, JudgeFailure, JudgeScore,
    PromptVersion,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Read/write-by-key operations the pipeline depends on.
///
/// `put_*` methods return `true` when the record was newly written and
/// `false` when a record with the same id already existed (left untouched).
pub trait PipelineStore: Send + Sync {
    // -- Experiments --
    fn put_experiment(&self, experiment: &Experiment) -> Result<bool, PipelineError>;
    fn get_experiment(&self, id: &str) -> Result<Option<Experiment>, PipelineError>;
    fn list_experiments(&self) -> Result<Vec<Experiment>, PipelineError>;
    /// The one mutable field of an experiment.
    fn set_current_version(&self, experiment_id: &str, version: u32) -> Result<(), PipelineError>;

    // -- Prompt versions --
    fn put_prompt_version(&self, version: &PromptVersion) -> Result<bool, PipelineError>;
    fn get_prompt_version(&self, id: &str) -> Result<Option<PromptVersion>, PipelineError>;

    // -- Iterations (orchestrator-owned, upserted) --
    fn save_iteration(&self, iteration: &Iteration) -> Result<(), PipelineError>;
    fn get_iteration(&self, id: &str) -> Result<Option<Iteration>, PipelineError>;
    /// Ordered by ordinal.
    fn list_iterations(&self, experiment_id: &str) -> Result<Vec<Iteration>, PipelineError>;

    // -- Stage results --
    fn put_execution(&self, result: &ExecutionResult) -> Result<bool, PipelineError>;
    fn get_execution(&self, id: &str) -> Result<Option<ExecutionResult>, PipelineError>;
    fn list_executions(&self, iteration_id: &str) -> Result<Vec<ExecutionResult>, PipelineError>;

    fn put_judge_score(&self, score: &JudgeScore) -> Result<bool, PipelineError>;
    fn list_judge_scores(&self, iteration_id: &str) -> Result<Vec<JudgeScore>, PipelineError>;
    fn put_judge_failure(&self, failure: &JudgeFailure) -> Result<bool, PipelineError>;
    fn list_judge_failures(&self, iteration_id: &str) -> Result<Vec<JudgeFailure>, PipelineError>;
    /// Whether a score or a failure is already recorded under this unit id.
    fn has_judgment(&self, id: &str) -> Result<bool, PipelineError>;

    fn put_generated_case(&self, case: &GeneratedCase) -> Result<bool, PipelineError>;
    fn list_generated_cases(&self, experiment_id: &str) -> Result<Vec<GeneratedCase>, PipelineError>;

    // -- Lookups that must succeed --

    fn experiment(&self, id: &str) -> Result<Experiment, PipelineError> {
        self.get_experiment(id)?
            .ok_or_else(|| PipelineError::not_found("experiment", id))
    }

    fn prompt_version(&self, id: &str) -> Result<PromptVersion, PipelineError> {
        self.get_prompt_version(id)?
            .ok_or_else(|| PipelineError::not_found("prompt version", id))
    }

    fn iteration(&self, id: &str) -> Result<Iteration, PipelineError> {
        self.get_iteration(id)?
            .ok_or_else(|| PipelineError::not_found("iteration", id))
    }

    fn execution(&self, id: &str) -> Result<ExecutionResult, PipelineError> {
        self.get_execution(id)?
            .ok_or_else(|| PipelineError::not_found("execution", id))
    }
}

/// Open the store selected by `[storage]`.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn PipelineStore>, PipelineError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => {
            let path = config
                .path
                .as_ref()
                .map(std::path::PathBuf::from)
                .unwrap_or_else(paths::db_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::Store(format!("{}: {e}", parent.display())))?;
            }
            Ok(Arc::new(SqliteStore::open(&path)?))
        }
    }
}
