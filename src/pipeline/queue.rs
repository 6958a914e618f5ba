// src/pipeline/queue.rs — Stage identifiers, typed job payloads, and the queue set

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::types::{JudgeConfig, ModelConfig};
use crate::infra::errors::PipelineError;

/// The six pipeline stages. Closed: a job for an unknown stage cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Execute,
    Judge,
    Aggregate,
    Refine,
    Generate,
    Safety,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Execute,
        Stage::Judge,
        Stage::Aggregate,
        Stage::Refine,
        Stage::Generate,
        Stage::Safety,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Execute => "execute",
            Stage::Judge => "judge",
            Stage::Aggregate => "aggregate",
            Stage::Refine => "refine",
            Stage::Generate => "generate",
            Stage::Safety => "safety",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub iteration_id: String,
    pub model: ModelConfig,
    pub case_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeJob {
    pub iteration_id: String,
    pub execution_id: String,
    pub judge: JudgeConfig,
}

/// Maintenance jobs carry the scope they operate on (e.g. "outputs").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedJob {
    pub iteration_id: String,
    pub scope: String,
}

/// One strongly-typed payload per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Job {
    Execute(ExecuteJob),
    Judge(JudgeJob),
    Aggregate { iteration_id: String },
    Refine { iteration_id: String },
    Generate(ScopedJob),
    Safety(ScopedJob),
}

impl Job {
    pub fn stage(&self) -> Stage {
        match self {
            Job::Execute(_) => Stage::Execute,
            Job::Judge(_) => Stage::Judge,
            Job::Aggregate { .. } => Stage::Aggregate,
            Job::Refine { .. } => Stage::Refine,
            Job::Generate(_) => Stage::Generate,
            Job::Safety(_) => Stage::Safety,
        }
    }

    pub fn iteration_id(&self) -> &str {
        match self {
            Job::Execute(j) => &j.iteration_id,
            Job::Judge(j) => &j.iteration_id,
            Job::Aggregate { iteration_id } | Job::Refine { iteration_id } => iteration_id,
            Job::Generate(j) | Job::Safety(j) => &j.iteration_id,
        }
    }

    /// Provider whose concurrency limit the job counts against, if any.
    /// Generate and refine resolve their model from the experiment, so they
    /// run under the stage-wide cap instead.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Job::Execute(j) => Some(&j.model.provider),
            Job::Judge(j) => Some(&j.judge.model.provider),
            _ => None,
        }
    }

    /// Human-readable unit key for logs.
    pub fn unit(&self) -> String {
        match self {
            Job::Execute(j) => format!("{}|{}", j.model.key(), j.case_id),
            Job::Judge(j) => format!("{}#{}", j.execution_id, j.judge.id),
            Job::Aggregate { .. } | Job::Refine { .. } => self.stage().to_string(),
            Job::Generate(j) | Job::Safety(j) => format!("{}:{}", self.stage(), j.scope),
        }
    }
}

struct StageQueue {
    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    enqueued: AtomicU64,
}

/// One independently drained queue per stage.
pub struct QueueSet {
    queues: HashMap<Stage, StageQueue>,
}

impl Default for QueueSet {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueSet {
    /// Build every stage queue from the closed stage list.
    pub fn new() -> Self {
        let queues = Stage::ALL
            .iter()
            .map(|&stage| {
                let (tx, rx) = mpsc::unbounded_channel();
                (
                    stage,
                    StageQueue {
                        tx,
                        rx: Mutex::new(Some(rx)),
                        enqueued: AtomicU64::new(0),
                    },
                )
            })
            .collect();
        Self { queues }
    }

    fn queue(&self, stage: Stage) -> &StageQueue {
        // Every stage is inserted by `new`.
        &self.queues[&stage]
    }

    /// Route a job to its stage's queue.
    pub fn push(&self, job: Job) -> Result<(), PipelineError> {
        let stage = job.stage();
        let q = self.queue(stage);
        q.tx.send(job).map_err(|_| {
            PipelineError::Store(format!("{stage} queue is closed; job dropped"))
        })?;
        q.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Hand the receiving end of a stage queue to a worker pool. Returns
    /// `None` once taken.
    pub fn take_receiver(&self, stage: Stage) -> Option<mpsc::UnboundedReceiver<Job>> {
        self.queue(stage)
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Pop one job without blocking. Only works while no pool owns the receiver.
    pub fn try_pop(&self, stage: Stage) -> Option<Job> {
        self.queue(stage)
            .rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .and_then(|rx| rx.try_recv().ok())
    }

    /// Drain everything currently queued for a stage.
    pub fn drain(&self, stage: Stage) -> Vec<Job> {
        std::iter::from_fn(|| self.try_pop(stage)).collect()
    }

    /// Total jobs ever pushed to a stage.
    pub fn enqueued(&self, stage: Stage) -> u64 {
        self.queue(stage).enqueued.load(Ordering::Relaxed)
    }
}
