// src/pipeline/runtime.rs — Worker pools, one per stage queue
//
// Provider-bound stages (execute, judge) share one semaphore per provider so
// a provider's limit holds across stages. Other stages run under a
// stage-wide cap.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::fan_in::UnitOutcome;
use super::orchestrator::PipelineEvent;
use super::queue::{Job, QueueSet, Stage};
use super::workers::{self, WorkerContext};
use crate::infra::config::ConcurrencyConfig;
use crate::infra::errors::PipelineError;

/// Per-provider and per-stage concurrency limits.
struct Limiter {
    config: ConcurrencyConfig,
    providers: DashMap<String, Arc<Semaphore>>,
    stages: DashMap<Stage, Arc<Semaphore>>,
}

impl Limiter {
    fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            providers: DashMap::new(),
            stages: DashMap::new(),
        }
    }

    fn semaphore_for(&self, job: &Job) -> Arc<Semaphore> {
        match job.provider() {
            Some(provider) => self
                .providers
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.limit_for(provider))))
                .clone(),
            None => self
                .stages
                .entry(job.stage())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.stage_workers.max(1))))
                .clone(),
        }
    }

    async fn acquire(&self, job: &Job) -> Option<OwnedSemaphorePermit> {
        self.semaphore_for(job).acquire_owned().await.ok()
    }
}

/// Running worker pools. Dropping without `shutdown` leaves the pools
/// running until the process exits.
pub struct PipelineRuntime {
    shutdown: watch::Sender<bool>,
    pools: Vec<JoinHandle<()>>,
}

impl PipelineRuntime {
    /// Take every stage receiver from `queues` and start draining them.
    pub fn start(
        ctx: WorkerContext,
        queues: &QueueSet,
        concurrency: ConcurrencyConfig,
    ) -> Result<Self, PipelineError> {
        let (shutdown, _) = watch::channel(false);
        let limiter = Arc::new(Limiter::new(concurrency));
        let mut pools = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let rx = queues.take_receiver(stage).ok_or_else(|| {
                PipelineError::Store(format!("{stage} queue already has a worker pool"))
            })?;
            pools.push(tokio::spawn(pool(
                stage,
                rx,
                ctx.clone(),
                limiter.clone(),
                shutdown.subscribe(),
            )));
        }
        info!(stages = pools.len(), "Worker pools started");
        Ok(Self { shutdown, pools })
    }

    /// Stop accepting jobs. In-flight jobs finish on their own tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.pools {
            let _ = handle.await;
        }
        info!("Worker pools stopped");
    }
}

async fn pool(
    stage: Stage,
    mut rx: mpsc::UnboundedReceiver<Job>,
    ctx: WorkerContext,
    limiter: Arc<Limiter>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%stage, "Pool running");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            job = rx.recv() => {
                let Some(job) = job else { break };
                let ctx = ctx.clone();
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    let Some(_permit) = limiter.acquire(&job).await else {
                        return;
                    };
                    run_job(&ctx, job).await;
                });
            }
        }
    }
    debug!(%stage, "Pool stopped");
}

/// Run one job and route any error the way a pool would. Exposed so callers
/// can drive queues by hand.
pub async fn run_job(ctx: &WorkerContext, job: Job) {
    let stage = job.stage();
    let iteration_id = job.iteration_id().to_string();
    let unit = job.unit();
    debug!(%iteration_id, %stage, %unit, "Job started");

    match workers::handle(ctx, job).await {
        Ok(()) => debug!(%iteration_id, %stage, %unit, "Job finished"),
        Err(e) => on_job_error(ctx, stage, &iteration_id, &unit, e),
    }
}

/// Errors that escape a worker are not retried: provider retries already
/// happened inside the adapter.
fn on_job_error(ctx: &WorkerContext, stage: Stage, iteration_id: &str, unit: &str, err: PipelineError) {
    match (&err, stage) {
        (PipelineError::AggregationIncomplete { .. }, _) => {
            error!(%iteration_id, %stage, %unit, "Pipeline defect: {}", err);
        }
        (_, Stage::Generate | Stage::Safety) => {
            warn!(%iteration_id, %stage, %unit, "Maintenance job failed: {}", err);
            if let Err(e) = ctx.orchestrator.record_maintenance(
                iteration_id,
                stage,
                UnitOutcome::Failed(err.to_string()),
            ) {
                error!(%iteration_id, %stage, "Could not record maintenance failure: {}", e);
            }
        }
        _ => {
            error!(%iteration_id, %stage, %unit, "Job failed, failing iteration: {}", err);
            let reason = format!("{stage} stage: {err}");
            if let Err(e) = ctx.orchestrator.fail_iteration(iteration_id, &reason) {
                error!(%iteration_id, "Could not mark iteration failed: {}", e);
            }
        }
    }
}

/// Block until the experiment's chain of iterations ends, returning the last
/// iteration id. Subscribe before starting the first iteration so no event
/// is missed.
pub async fn wait_for_experiment(
    mut events: tokio::sync::broadcast::Receiver<PipelineEvent>,
    experiment_id: &str,
) -> Result<String, PipelineError> {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        match events.recv().await {
            Ok(PipelineEvent::IterationFinished {
                experiment_id: exp,
                iteration_id,
                continues: false,
                ..
            }) if exp == experiment_id => return Ok(iteration_id),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "Progress receiver lagged"),
            Err(RecvError::Closed) => {
                return Err(PipelineError::Store("event channel closed".into()))
            }
        }
    }
}
