// src/cli/run.rs — `promptloop run`: drive one experiment to a stop decision

use std::path::Path;
use std::sync::Arc;

use crate::cache::ResponseCache;
use crate::cli::experiment::{validate_models, ExperimentFile};
use crate::cli::progress;
use crate::infra::config::Config;
use crate::infra::errors::PipelineError;
use crate::pipeline::runtime::wait_for_experiment;
use crate::pipeline::types::{Experiment, Iteration, PromptVersion};
use crate::pipeline::Pipeline;
use crate::provider::resolver::ProviderRegistry;
use crate::store;

/// Register (or resume) the experiment, start its next iteration and block
/// until an iteration ends without a successor. The final prompt goes to stdout.
pub async fn run_experiment(config: Config, path: &Path, quiet: bool) -> anyhow::Result<()> {
    let file = ExperimentFile::load(path)?;
    let (experiment, seed) = file.into_parts();

    let store = store::open(&config.storage)?;
    let cache = Arc::new(ResponseCache::new());
    let providers = ProviderRegistry::from_config(&config, cache)?;
    validate_models(&experiment, &providers)?;
    let pipeline = Pipeline::new(config, store, providers)?;

    let experiment = register_or_resume(&pipeline, experiment, &seed)?;
    let events = pipeline.orchestrator.subscribe();
    let printer = (!quiet).then(|| {
        progress::spawn_printer(
            pipeline.orchestrator.subscribe(),
            progress::terminal_progress(),
        )
    });
    let runtime = pipeline.start_workers()?;

    let version_id = PromptVersion::id_for(&experiment.id, experiment.current_version);
    pipeline
        .orchestrator
        .start_iteration(&experiment.id, &version_id)?;

    let wait = wait_for_experiment(events, &experiment.id);
    tokio::pin!(wait);
    tokio::select! {
        r = &mut wait => { r?; }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling...");
            if pipeline.orchestrator.cancel_experiment(&experiment.id)?.is_some() {
                (&mut wait).await?;
            }
        }
    }

    runtime.shutdown().await;
    if let Some(printer) = printer {
        printer.abort();
    }

    let iterations = pipeline.store.list_iterations(&experiment.id)?;
    if !quiet {
        eprintln!();
        eprint!("{}", summary(&iterations));
        eprint!("{}", pipeline.costs.report());
    }

    let experiment = pipeline.store.experiment(&experiment.id)?;
    let current = pipeline.store.prompt_version(&PromptVersion::id_for(
        &experiment.id,
        experiment.current_version,
    ))?;
    if let Some(system) = &current.system {
        println!("[system]\n{system}\n");
    }
    println!("{}", current.text);
    Ok(())
}

/// First run registers the experiment. Later runs reuse the stored record and
/// fail any iteration a previous process left in flight, since its queued jobs
/// did not survive the restart.
fn register_or_resume(
    pipeline: &Pipeline,
    experiment: Experiment,
    seed: &PromptVersion,
) -> Result<Experiment, PipelineError> {
    let Some(stored) = pipeline.store.get_experiment(&experiment.id)? else {
        pipeline
            .orchestrator
            .register_experiment(&experiment, seed)?;
        return Ok(experiment);
    };

    tracing::info!(
        experiment_id = %stored.id,
        version = stored.current_version,
        "Resuming stored experiment"
    );
    for it in pipeline.store.list_iterations(&stored.id)? {
        if !it.state.is_terminal() {
            tracing::warn!(iteration_id = %it.id, state = %it.state, "Failing interrupted iteration");
            pipeline
                .orchestrator
                .fail_iteration(&it.id, "interrupted: process exited mid-iteration")?;
        }
    }
    Ok(stored)
}

/// One line per iteration: ordinal, version, state, score, decision.
pub fn summary(iterations: &[Iteration]) -> String {
    let mut out = String::new();
    for it in iterations {
        let score = it
            .score()
            .map(|s| format!("{s:.3}"))
            .unwrap_or_else(|| "-".into());
        let decision = it
            .decision
            .map(|d| d.to_string())
            .or_else(|| it.failure_reason.clone())
            .unwrap_or_default();
        out.push_str(&format!(
            "  #{:<3} v{:<3} {:<11} score={:<6} {}\n",
            it.ordinal,
            it.prompt_version,
            it.state.as_str(),
            score,
            decision
        ));
    }
    out
}
