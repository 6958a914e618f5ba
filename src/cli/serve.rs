// src/cli/serve.rs — `promptloop serve`: worker pools plus the trigger API

use std::path::PathBuf;
use std::sync::Arc;

use crate::api::{self, ApiState};
use crate::cache::ResponseCache;
use crate::cli::experiment::{validate_models, ExperimentFile};
use crate::infra::config::Config;
use crate::pipeline::Pipeline;
use crate::provider::resolver::ProviderRegistry;
use crate::store;

pub async fn run_serve(config: Config, experiments: &[PathBuf]) -> anyhow::Result<()> {
    if !config.api.enabled {
        anyhow::bail!("API is disabled; set [api].enabled = true to serve");
    }
    if config.api.tokens.is_empty() {
        tracing::warn!("No [[api.tokens]] configured; the API accepts unauthenticated requests");
    }

    let store = store::open(&config.storage)?;
    let cache = Arc::new(ResponseCache::new());
    let providers = ProviderRegistry::from_config(&config, cache)?;
    let api_config = config.api.clone();
    let pipeline = Pipeline::new(config, store, providers)?;

    for path in experiments {
        let (experiment, seed) = ExperimentFile::load(path)?.into_parts();
        validate_models(&experiment, &pipeline.providers)?;
        if pipeline.store.get_experiment(&experiment.id)?.is_some() {
            tracing::info!(experiment_id = %experiment.id, "Experiment already stored");
            continue;
        }
        pipeline
            .orchestrator
            .register_experiment(&experiment, &seed)?;
        eprintln!("Registered experiment '{}'", experiment.id);
    }

    let runtime = pipeline.start_workers()?;
    let state = ApiState::new(&pipeline, &api_config);
    eprintln!(
        "promptloop v{} serving on http://127.0.0.1:{} (Ctrl-C to stop)",
        env!("CARGO_PKG_VERSION"),
        api_config.port
    );

    let served = api::start_server(&api_config, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    runtime.shutdown().await;
    eprintln!("{}", pipeline.costs.summary());
    served
}
