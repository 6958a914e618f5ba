// src/cli/experiment.rs — Experiment documents for the CLI

use std::path::Path;

use chrono::Utc;
use serde::Deserialize;

use crate::infra::errors::PipelineError;
use crate::pipeline::types::{
    Criterion, DatasetCase, Experiment, FewShot, JudgeConfig, ModelConfig, PromptVersion, Rubric,
    StopRules,
};
use crate::provider::resolver::ProviderRegistry;

#[derive(Debug, Clone, Deserialize)]
pub struct SeedPrompt {
    pub text: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub examples: Vec<FewShot>,
}

/// An experiment as written in TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentFile {
    /// Defaults to a slug of `name`, so re-running the same file resumes it.
    #[serde(default)]
    pub id: Option<String>,
    pub project: String,
    pub name: String,
    #[serde(default)]
    pub objective: String,
    pub prompt: SeedPrompt,
    pub rubric: Vec<Criterion>,
    pub models: Vec<ModelConfig>,
    pub judges: Vec<JudgeConfig>,
    pub refiner: ModelConfig,
    #[serde(default)]
    pub generator: Option<ModelConfig>,
    pub dataset: Vec<DatasetCase>,
    #[serde(default)]
    pub stop_rules: StopRules,
}

impl ExperimentFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn experiment_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| slug::slugify(&self.name))
    }

    /// Split into the experiment record and its version-1 seed prompt.
    pub fn into_parts(self) -> (Experiment, PromptVersion) {
        let id = self.experiment_id();
        let mut seed = PromptVersion::new(&id, 1, self.prompt.text);
        seed.system = self.prompt.system;
        seed.examples = self.prompt.examples;

        let experiment = Experiment {
            id,
            project_id: self.project,
            name: self.name,
            objective: self.objective,
            rubric: Rubric {
                criteria: self.rubric,
            },
            models: self.models,
            judges: self.judges,
            refiner: self.refiner,
            generator: self.generator,
            dataset: self.dataset,
            stop_rules: self.stop_rules,
            current_version: 1,
            created_at: Utc::now(),
        };
        (experiment, seed)
    }
}

/// Check every model the experiment names against the registry before any
/// job is dispatched.
pub fn validate_models(
    experiment: &Experiment,
    providers: &ProviderRegistry,
) -> Result<(), PipelineError> {
    let judges = experiment.judges.iter().map(|j| &j.model);
    let all = experiment
        .models
        .iter()
        .chain(judges)
        .chain(std::iter::once(&experiment.refiner))
        .chain(experiment.generator.iter());
    for model in all {
        providers.validate(&model.model_ref(), &model.params)?;
    }
    Ok(())
}
