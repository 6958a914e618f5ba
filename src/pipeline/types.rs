// src/pipeline/types.rs — Pipeline domain records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::fan_in::StageFanIn;
use super::queue::Stage;
use crate::infra::errors::PipelineError;
use crate::provider::{ModelRef, SamplingParams, TokenUsage};

// ─── Experiment definition ──────────────────────────────────────────

/// A prompt experiment. Immutable once registered except `current_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub objective: String,
    pub rubric: Rubric,
    pub models: Vec<ModelConfig>,
    pub judges: Vec<JudgeConfig>,
    /// Model that rewrites the prompt after a `continue` decision.
    pub refiner: ModelConfig,
    /// Model that proposes new dataset cases. Falls back to the refiner.
    #[serde(default)]
    pub generator: Option<ModelConfig>,
    pub dataset: Vec<DatasetCase>,
    pub stop_rules: StopRules,
    /// Version number of the prompt the next iteration should run.
    pub current_version: u32,
    pub created_at: DateTime<Utc>,
}

impl Experiment {
    pub fn case(&self, case_id: &str) -> Option<&DatasetCase> {
        self.dataset.iter().find(|c| c.id == case_id)
    }

    pub fn model(&self, key: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.key() == key)
    }

    /// Structural checks run before an experiment is accepted.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.models.is_empty() {
            return Err(PipelineError::Validation(
                "experiment needs at least one model".into(),
            ));
        }
        if self.judges.is_empty() {
            return Err(PipelineError::Validation(
                "experiment needs at least one judge".into(),
            ));
        }
        if self.dataset.is_empty() {
            return Err(PipelineError::Validation(
                "experiment needs at least one dataset case".into(),
            ));
        }
        if self.rubric.criteria.is_empty() {
            return Err(PipelineError::Validation(
                "rubric needs at least one criterion".into(),
            ));
        }
        if self.stop_rules.max_iterations == 0 {
            return Err(PipelineError::Validation(
                "max_iterations must be at least 1".into(),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for case in &self.dataset {
            if !seen.insert(case.id.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "duplicate dataset case id '{}'",
                    case.id
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for model in &self.models {
            if !seen.insert(model.key()) {
                return Err(PipelineError::Validation(format!(
                    "model '{}' listed twice",
                    model.key()
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for judge in &self.judges {
            if !seen.insert(judge.id.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "duplicate judge id '{}'",
                    judge.id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub criteria: Vec<Criterion>,
}

impl Rubric {
    /// Weighted mean of per-criterion scores. Criteria the judge did not score
    /// are left out of both numerator and denominator.
    pub fn overall(&self, scores: &BTreeMap<String, f64>) -> f64 {
        let mut total = 0.0;
        let mut weight_sum = 0.0;
        for c in &self.criteria {
            if let Some(s) = scores.get(&c.name) {
                total += s * c.weight;
                weight_sum += c.weight;
            }
        }
        if weight_sum > 0.0 {
            total / weight_sum
        } else if scores.is_empty() {
            0.0
        } else {
            scores.values().sum::<f64>() / scores.len() as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

/// Addresses one provider adapter plus the sampling settings for a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub params: SamplingParams,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            params: SamplingParams::default(),
            seed: None,
        }
    }

    pub fn model_ref(&self) -> ModelRef {
        ModelRef::new(&self.provider, &self.model)
    }

    /// "provider/model", the model half of an execution key.
    pub fn key(&self) -> String {
        self.model_ref().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeMode {
    #[default]
    Pointwise,
    Pairwise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub id: String,
    #[serde(flatten)]
    pub model: ModelConfig,
    #[serde(default)]
    pub mode: JudgeMode,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetCase {
    pub id: String,
    pub input: String,
    #[serde(default)]
    pub expected: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopRules {
    pub max_iterations: u32,
    pub target_score: f64,
    pub plateau_window: usize,
    pub plateau_delta: f64,
}

impl Default for StopRules {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            target_score: 0.9,
            plateau_window: 2,
            plateau_delta: 0.01,
        }
    }
}

// ─── Prompt versions ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShot {
    pub input: String,
    pub output: String,
}

/// Immutable prompt snapshot. `version` increases by one per refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    pub id: String,
    pub experiment_id: String,
    pub version: u32,
    pub text: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub examples: Vec<FewShot>,
    /// Iteration whose refinement produced this version; `None` for the seed draft.
    #[serde(default)]
    pub source_iteration: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PromptVersion {
    pub fn id_for(experiment_id: &str, version: u32) -> String {
        format!("{experiment_id}@v{version}")
    }

    pub fn new(experiment_id: &str, version: u32, text: impl Into<String>) -> Self {
        Self {
            id: Self::id_for(experiment_id, version),
            experiment_id: experiment_id.to_string(),
            version,
            text: text.into(),
            system: None,
            examples: Vec::new(),
            source_iteration: None,
            created_at: Utc::now(),
        }
    }
}

// ─── Unit keys ──────────────────────────────────────────────────────

/// (model, dataset case): one execute unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecKey {
    pub model: String,
    pub case_id: String,
}

impl ExecKey {
    pub fn new(model: impl Into<String>, case_id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            case_id: case_id.into(),
        }
    }

    /// Stable unit key used for fan-in bookkeeping.
    pub fn unit(&self) -> String {
        format!("{}|{}", self.model, self.case_id)
    }

    /// Deterministic execution id, so a redelivered job addresses the same record.
    pub fn execution_id(&self, iteration_id: &str) -> String {
        format!("{iteration_id}|{}", self.unit())
    }
}

/// (execution, judge): one judge unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScoreKey {
    pub execution_id: String,
    pub judge_id: String,
}

impl ScoreKey {
    pub fn new(execution_id: impl Into<String>, judge_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            judge_id: judge_id.into(),
        }
    }

    pub fn unit(&self) -> String {
        format!("{}#{}", self.execution_id, self.judge_id)
    }
}

// ─── Iteration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationState {
    Queued,
    Executing,
    Judging,
    Aggregating,
    Refining,
    Completed,
    Stopped,
    Failed,
}

impl IterationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IterationState::Completed | IterationState::Stopped | IterationState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IterationState::Queued => "queued",
            IterationState::Executing => "executing",
            IterationState::Judging => "judging",
            IterationState::Aggregating => "aggregating",
            IterationState::Refining => "refining",
            IterationState::Completed => "completed",
            IterationState::Stopped => "stopped",
            IterationState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for IterationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    MaxIterations,
    TargetReached,
    Plateau,
    BelowTarget,
    Cancelled,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::MaxIterations => "max_iterations",
            DecisionReason::TargetReached => "target_reached",
            DecisionReason::Plateau => "plateau",
            DecisionReason::BelowTarget => "below_target",
            DecisionReason::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: DecisionReason,
}

impl Decision {
    pub fn stop(reason: DecisionReason) -> Self {
        Self {
            verdict: Verdict::Stop,
            reason,
        }
    }

    pub fn proceed() -> Self {
        Self {
            verdict: Verdict::Continue,
            reason: DecisionReason::BelowTarget,
        }
    }

    pub fn is_stop(&self) -> bool {
        self.verdict == Verdict::Stop
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verdict = match self.verdict {
            Verdict::Continue => "continue",
            Verdict::Stop => "stop",
        };
        write!(f, "{}({})", verdict, self.reason.as_str())
    }
}

/// Aggregated scores written onto the iteration by the aggregate stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    /// Mean overall score across every recorded judgment, 0.0 when none exist.
    pub mean_score: f64,
    pub per_criterion: BTreeMap<String, f64>,
    pub per_model: BTreeMap<String, f64>,
    pub scored: usize,
    pub missing_judgments: usize,
    pub failed_executions: usize,
}

/// Progress of a stage that runs a single job (aggregate, refine, generate, safety).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub expected: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyFinding {
    pub execution_id: String,
    pub label: String,
    pub severity: u8,
    pub excerpt: String,
}

/// The unit of work: one execute → judge → aggregate (→ refine) pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub experiment_id: String,
    pub prompt_version_id: String,
    pub prompt_version: u32,
    /// 1-based position within the experiment.
    pub ordinal: u32,
    pub state: IterationState,
    pub execute: StageFanIn,
    pub judge: StageFanIn,
    /// Single-job stages, keyed by stage.
    #[serde(default)]
    pub singles: BTreeMap<Stage, StageCounts>,
    #[serde(default)]
    pub decision: Option<Decision>,
    #[serde(default)]
    pub report: Option<AggregateReport>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub safety_blocked: bool,
    #[serde(default)]
    pub safety_findings: Vec<SafetyFinding>,
    #[serde(default)]
    pub next_iteration_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Iteration {
    pub fn new(experiment: &Experiment, version: &PromptVersion, ordinal: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            experiment_id: experiment.id.clone(),
            prompt_version_id: version.id.clone(),
            prompt_version: version.version,
            ordinal,
            state: IterationState::Queued,
            execute: StageFanIn::default(),
            judge: StageFanIn::default(),
            singles: BTreeMap::new(),
            decision: None,
            report: None,
            failure_reason: None,
            cancel_requested: false,
            safety_blocked: false,
            safety_findings: Vec::new(),
            next_iteration_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether workers should still spend provider calls on this iteration.
    pub fn accepts_work(&self) -> bool {
        !self.cancel_requested && !self.state.is_terminal()
    }

    pub fn score(&self) -> Option<f64> {
        self.report.as_ref().map(|r| r.mean_score)
    }

    /// Aggregation may only run once every judge unit has a terminal outcome.
    pub fn check_aggregation_ready(&self) -> Result<(), PipelineError> {
        let ready = matches!(
            self.state,
            IterationState::Aggregating
                | IterationState::Refining
                | IterationState::Completed
                | IterationState::Stopped
        ) && self.judge.is_complete();
        if ready {
            Ok(())
        } else {
            Err(PipelineError::AggregationIncomplete {
                iteration_id: self.id.clone(),
                completed: self.judge.settled(),
                expected: self.judge.expected_len(),
            })
        }
    }
}

// ─── Stage results ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: String,
    pub iteration_id: String,
    pub key: ExecKey,
    pub output: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub cached: bool,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preference {
    Current,
    Previous,
    Tie,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeScore {
    pub id: String,
    pub iteration_id: String,
    pub key: ScoreKey,
    /// Execution key of the scored output, kept for per-model aggregation.
    pub exec: ExecKey,
    pub criteria: BTreeMap<String, f64>,
    pub overall: f64,
    pub rationale: String,
    /// Set by pairwise judges that had a previous output to compare against.
    #[serde(default)]
    pub preference: Option<Preference>,
    pub created_at: DateTime<Utc>,
}

/// A judge unit that never produced a usable score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeFailure {
    pub id: String,
    pub iteration_id: String,
    pub key: ScoreKey,
    pub exec: ExecKey,
    pub reason: String,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// Dataset case proposed by the generate stage. Never merged into the experiment automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCase {
    pub id: String,
    pub experiment_id: String,
    pub iteration_id: String,
    pub input: String,
    #[serde(default)]
    pub expected: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rubric() -> Rubric {
        Rubric {
            criteria: vec![
                Criterion {
                    name: "accuracy".into(),
                    description: "Correct answer".into(),
                    weight: 3.0,
                },
                Criterion {
                    name: "tone".into(),
                    description: "Polite".into(),
                    weight: 1.0,
                },
            ],
        }
    }

    #[test]
    fn test_rubric_weighted_overall() {
        let scores = BTreeMap::from([("accuracy".to_string(), 1.0), ("tone".to_string(), 0.0)]);
        assert!((rubric().overall(&scores) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_rubric_skips_unscored_criteria() {
        let scores = BTreeMap::from([("tone".to_string(), 0.4)]);
        assert!((rubric().overall(&scores) - 0.4).abs() < 1e-9);
        assert_eq!(rubric().overall(&BTreeMap::new()), 0.0);
    }

    #[test]
    fn test_keys_are_deterministic() {
        let k = ExecKey::new("openai/gpt-4.1", "case-1");
        assert_eq!(k.execution_id("it"), "it|openai/gpt-4.1|case-1");
        let s = ScoreKey::new(k.execution_id("it"), "j1");
        assert_eq!(s.unit(), "it|openai/gpt-4.1|case-1#j1");
    }

    #[test]
    fn test_decision_display() {
        assert_eq!(Decision::proceed().to_string(), "continue(below_target)");
        assert_eq!(
            Decision::stop(DecisionReason::Plateau).to_string(),
            "stop(plateau)"
        );
    }

    #[test]
    fn test_state_terminal() {
        assert!(IterationState::Stopped.is_terminal());
        assert!(IterationState::Failed.is_terminal());
        assert!(!IterationState::Refining.is_terminal());
        assert_eq!(
            serde_json::to_string(&IterationState::Aggregating).unwrap(),
            "\"aggregating\""
        );
    }

    #[test]
    fn test_judge_config_flattens_model() {
        let j: JudgeConfig = toml::from_str(
            r#"
id = "strict"
provider = "openai"
model = "gpt-4.1"
mode = "pairwise"
"#,
        )
        .unwrap();
        assert_eq!(j.model.key(), "openai/gpt-4.1");
        assert_eq!(j.mode, JudgeMode::Pairwise);
    }
}
