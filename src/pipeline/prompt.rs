// src/pipeline/prompt.rs — Message sequences for each stage's model call

use minijinja::{context, Environment};
use serde::Serialize;

use super::types::{AggregateReport, DatasetCase, Experiment, PromptVersion};
use crate::infra::errors::PipelineError;
use crate::provider::Message;

const JUDGE_SYSTEM: &str = "You are a meticulous evaluator. You grade model outputs strictly \
against the rubric you are given and answer only in the requested format.";

const POINTWISE_TEMPLATE: &str = r#"Objective: {{ objective }}

Rubric:
{% for c in criteria %}- {{ c.name }} (weight {{ c.weight }}): {{ c.description }}
{% endfor %}
Task input:
{{ input }}
{% if expected %}
Reference answer:
{{ expected }}
{% endif %}
Output to grade:
{{ output }}

Score every rubric criterion from 0.0 (fails) to 1.0 (perfect).
Reply with a JSON object: {"scores": {"<criterion>": <score>, ...}, "rationale": "<one paragraph>"}"#;

const PAIRWISE_TEMPLATE: &str = r#"Objective: {{ objective }}

Rubric:
{% for c in criteria %}- {{ c.name }} (weight {{ c.weight }}): {{ c.description }}
{% endfor %}
Task input:
{{ input }}
{% if expected %}
Reference answer:
{{ expected }}
{% endif %}
Output CURRENT:
{{ output }}

Output PREVIOUS:
{{ previous }}

Compare the two outputs. Score every rubric criterion for CURRENT from 0.0 to 1.0,
and say which output better meets the objective.
Reply with a JSON object: {"scores": {"<criterion>": <score>, ...}, "preference": "current" | "previous" | "tie", "rationale": "<one paragraph>"}"#;

const STRICT_SUFFIX: &str = "\n\nYour previous reply could not be parsed (attempt {{ attempt }}). \
Respond with ONLY the JSON object. No prose, no code fences. Every score must be a number between 0.0 and 1.0.";

const REFINE_TEMPLATE: &str = r#"You improve prompts for language models.

Objective: {{ objective }}

Rubric:
{% for c in criteria %}- {{ c.name }}: {{ c.description }}
{% endfor %}
Current prompt (version {{ version }}):
<prompt>
{{ prompt }}
</prompt>
{% if system %}
Current system text:
<system>
{{ system }}
</system>
{% endif %}
Mean score: {{ mean }} over {{ report.scored }} judgments ({{ report.missing_judgments }} missing, {{ report.failed_executions }} failed executions).
{% for row in per_criterion %}- {{ row[0] }}: {{ row[1] }}
{% endfor %}
{% if failures %}
Weakest outputs:
{% for f in failures %}
[{{ loop.index }}] model {{ f.model }}, score {{ f.score }}
Input: {{ f.input }}
Output: {{ f.output }}
Judge: {{ f.rationale }}
{% endfor %}{% endif %}
Rewrite the prompt so these failures do not recur. Keep any {% raw %}{{ input }}{% endraw %} placeholders.
Reply with a JSON object: {"prompt": "<new prompt>", "system": "<new system text or empty>"}"#;

const GENERATE_TEMPLATE: &str = r#"You write evaluation cases for a prompt experiment.

Objective: {{ objective }}

Existing case inputs:
{% for input in inputs %}- {{ input }}
{% endfor %}
Propose {{ count }} new, distinct cases that cover situations the existing ones miss.
Reply with a JSON array: [{"input": "...", "expected": "..."}]"#;

fn render<S: Serialize>(name: &str, template: &str, ctx: S) -> Result<String, PipelineError> {
    Environment::new()
        .render_str(template, ctx)
        .map_err(|e| PipelineError::Validation(format!("{name} template: {e}")))
}

fn has_placeholders(text: &str) -> bool {
    text.contains("{{") || text.contains("{%")
}

/// Messages for one execute unit: system text, few-shot pairs, then the
/// rendered prompt. A prompt without placeholders gets the case input appended.
pub fn execution_messages(
    version: &PromptVersion,
    case: &DatasetCase,
) -> Result<Vec<Message>, PipelineError> {
    let mut messages = Vec::with_capacity(2 + version.examples.len() * 2);
    if let Some(system) = version.system.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(Message::system(system));
    }
    for shot in &version.examples {
        messages.push(Message::user(&shot.input));
        messages.push(Message::assistant(&shot.output));
    }

    let user = if has_placeholders(&version.text) {
        render(
            "prompt",
            &version.text,
            context! {
                input => &case.input,
                expected => case.expected.as_deref().unwrap_or(""),
                case_id => &case.id,
            },
        )?
    } else {
        format!("{}\n\n{}", version.text.trim_end(), case.input)
    };
    messages.push(Message::user(user));
    Ok(messages)
}

/// Judge request. `previous` switches to the pairwise template; `attempt > 0`
/// appends the strict re-prompt.
pub fn judge_messages(
    experiment: &Experiment,
    system_prompt: Option<&str>,
    case: &DatasetCase,
    output: &str,
    previous: Option<&str>,
    attempt: u32,
) -> Result<Vec<Message>, PipelineError> {
    let ctx = context! {
        objective => &experiment.objective,
        criteria => &experiment.rubric.criteria,
        input => &case.input,
        expected => case.expected.as_deref().unwrap_or(""),
        output => output,
        previous => previous.unwrap_or(""),
    };
    let mut body = match previous {
        Some(_) => render("pairwise judge", PAIRWISE_TEMPLATE, ctx)?,
        None => render("pointwise judge", POINTWISE_TEMPLATE, ctx)?,
    };
    if attempt > 0 {
        body.push_str(&render(
            "strict suffix",
            STRICT_SUFFIX,
            context! { attempt => attempt },
        )?);
    }
    Ok(vec![
        Message::system(system_prompt.unwrap_or(JUDGE_SYSTEM)),
        Message::user(body),
    ])
}

/// One weak output shown to the refiner.
#[derive(Debug, Clone, Serialize)]
pub struct FailureExample {
    pub model: String,
    pub input: String,
    pub output: String,
    #[serde(serialize_with = "two_places")]
    pub score: f64,
    pub rationale: String,
}

fn two_places<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{v:.2}"))
}

pub fn refine_messages(
    experiment: &Experiment,
    version: &PromptVersion,
    report: &AggregateReport,
    failures: &[FailureExample],
) -> Result<Vec<Message>, PipelineError> {
    let per_criterion: Vec<(&str, String)> = report
        .per_criterion
        .iter()
        .map(|(name, score)| (name.as_str(), format!("{score:.3}")))
        .collect();
    let body = render(
        "refine",
        REFINE_TEMPLATE,
        context! {
            objective => &experiment.objective,
            criteria => &experiment.rubric.criteria,
            version => version.version,
            prompt => &version.text,
            system => version.system.as_deref().unwrap_or(""),
            mean => format!("{:.3}", report.mean_score),
            per_criterion => per_criterion,
            report => report,
            failures => failures,
        },
    )?;
    Ok(vec![Message::user(body)])
}

pub fn generate_messages(experiment: &Experiment, count: u32) -> Result<Vec<Message>, PipelineError> {
    let inputs: Vec<&str> = experiment.dataset.iter().map(|c| c.input.as_str()).collect();
    let body = render(
        "generate",
        GENERATE_TEMPLATE,
        context! {
            objective => &experiment.objective,
            inputs => inputs,
            count => count,
        },
    )?;
    Ok(vec![Message::user(body)])
}
