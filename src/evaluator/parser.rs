// src/evaluator/parser.rs — Parse judge responses into per-criterion scores
//
// Judges are asked for a JSON object. Models wrap it in prose or code fences
// often enough that we dig it out, and we also accept the plain
// `SCORES:` / `RATIONALE:` layout some local models fall back to.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::infra::errors::PipelineError;
use crate::pipeline::types::{Preference, Rubric};

/// A judge verdict before it is tied to an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedJudgment {
    /// Criterion name → score in 0.0..=1.0, keyed by the rubric's spelling.
    pub scores: BTreeMap<String, f64>,
    pub rationale: String,
    pub preference: Option<Preference>,
}

#[derive(Deserialize)]
struct RawJudgment {
    scores: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    preference: Option<String>,
}

/// Parse a judge response against the rubric. Fails with `JudgeParse` when no
/// rubric criterion received a usable score.
pub fn parse_judgment(response: &str, rubric: &Rubric) -> Result<ParsedJudgment, PipelineError> {
    let raw = match extract_json(response) {
        Some(json) => serde_json::from_str::<RawJudgment>(json)
            .map_err(|e| PipelineError::JudgeParse(format!("invalid judgment JSON: {e}")))?,
        None => parse_sections(response)
            .ok_or_else(|| PipelineError::JudgeParse("no JSON object or SCORES section".into()))?,
    };

    let mut scores = BTreeMap::new();
    for (name, value) in &raw.scores {
        let Some(criterion) = rubric
            .criteria
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
        else {
            continue;
        };
        let score = value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| {
                PipelineError::JudgeParse(format!("score for '{name}' is not a number"))
            })?;
        scores.insert(criterion.name.clone(), normalize(name, score)?);
    }

    if scores.is_empty() {
        return Err(PipelineError::JudgeParse(
            "response scored none of the rubric criteria".into(),
        ));
    }

    let preference = raw.preference.as_deref().and_then(parse_preference);

    Ok(ParsedJudgment {
        scores,
        rationale: raw.rationale.trim().to_string(),
        preference,
    })
}

/// Accept 0-1 directly and 0-10 scaled down. Anything else is a parse failure.
fn normalize(name: &str, score: f64) -> Result<f64, PipelineError> {
    if !score.is_finite() || score < 0.0 {
        return Err(PipelineError::JudgeParse(format!(
            "score for '{name}' out of range: {score}"
        )));
    }
    if score <= 1.0 {
        Ok(score)
    } else if score <= 10.0 {
        Ok(score / 10.0)
    } else {
        Err(PipelineError::JudgeParse(format!(
            "score for '{name}' out of range: {score}"
        )))
    }
}

fn parse_preference(s: &str) -> Option<Preference> {
    match s.trim().to_ascii_lowercase().as_str() {
        "current" | "a" | "new" => Some(Preference::Current),
        "previous" | "b" | "old" | "baseline" => Some(Preference::Previous),
        "tie" | "equal" | "none" => Some(Preference::Tie),
        _ => None,
    }
}

/// Locate the outermost JSON object in a response, preferring a fenced block.
pub fn extract_json(response: &str) -> Option<&str> {
    let body = fenced_block(response).unwrap_or(response);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&body[start..=end])
}

/// Locate the outermost JSON array in a response, preferring a fenced block.
pub fn extract_json_array(response: &str) -> Option<&str> {
    let body = fenced_block(response).unwrap_or(response);
    let start = body.find('[')?;
    let end = body.rfind(']')?;
    if end <= start {
        return None;
    }
    Some(&body[start..=end])
}

/// Contents of the first ``` fenced block, without the language tag.
pub fn fenced_block(response: &str) -> Option<&str> {
    let open = response.find("```")?;
    let after = &response[open + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

fn parse_sections(response: &str) -> Option<RawJudgment> {
    let mut scores = BTreeMap::new();
    let mut rationale = String::new();
    let mut preference = None;
    let mut in_scores = false;

    for line in response.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("SCORES:") || trimmed.starts_with("## Scores") {
            in_scores = true;
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("RATIONALE:") {
            in_scores = false;
            rationale = rest.trim().to_string();
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("PREFERENCE:") {
            in_scores = false;
            preference = Some(rest.trim().to_string());
            continue;
        }
        if in_scores {
            if let Some((name, score)) = parse_score_line(trimmed) {
                scores.insert(name, serde_json::Value::from(score));
            }
        } else if !rationale.is_empty() && !trimmed.is_empty() {
            rationale.push(' ');
            rationale.push_str(trimmed);
        }
    }

    if scores.is_empty() {
        return None;
    }
    Some(RawJudgment {
        scores,
        rationale,
        preference,
    })
}

/// Parse a line like "accuracy: 0.85" or "- accuracy: 0.85"
pub(crate) fn parse_score_line(line: &str) -> Option<(String, f64)> {
    let line = line.trim_start_matches('-').trim();
    let (name, score_str) = line.split_once(':')?;
    let score: f64 = score_str.trim().parse().ok()?;
    Some((name.trim().to_string(), score))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Criterion;
    use pretty_assertions::assert_eq;

    fn rubric() -> Rubric {
        Rubric {
            criteria: vec![
                Criterion {
                    name: "accuracy".into(),
                    description: "Correct".into(),
                    weight: 1.0,
                },
                Criterion {
                    name: "clarity".into(),
                    description: "Clear".into(),
                    weight: 1.0,
                },
            ],
        }
    }

    #[test]
    fn test_plain_json() {
        let j = parse_judgment(
            r#"{"scores": {"accuracy": 0.8, "clarity": 0.6}, "rationale": "mostly right"}"#,
            &rubric(),
        )
        .unwrap();
        assert_eq!(
            j.scores,
            BTreeMap::from([("accuracy".to_string(), 0.8), ("clarity".to_string(), 0.6)])
        );
        assert_eq!(j.rationale, "mostly right");
        assert_eq!(j.preference, None);
    }

    #[test]
    fn test_fenced_json_with_prose() {
        let response = "Here is my evaluation:\n```json\n{\"scores\": {\"Accuracy\": 9, \"clarity\": \"7\"}, \"rationale\": \"ok\", \"preference\": \"previous\"}\n```\nThanks!";
        let j = parse_judgment(response, &rubric()).unwrap();
        assert_eq!(j.scores["accuracy"], 0.9);
        assert_eq!(j.scores["clarity"], 0.7);
        assert_eq!(j.preference, Some(Preference::Previous));
    }

    #[test]
    fn test_section_format() {
        let response = "SCORES:\n- accuracy: 0.5\n- clarity: 1.0\nRATIONALE: terse but\ncorrect\nPREFERENCE: tie";
        let j = parse_judgment(response, &rubric()).unwrap();
        assert_eq!(j.scores.len(), 2);
        assert_eq!(j.rationale, "terse but correct");
        assert_eq!(j.preference, Some(Preference::Tie));
    }

    #[test]
    fn test_unknown_criteria_ignored() {
        let j = parse_judgment(
            r#"{"scores": {"accuracy": 1.0, "vibes": 0.1}}"#,
            &rubric(),
        )
        .unwrap();
        assert_eq!(j.scores.len(), 1);
    }

    #[test]
    fn test_failures() {
        let r = rubric();
        for bad in [
            "I think it's great!",
            r#"{"scores": {"vibes": 0.5}}"#,
            r#"{"scores": {"accuracy": 42}}"#,
            r#"{"scores": {"accuracy": "high"}}"#,
            r#"{"score": 0.5}"#,
        ] {
            let err = parse_judgment(bad, &r).unwrap_err();
            assert!(matches!(err, PipelineError::JudgeParse(_)), "{bad}");
        }
    }

    #[test]
    fn test_extract_json_helpers() {
        assert_eq!(extract_json("x {\"a\":1} y"), Some("{\"a\":1}"));
        assert_eq!(extract_json("no braces"), None);
        assert_eq!(fenced_block("```\nbody\n```"), Some("body\n"));
        assert_eq!(fenced_block("none"), None);
        assert_eq!(
            extract_json_array("```json\n[{\"input\":\"a\"}]\n```"),
            Some("[{\"input\":\"a\"}]")
        );
        assert_eq!(extract_json_array("{}"), None);
    }

    #[test]
    fn test_parse_score_line() {
        assert_eq!(
            parse_score_line("- accuracy: 0.85"),
            Some(("accuracy".into(), 0.85))
        );
        assert_eq!(parse_score_line("no score here"), None);
    }
}
