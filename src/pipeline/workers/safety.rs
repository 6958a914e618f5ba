// src/pipeline/workers/safety.rs — Regex content filter over iteration outputs
//
// Built-in patterns catch leaked credentials and dangerous shell snippets;
// `[safety].deny_patterns` adds project-specific ones. A finding at or above
// the block threshold flags the iteration without touching its decision.

use regex::Regex;
use tracing::{info, warn};

use super::WorkerContext;
use crate::infra::config::SafetyConfig;
use crate::infra::errors::PipelineError;
use crate::pipeline::fan_in::UnitOutcome;
use crate::pipeline::queue::{ScopedJob, Stage};
use crate::pipeline::types::SafetyFinding;
use crate::util::excerpt;

const EXCERPT_CHARS: usize = 80;

const BUILTIN: &[(&str, &str, u8)] = &[
    (
        r#"(?i)api[_-]?key\s*[:=]\s*['"][^'"]{8,}['"]"#,
        "API key in output",
        8,
    ),
    (
        r#"(?i)password\s*[:=]\s*['"][^'"]+['"]"#,
        "Password in output",
        8,
    ),
    (r"-----BEGIN [A-Z ]*PRIVATE KEY-----", "Private key in output", 10),
    (r"\bsk-[A-Za-z0-9_-]{20,}", "Provider secret key in output", 9),
    (r"(?i)rm\s+-rf\s+/", "Dangerous recursive delete command", 9),
    (
        r"(?i)wget[^\n]*\|\s*sh|curl[^\n]*\|\s*(ba)?sh",
        "Remote code execution pattern",
        8,
    ),
    (r"(?i)/etc/shadow", "System credential access", 7),
    (
        r"(?i)ignore\s+(?:all\s+)?(?:previous|above)\s+instructions",
        "Prompt injection echoed in output",
        5,
    ),
];

struct Rule {
    pattern: Regex,
    label: String,
    severity: u8,
}

pub struct SafetyFilter {
    rules: Vec<Rule>,
    block_severity: u8,
}

impl SafetyFilter {
    /// Compile built-in and configured patterns. A bad configured pattern is
    /// a configuration error surfaced at startup.
    pub fn new(config: &SafetyConfig) -> Result<Self, PipelineError> {
        let builtin = BUILTIN
            .iter()
            .map(|(p, label, sev)| (p.to_string(), label.to_string(), *sev));
        let configured = config
            .deny_patterns
            .iter()
            .map(|d| (d.pattern.clone(), d.label.clone(), d.severity));

        let mut rules = Vec::new();
        for (pattern, label, severity) in builtin.chain(configured) {
            let pattern = Regex::new(&pattern).map_err(|e| {
                PipelineError::Configuration(format!("safety pattern '{label}': {e}"))
            })?;
            rules.push(Rule {
                pattern,
                label,
                severity: severity.min(10),
            });
        }
        Ok(Self {
            rules,
            block_severity: config.block_severity,
        })
    }

    /// Every rule that matches `text`, attributed to `execution_id`.
    pub fn scan(&self, execution_id: &str, text: &str) -> Vec<SafetyFinding> {
        self.rules
            .iter()
            .filter_map(|rule| {
                rule.pattern.find(text).map(|m| SafetyFinding {
                    execution_id: execution_id.to_string(),
                    label: rule.label.clone(),
                    severity: rule.severity,
                    excerpt: excerpt(m.as_str(), EXCERPT_CHARS),
                })
            })
            .collect()
    }

    pub fn blocks(&self, findings: &[SafetyFinding]) -> bool {
        findings.iter().any(|f| f.severity >= self.block_severity)
    }
}

pub async fn run(ctx: &WorkerContext, job: ScopedJob) -> Result<(), PipelineError> {
    let executions = match ctx.store.list_executions(&job.iteration_id) {
        Ok(e) => e,
        Err(e) => {
            warn!(iteration_id = %job.iteration_id, stage = "safety", "Safety scan failed: {}", e);
            return ctx.orchestrator.record_maintenance(
                &job.iteration_id,
                Stage::Safety,
                UnitOutcome::Failed(e.to_string()),
            );
        }
    };

    let findings: Vec<SafetyFinding> = executions
        .iter()
        .flat_map(|e| ctx.safety.scan(&e.id, &e.output))
        .collect();
    let blocked = ctx.safety.blocks(&findings);
    info!(
        iteration_id = %job.iteration_id,
        stage = "safety",
        scope = %job.scope,
        scanned = executions.len(),
        findings = findings.len(),
        blocked,
        "Safety scan finished"
    );
    ctx.orchestrator
        .record_safety(&job.iteration_id, findings, blocked)
}
