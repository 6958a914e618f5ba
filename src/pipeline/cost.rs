// src/pipeline/cost.rs — Provider spend by stage and model

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use super::queue::Stage;
use crate::provider::{ChatResponse, TokenUsage};

#[derive(Debug, Default)]
struct Ledger {
    total_usd: f64,
    by_model: HashMap<String, f64>,
    by_stage: HashMap<Stage, f64>,
    /// (input, output) tokens actually paid for.
    tokens_by_model: HashMap<String, (u64, u64)>,
    calls_by_model: HashMap<String, u64>,
    cache_hits: u64,
}

/// Shared by all workers. Cache hits are counted but never charged.
#[derive(Debug, Default)]
pub struct CostTracker {
    ledger: Mutex<Ledger>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCostEntry {
    pub model: String,
    pub cost_usd: f64,
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one provider response. `cost_usd` comes from the adapter's
    /// advisory estimate.
    pub fn record(&self, stage: Stage, model: &str, response: &ChatResponse, cost_usd: f64) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        if response.cached {
            ledger.cache_hits += 1;
            return;
        }
        ledger.total_usd += cost_usd;
        *ledger.by_model.entry(model.into()).or_default() += cost_usd;
        *ledger.by_stage.entry(stage).or_default() += cost_usd;
        let TokenUsage {
            prompt_tokens,
            completion_tokens,
            ..
        } = response.usage;
        let tokens = ledger.tokens_by_model.entry(model.into()).or_insert((0, 0));
        tokens.0 += prompt_tokens as u64;
        tokens.1 += completion_tokens as u64;
        *ledger.calls_by_model.entry(model.into()).or_default() += 1;
    }

    pub fn total_usd(&self) -> f64 {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner()).total_usd
    }

    pub fn cache_hits(&self) -> u64 {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner()).cache_hits
    }

    pub fn stage_cost(&self, stage: Stage) -> f64 {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_stage
            .get(&stage)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn total_calls(&self) -> u64 {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .calls_by_model
            .values()
            .sum()
    }

    /// Highest spend first.
    pub fn model_breakdown(&self) -> Vec<ModelCostEntry> {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = ledger
            .by_model
            .iter()
            .map(|(model, cost)| {
                let (input, output) = ledger.tokens_by_model.get(model).copied().unwrap_or((0, 0));
                ModelCostEntry {
                    model: model.clone(),
                    cost_usd: *cost,
                    calls: ledger.calls_by_model.get(model).copied().unwrap_or(0),
                    input_tokens: input,
                    output_tokens: output,
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            b.cost_usd
                .partial_cmp(&a.cost_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries
    }

    pub fn summary(&self) -> String {
        let ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        format!(
            "${:.4} total ({} models, {} cache hits)",
            ledger.total_usd,
            ledger.by_model.len(),
            ledger.cache_hits
        )
    }

    /// Multi-line report, stages in pipeline order.
    pub fn report(&self) -> String {
        let mut report = format!("Spend: {}\n", self.summary());
        for entry in self.model_breakdown() {
            report.push_str(&format!(
                "  {}: ${:.4} ({} calls, {}in/{}out tokens)\n",
                entry.model, entry.cost_usd, entry.calls, entry.input_tokens, entry.output_tokens,
            ));
        }
        for stage in Stage::ALL {
            let cost = self.stage_cost(stage);
            if cost > 0.0 {
                report.push_str(&format!("  [{}] ${:.4}\n", stage, cost));
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(cached: bool) -> ChatResponse {
        ChatResponse {
            text: "x".into(),
            usage: TokenUsage::new(1000, 500),
            latency_ms: if cached { 0 } else { 900 },
            cached,
            model_id: "gpt-4.1".into(),
        }
    }

    #[test]
    fn test_records_by_stage_and_model() {
        let t = CostTracker::new();
        t.record(Stage::Execute, "openai/gpt-4.1", &resp(false), 0.01);
        t.record(Stage::Judge, "anthropic/claude-sonnet-4", &resp(false), 0.02);
        assert!((t.total_usd() - 0.03).abs() < 1e-12);
        assert!((t.stage_cost(Stage::Judge) - 0.02).abs() < 1e-12);
        assert_eq!(t.total_calls(), 2);
        let top = &t.model_breakdown()[0];
        assert_eq!(top.model, "anthropic/claude-sonnet-4");
        assert_eq!(top.input_tokens, 1000);
    }

    #[test]
    fn test_cache_hits_not_charged() {
        let t = CostTracker::new();
        t.record(Stage::Execute, "openai/gpt-4.1", &resp(true), 0.5);
        assert_eq!(t.total_usd(), 0.0);
        assert_eq!(t.total_calls(), 0);
        assert_eq!(t.cache_hits(), 1);
        assert!(t.summary().contains("1 cache hits"));
    }

    #[test]
    fn test_report_lists_stages() {
        let t = CostTracker::new();
        t.record(Stage::Refine, "openai/gpt-4.1", &resp(false), 0.004);
        let r = t.report();
        assert!(r.contains("[refine]"));
        assert!(!r.contains("[execute]"));
    }
}
