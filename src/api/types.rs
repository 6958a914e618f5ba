// src/api/types.rs

use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::pipeline::cost::ModelCostEntry;
use crate::pipeline::types::IterationState;

/// Body for starting an iteration. Without a version id the experiment's
/// current prompt version is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartIterationRequest {
    #[serde(default)]
    pub prompt_version_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IterationCreatedResponse {
    pub iteration_id: String,
    pub experiment_id: String,
    pub prompt_version_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    /// Iteration that was cancelled, if one was in flight.
    pub iteration_id: Option<String>,
    pub state: Option<IterationState>,
}

/// Spend since process start.
#[derive(Debug, Serialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub calls: u64,
    pub cache_hits: u64,
    pub cache: CacheStats,
    pub models: Vec<ModelCostEntry>,
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}
