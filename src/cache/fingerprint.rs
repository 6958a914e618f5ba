// src/cache/fingerprint.rs — Deterministic call fingerprints

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::provider::{ChatRequest, SamplingParams};

/// Content address of a provider call: hex SHA-256 over the canonical call input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
struct CanonicalCall<'a> {
    provider: &'a str,
    model: &'a str,
    messages: Vec<(&'static str, &'a str)>,
    params: CanonicalParams,
    seed: Option<u64>,
}

/// Floats are rendered at fixed precision so 0.7 and 0.70000001 address the same entry.
#[derive(Serialize)]
struct CanonicalParams {
    temperature: Option<String>,
    top_p: Option<String>,
    max_tokens: Option<u32>,
    presence_penalty: Option<String>,
    frequency_penalty: Option<String>,
    stop: Vec<String>,
}

fn fixed(v: Option<f32>) -> Option<String> {
    v.map(|x| format!("{:.4}", x))
}

impl From<&SamplingParams> for CanonicalParams {
    fn from(p: &SamplingParams) -> Self {
        let mut stop = p.stop.clone();
        stop.sort();
        stop.dedup();
        Self {
            temperature: fixed(p.temperature),
            top_p: fixed(p.top_p),
            max_tokens: p.max_tokens,
            presence_penalty: fixed(p.presence_penalty),
            frequency_penalty: fixed(p.frequency_penalty),
            stop,
        }
    }
}

/// Fingerprint a call. Message order is significant; stop-sequence order is not.
pub fn fingerprint(provider: &str, request: &ChatRequest) -> CacheKey {
    let canonical = CanonicalCall {
        provider,
        model: &request.model,
        messages: request
            .messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_str()))
            .collect(),
        params: CanonicalParams::from(&request.params),
        seed: request.seed,
    };

    // Serializing plain strings, integers and vectors cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    CacheKey(hex::encode(digest))
}
