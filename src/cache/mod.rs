// src/cache/mod.rs — Content-addressed response cache
//
// Pure key-value lookup over call fingerprints. It knows nothing about
// iterations or experiments, so identical calls made by different iterations
// resolve to the same entry.

pub mod fingerprint;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::provider::{ChatResponse, TokenUsage};
pub use fingerprint::{fingerprint, CacheKey};

/// A stored provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub text: String,
    pub usage: TokenUsage,
    /// Latency of the original network call.
    pub latency_ms: u64,
    pub model_id: String,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Lock-free concurrent response cache.
///
/// Entries never expire inside a process; eviction is left to whoever owns
/// the process lifecycle.
#[derive(Default)]
pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a previous response. The returned response is flagged `cached`
    /// and reports zero latency.
    pub fn read(&self, key: &CacheKey) -> Option<ChatResponse> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(ChatResponse {
                    text: entry.text.clone(),
                    usage: entry.usage,
                    latency_ms: 0,
                    cached: true,
                    model_id: entry.model_id.clone(),
                })
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a response. The first write for a key wins; later writes for the
    /// same key are no-ops, so racing writers converge on one value.
    pub fn write(&self, key: CacheKey, response: &ChatResponse) {
        self.entries.entry(key).or_insert_with(|| CacheEntry {
            text: response.text.clone(),
            usage: response.usage,
            latency_ms: response.latency_ms,
            model_id: response.model_id.clone(),
            stored_at: Utc::now(),
        });
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatRequest, Message};
    use std::sync::Arc;

    fn response(text: &str) -> ChatResponse {
        ChatResponse {
            text: text.into(),
            usage: TokenUsage::new(10, 5),
            latency_ms: 420,
            cached: false,
            model_id: "gpt-4.1".into(),
        }
    }

    fn key(content: &str) -> CacheKey {
        fingerprint(
            "openai",
            &ChatRequest::new("gpt-4.1", vec![Message::user(content)]),
        )
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = ResponseCache::new();
        assert!(cache.read(&key("q")).is_none());

        cache.write(key("q"), &response("answer"));
        let hit = cache.read(&key("q")).unwrap();
        assert!(hit.cached);
        assert_eq!(hit.latency_ms, 0);
        assert_eq!(hit.text, "answer");
        assert_eq!(hit.usage, TokenUsage::new(10, 5));

        let stats = cache.stats();
        assert_eq!(stats, CacheStats { entries: 1, hits: 1, misses: 1 });
    }

    #[test]
    fn test_first_write_wins() {
        let cache = ResponseCache::new();
        cache.write(key("q"), &response("first"));
        cache.write(key("q"), &response("second"));
        assert_eq!(cache.read(&key("q")).unwrap().text, "first");
        assert_eq!(cache.len(), 1);
        // original latency kept for audit
        assert_eq!(cache.entry(&key("q")).unwrap().latency_ms, 420);
    }

    #[test]
    fn test_concurrent_writers_converge() {
        let cache = Arc::new(ResponseCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache.write(key("shared"), &response(&format!("writer-{i}")));
                    cache.write(key(&format!("own-{i}")), &response("mine"));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cache.len(), 9);
        let first = cache.read(&key("shared")).unwrap().text;
        for _ in 0..5 {
            assert_eq!(cache.read(&key("shared")).unwrap().text, first);
        }
    }

    #[test]
    fn test_clear() {
        let cache = ResponseCache::new();
        cache.write(key("a"), &response("x"));
        assert!(!cache.is_empty());
        cache.clear();
        assert!(cache.is_empty());
    }
}
