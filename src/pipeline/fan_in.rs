// src/pipeline/fan_in.rs — Expected/completed unit-key sets for one stage
//
// A stage is complete exactly when every expected key has a terminal outcome.
// Only the orchestrator mutates these sets, under its per-iteration lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Terminal outcome reported by a worker for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Succeeded,
    /// Permanently failed after retries; the reason is kept for status.
    Failed(String),
}

/// What recording a completion signal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// First terminal outcome for this key.
    New,
    /// Key already settled: redelivery, ignored.
    Duplicate,
    /// Key is not part of this stage.
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageFanIn {
    expected: BTreeSet<String>,
    succeeded: BTreeSet<String>,
    failed: BTreeMap<String, String>,
}

impl StageFanIn {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected: keys.into_iter().map(Into::into).collect(),
            succeeded: BTreeSet::new(),
            failed: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, key: &str, outcome: UnitOutcome) -> Recorded {
        if !self.expected.contains(key) {
            return Recorded::Unknown;
        }
        if self.is_settled(key) {
            return Recorded::Duplicate;
        }
        match outcome {
            UnitOutcome::Succeeded => {
                self.succeeded.insert(key.to_string());
            }
            UnitOutcome::Failed(reason) => {
                self.failed.insert(key.to_string(), reason);
            }
        }
        Recorded::New
    }

    pub fn has_succeeded(&self, key: &str) -> bool {
        self.succeeded.contains(key)
    }

    pub fn is_settled(&self, key: &str) -> bool {
        self.succeeded.contains(key) || self.failed.contains_key(key)
    }

    /// Set equality between expected keys and settled keys.
    pub fn is_complete(&self) -> bool {
        self.settled() == self.expected.len()
            && self.expected.iter().all(|k| self.is_settled(k))
    }

    pub fn settled(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn expected_len(&self) -> usize {
        self.expected.len()
    }

    pub fn expected(&self) -> impl Iterator<Item = &str> {
        self.expected.iter().map(String::as_str)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.succeeded.iter().map(String::as_str)
    }

    pub fn succeeded_len(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failed(&self) -> &BTreeMap<String, String> {
        &self.failed
    }
}
