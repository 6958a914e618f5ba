// src/infra/errors.rs — Error types for the prompt pipeline

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    // Fatal: missing credentials, endpoints or unknown providers. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Non-2xx or transport failure from a model provider
    #[error("Provider '{provider}' error (status {status}): {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
        retriable: bool,
        retry_after_ms: Option<u64>,
    },

    #[error("Judge response could not be parsed: {0}")]
    JudgeParse(String),

    // Invariant violation: aggregation ran before judge fan-in completed
    #[error("Aggregation invoked before fan-in completed for iteration '{iteration_id}' ({completed}/{expected})")]
    AggregationIncomplete {
        iteration_id: String,
        completed: usize,
        expected: usize,
    },

    // Boundary errors
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Missing or invalid credentials")]
    Unauthorized,

    #[error("Principal '{principal}' may not access project '{project_id}'")]
    Forbidden {
        principal: String,
        project_id: String,
    },

    #[error("Store error: {0}")]
    Store(String),
}

impl PipelineError {
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PipelineError::Provider {
                retriable: true,
                ..
            }
        )
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Transport-level failure (timeout, connection reset) before any HTTP status.
    pub fn transport(provider: impl Into<String>, err: &reqwest::Error) -> Self {
        PipelineError::Provider {
            provider: provider.into(),
            status: 0,
            message: err.to_string(),
            retriable: err.is_timeout() || err.is_connect() || err.is_request(),
            retry_after_ms: None,
        }
    }

    /// Build a provider error from a non-2xx HTTP status.
    pub fn from_status(provider: impl Into<String>, status: u16, body: &str) -> Self {
        let rate_limited = status == 429;
        PipelineError::Provider {
            provider: provider.into(),
            status,
            message: format!("HTTP {}: {}", status, crate::util::truncate_str(body, 500)),
            retriable: rate_limited || (500..600).contains(&status),
            retry_after_ms: if rate_limited { Some(5_000) } else { None },
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Store(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retriable() {
        let err = PipelineError::from_status("openai", 503, "overloaded");
        assert!(err.is_retriable());
    }

    #[test]
    fn test_rate_limit_carries_hint() {
        match PipelineError::from_status("openai", 429, "slow down") {
            PipelineError::Provider {
                retriable,
                retry_after_ms,
                ..
            } => {
                assert!(retriable);
                assert_eq!(retry_after_ms, Some(5_000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_client_errors_not_retriable() {
        assert!(!PipelineError::from_status("openai", 400, "bad").is_retriable());
        assert!(!PipelineError::from_status("openai", 401, "nope").is_retriable());
    }

    #[test]
    fn test_configuration_never_retriable() {
        assert!(!PipelineError::Configuration("missing key".into()).is_retriable());
        assert!(!PipelineError::JudgeParse("bad json".into()).is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = PipelineError::not_found("iteration", "it-1");
        assert_eq!(err.to_string(), "iteration 'it-1' not found");
    }
}
