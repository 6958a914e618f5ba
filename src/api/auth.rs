// src/api/auth.rs — Authorization gate
//
// A bearer token resolves to a principal and the projects it may act on.
// Membership is checked before the orchestrator is called.

use axum::http::HeaderMap;

use crate::api::ApiState;
use crate::infra::errors::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    /// `None` means every project (no tokens configured).
    projects: Option<Vec<String>>,
}

impl Principal {
    pub fn can_access(&self, project_id: &str) -> bool {
        match &self.projects {
            None => true,
            Some(projects) => projects.iter().any(|p| p == project_id || p == "*"),
        }
    }

    /// Fail with `Forbidden` unless the principal belongs to the project.
    pub fn authorize(&self, project_id: &str) -> Result<(), PipelineError> {
        if self.can_access(project_id) {
            Ok(())
        } else {
            Err(PipelineError::Forbidden {
                principal: self.name.clone(),
                project_id: project_id.to_string(),
            })
        }
    }
}

/// Resolve the caller from `Authorization: Bearer <token>`. With no tokens
/// configured the API is open to a local anonymous principal.
pub fn authenticate(state: &ApiState, headers: &HeaderMap) -> Result<Principal, PipelineError> {
    if state.tokens.is_empty() {
        return Ok(Principal {
            name: "anonymous".into(),
            projects: None,
        });
    }

    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    state
        .tokens
        .iter()
        .find(|t| constant_time_eq(presented.as_bytes(), t.token.as_bytes()))
        .map(|t| Principal {
            name: t.principal.clone(),
            projects: Some(t.projects.clone()),
        })
        .ok_or(PipelineError::Unauthorized)
}

/// Constant-time byte comparison to prevent timing attacks on token auth.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }

    #[test]
    fn test_membership() {
        let p = Principal {
            name: "alice".into(),
            projects: Some(vec!["proj-1".into()]),
        };
        assert!(p.authorize("proj-1").is_ok());
        assert!(matches!(
            p.authorize("proj-2"),
            Err(PipelineError::Forbidden { .. })
        ));

        let admin = Principal {
            name: "ops".into(),
            projects: Some(vec!["*".into()]),
        };
        assert!(admin.can_access("anything"));
    }
}
