//! Push-event payload parsing

use serde_json::Value;

use crate::error::{HookError, Result};

/// Hosting service a push payload came from, as detected from its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// `push.changes[0].new.name`
    Bitbucket,
    /// `ref` = `refs/heads/<branch>`
    GitHub,
}

/// Branch information extracted from a push payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub branch: String,
    pub provider: Provider,
}

impl PushEvent {
    /// Parses the raw request body and pulls out the pushed branch name.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| HookError::Payload(format!("body is not valid JSON: {}", e)))?;

        if let Some(branch) = bitbucket_branch(&payload) {
            return Ok(Self {
                branch: branch.to_string(),
                provider: Provider::Bitbucket,
            });
        }

        if let Some(branch_ref) = payload.get("ref").and_then(|r| r.as_str()) {
            let branch = branch_ref.strip_prefix("refs/heads/").unwrap_or(branch_ref);
            return Ok(Self {
                branch: branch.to_string(),
                provider: Provider::GitHub,
            });
        }

        Err(HookError::Payload(
            "no branch found at push.changes[0].new.name or ref".to_string(),
        ))
    }

    /// Case-insensitive comparison against the branch an application is checked out on.
    pub fn matches_branch(&self, configured: &str) -> bool {
        self.branch.to_lowercase() == configured.to_lowercase()
    }
}

fn bitbucket_branch(payload: &Value) -> Option<&str> {
    payload
        .get("push")?
        .get("changes")?
        .get(0)?
        .get("new")?
        .get("name")?
        .as_str()
}
