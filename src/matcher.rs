//! Resolves an inbound webhook to the registrations it should deploy.

use axum::body::Bytes;
use axum::http::HeaderMap;
use tracing::{debug, error, info, warn};

use crate::error::HookError;
use crate::external::ProcessManager;
use crate::registry::HookRegistration;
use crate::signature::{SIGNATURE_HEADER, verify_hub_signature};
use crate::webhook::PushEvent;

/// A fully received POST request
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub port: u16,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn signature(&self) -> Option<&str> {
        // HeaderMap lookups are case-insensitive
        self.headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug)]
pub enum MatchOutcome {
    /// Authenticated and on the configured branch; a pipeline should run.
    Accepted,
    PathMismatch,
    /// Signature or branch mismatch, payload or lookup failure.
    Rejected(HookError),
}

impl MatchOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MatchOutcome::Accepted)
    }
}

/// Evaluates every candidate registration independently.
///
/// `candidates` should be the registrations on `request.port`; each one that
/// passes path, signature and branch checks comes back `Accepted`.
pub async fn match_request(
    candidates: &[HookRegistration],
    processes: &dyn ProcessManager,
    request: &InboundRequest,
) -> Vec<(HookRegistration, MatchOutcome)> {
    let mut results = Vec::with_capacity(candidates.len());

    for registration in candidates.iter().filter(|r| r.port == request.port) {
        let outcome = evaluate(registration, processes, request).await;
        match &outcome {
            MatchOutcome::Accepted => {}
            MatchOutcome::PathMismatch => debug!(
                app = %registration.name,
                "Path '{}' does not match '{}'", request.path, registration.path
            ),
            MatchOutcome::Rejected(e @ HookError::AuthenticationMismatch(_)) => {
                warn!(app = %registration.name, "Webhook ignored: {}", e)
            }
            MatchOutcome::Rejected(e) => {
                error!(app = %registration.name, "Could not check webhook origin: {}", e)
            }
        }
        results.push((registration.clone(), outcome));
    }

    results
}

async fn evaluate(
    registration: &HookRegistration,
    processes: &dyn ProcessManager,
    request: &InboundRequest,
) -> MatchOutcome {
    if !registration.matches_path(&request.path) {
        return MatchOutcome::PathMismatch;
    }

    if registration.requires_signature()
        && !verify_hub_signature(&registration.secret, &request.body, request.signature())
    {
        return MatchOutcome::Rejected(HookError::AuthenticationMismatch(
            "signature does not match".to_string(),
        ));
    }

    let event = match PushEvent::from_body(&request.body) {
        Ok(event) => event,
        Err(e) => return MatchOutcome::Rejected(e),
    };
    info!(
        app = %registration.name,
        provider = ?event.provider,
        "Webhook received for branch '{}'", event.branch
    );

    let configured = match processes.describe(&registration.name).await {
        Ok(info) => info.branch,
        Err(e) => return MatchOutcome::Rejected(e),
    };
    let Some(configured) = configured else {
        return MatchOutcome::Rejected(HookError::ProcessManager(format!(
            "no versioning branch known for '{}'",
            registration.name
        )));
    };

    if !event.matches_branch(&configured) {
        return MatchOutcome::Rejected(HookError::AuthenticationMismatch(format!(
            "webhook for branch '{}' but application tracks '{}'",
            event.branch, configured
        )));
    }

    MatchOutcome::Accepted
}
