//! Webhook ingress pipeline.
//!
//! Per request: rate limit by client address, gate the payload size, verify
//! the signature over the exact received bytes, validate structure, filter
//! for relevance, deduplicate against live work, then admit. Auto-labelled
//! issues are handed to an asynchronous worker; everything else is queued
//! for manual execution.
//!
//! The live-set entry for an admitted issue is inserted before the HTTP
//! response is produced, so a second webhook racing the worker start is
//! still rejected. After admission the tracker always gets `202`; internal
//! failures are logged, never bounced back into the tracker's retry queue.

use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use autodev_core::poller::IssueProcessor;
use autodev_core::{Clock, CorrelationId, IssueDescriptor, IssueId, SessionManager};

use crate::ratelimit::{RateLimitDecision, SlidingWindowLimiter};
use crate::signature::SignatureVerifier;

/// Payloads above this size are rejected with `413`.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

// ============================================================================
// Outcome
// ============================================================================

/// What the pipeline decided for one request; the HTTP layer maps each
/// variant to a status and body.
#[derive(Debug)]
pub enum IngressOutcome {
    RateLimited { retry_after: Duration },
    PayloadTooLarge,
    InvalidSignature,
    InvalidPayload { message: String },
    Ignored { reason: String },
    Skipped { reason: String },
    QueuedForManual { request_id: String },
    AcceptedAuto { request_id: String },
}

// ============================================================================
// Wire payload
// ============================================================================

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    action: Option<String>,

    #[serde(default)]
    data: Option<WebhookData>,

    #[serde(default, rename = "updatedFrom")]
    updated_from: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    #[serde(default)]
    id: Option<String>,

    #[serde(default)]
    identifier: Option<String>,

    #[serde(default)]
    title: Option<String>,

    #[serde(default)]
    description: Option<String>,

    #[serde(default)]
    labels: Vec<NamedRef>,

    #[serde(default)]
    project: Option<NamedRef>,

    #[serde(default)]
    team: Option<NamedRef>,

    #[serde(default)]
    state: Option<NamedRef>,

    #[serde(default)]
    delegate: Option<NamedRef>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    #[serde(default)]
    name: Option<String>,
}

// ============================================================================
// Pipeline
// ============================================================================

/// The webhook admission pipeline.
pub struct IngressPipeline {
    limiter: SlidingWindowLimiter,
    verifier: Option<SignatureVerifier>,
    sessions: Arc<SessionManager>,
    processor: Arc<dyn IssueProcessor>,
    live: Arc<Mutex<HashSet<IssueId>>>,
    agent_name: String,
}

impl IngressPipeline {
    pub fn new(
        clock: Arc<dyn Clock>,
        webhook_secret: Option<String>,
        sessions: Arc<SessionManager>,
        processor: Arc<dyn IssueProcessor>,
        agent_name: String,
    ) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(clock),
            verifier: webhook_secret.map(SignatureVerifier::new),
            sessions,
            processor,
            live: Arc::new(Mutex::new(HashSet::new())),
            agent_name,
        }
    }

    /// Run the pipeline for one request.
    ///
    /// `signed` is false only for the loopback test route.
    pub async fn handle(
        &self,
        client: IpAddr,
        signature: Option<&str>,
        body: &[u8],
        signed: bool,
    ) -> IngressOutcome {
        if let RateLimitDecision::Limited { retry_after } = self.limiter.check(client).await {
            return IngressOutcome::RateLimited { retry_after };
        }

        if body.len() > MAX_BODY_BYTES {
            return IngressOutcome::PayloadTooLarge;
        }

        if signed {
            let verified = match (&self.verifier, signature) {
                (Some(verifier), Some(signature)) => verifier.verify(body, signature).is_ok(),
                _ => false,
            };
            if !verified {
                return IngressOutcome::InvalidSignature;
            }
        }

        let payload: WebhookPayload = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                return IngressOutcome::InvalidPayload {
                    message: format!("payload is not valid JSON: {e}"),
                };
            }
        };

        let descriptor = match self.validate(&payload) {
            Ok(descriptor) => descriptor,
            Err(message) => return IngressOutcome::InvalidPayload { message },
        };

        if let Some(reason) = self.irrelevance_reason(&payload) {
            debug!(issue = %descriptor.identifier, reason, "webhook ignored");
            return IngressOutcome::Ignored { reason };
        }

        // Deduplication consults both the in-process live set and the
        // persisted session file.
        let issue_id = descriptor.identifier.clone();
        if self.live.lock().await.contains(&issue_id)
            || self.sessions.has_live_session(&issue_id).await
        {
            info!(issue = %issue_id, "webhook skipped, issue already has an active session");
            return IngressOutcome::Skipped {
                reason: "already has active session".to_string(),
            };
        }

        let request_id = CorrelationId::new().to_string();

        if !descriptor.has_label("auto") {
            info!(issue = %issue_id, request_id, "issue queued for manual execution");
            return IngressOutcome::QueuedForManual { request_id };
        }

        // Reserve before responding so a racing duplicate is rejected.
        self.live.lock().await.insert(issue_id.clone());

        let processor = Arc::clone(&self.processor);
        let live = Arc::clone(&self.live);
        info!(issue = %issue_id, request_id, "issue accepted for auto execution");
        tokio::spawn(async move {
            if let Err(e) = processor.process_issue(&descriptor).await {
                error!(issue = %issue_id, error = %e, "asynchronous execution failed");
            }
            live.lock().await.remove(&issue_id);
        });

        IngressOutcome::AcceptedAuto { request_id }
    }

    /// Issues currently reserved by ingress workers.
    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    fn validate(&self, payload: &WebhookPayload) -> Result<IssueDescriptor, String> {
        if payload.action.as_deref().unwrap_or_default().is_empty() {
            return Err("missing required field: action".to_string());
        }

        let data = payload
            .data
            .as_ref()
            .ok_or_else(|| "missing required field: data".to_string())?;

        let identifier = data
            .identifier
            .as_deref()
            .ok_or_else(|| "missing required field: data.identifier".to_string())?;
        let identifier = IssueId::new(identifier)
            .map_err(|e| format!("invalid data.identifier: {e}"))?;

        let title = data
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| "missing required field: data.title".to_string())?;

        Ok(IssueDescriptor {
            id: data.id.clone().unwrap_or_else(|| identifier.to_string()),
            identifier,
            title,
            description: data.description.clone(),
            labels: data
                .labels
                .iter()
                .filter_map(|l| l.name.clone())
                .collect(),
            project: data.project.as_ref().and_then(|p| p.name.clone()),
            team: data.team.as_ref().and_then(|t| t.name.clone()),
            state: data.state.as_ref().and_then(|s| s.name.clone()),
        })
    }

    /// Relevance filter: create events, delegate-changes addressed to this
    /// agent, and label changes pass; everything else (notably our own
    /// state updates echoing back) is dropped.
    fn irrelevance_reason(&self, payload: &WebhookPayload) -> Option<String> {
        let action = payload.action.as_deref().unwrap_or_default();
        match action {
            "create" => None,
            "update" => {
                let delegate_matches = payload
                    .data
                    .as_ref()
                    .and_then(|d| d.delegate.as_ref())
                    .and_then(|d| d.name.as_deref())
                    .is_some_and(|name| name.eq_ignore_ascii_case(&self.agent_name));
                if delegate_matches {
                    return None;
                }

                let changed_labels = payload
                    .updated_from
                    .as_ref()
                    .and_then(|v| v.as_object())
                    .is_some_and(|map| {
                        map.contains_key("labels") || map.contains_key("labelIds")
                    });
                if changed_labels {
                    return None;
                }

                Some("update is not a delegate or label change".to_string())
            }
            other => Some(format!("action '{other}' is not processed")),
        }
    }
}

#[cfg(test)]
#[path = "ingress_tests.rs"]
mod tests;
