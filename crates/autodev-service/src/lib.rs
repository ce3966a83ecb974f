//! # Autodev HTTP Service
//!
//! HTTP ingress for the Autodev coding-agent orchestrator.
//!
//! This service provides:
//! - Signature-verified webhook endpoint with deduplication and admission
//! - A loopback test endpoint that bypasses signature verification
//! - Liveness and detailed health endpoints
//!
//! The webhook handler consumes the body as raw bytes so signatures are
//! verified over exactly what was received; nothing is re-serialized
//! before verification.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::instrument;

use autodev_core::{
    CircuitState, Clock, ProviderRouter, SessionManager, Timestamp, WorktreeManager,
};

pub mod config;
pub mod ingress;
pub mod ratelimit;
pub mod signature;

use ingress::{IngressOutcome, IngressPipeline};

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngressPipeline>,
    pub router: Arc<ProviderRouter>,
    pub sessions: Arc<SessionManager>,
    pub worktrees: Arc<WorktreeManager>,
    pub clock: Arc<dyn Clock>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/:tracker", post(handle_webhook))
        .route("/webhooks/test", post(handle_webhook_test))
        .route("/health", get(handle_health))
        .route("/health/detailed", get(handle_health_detailed))
        .route("/health/providers", get(handle_health_providers))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
        .with_state(state)
}

// ============================================================================
// Webhook Handlers
// ============================================================================

/// Signature-verified tracker webhook.
#[instrument(skip_all)]
async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let outcome = state
        .pipeline
        .handle(client_addr(&headers), signature.as_deref(), &body, true)
        .await;

    outcome_response(outcome)
}

/// Unsigned loopback variant of the webhook endpoint.
#[instrument(skip_all)]
async fn handle_webhook_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let outcome = state
        .pipeline
        .handle(client_addr(&headers), None, &body, false)
        .await;

    outcome_response(outcome)
}

/// Best-effort client address: proxies set `x-forwarded-for`, otherwise
/// the loopback placeholder is used.
fn client_addr(headers: &HeaderMap) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
}

fn outcome_response(outcome: IngressOutcome) -> Response {
    match outcome {
        IngressOutcome::RateLimited { retry_after } => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(MessageResponse {
                    message: "rate limit exceeded".to_string(),
                }),
            )
                .into_response();
            if let Ok(value) = retry_after.as_secs().to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
        IngressOutcome::PayloadTooLarge => (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(MessageResponse {
                message: "payload exceeds 10 MiB".to_string(),
            }),
        )
            .into_response(),
        IngressOutcome::InvalidSignature => (
            StatusCode::UNAUTHORIZED,
            Json(MessageResponse {
                message: "Invalid signature".to_string(),
            }),
        )
            .into_response(),
        IngressOutcome::InvalidPayload { message } => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse {
                message,
                status: "rejected".to_string(),
                request_id: None,
                validation_error: Some(true),
            }),
        )
            .into_response(),
        IngressOutcome::Ignored { reason } => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse {
                message: reason,
                status: "ignored".to_string(),
                request_id: None,
                validation_error: None,
            }),
        )
            .into_response(),
        IngressOutcome::Skipped { reason } => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse {
                message: reason,
                status: "skipped".to_string(),
                request_id: None,
                validation_error: None,
            }),
        )
            .into_response(),
        IngressOutcome::QueuedForManual { request_id } => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse {
                message: "queued for manual execution".to_string(),
                status: "queued".to_string(),
                request_id: Some(request_id),
                validation_error: None,
            }),
        )
            .into_response(),
        IngressOutcome::AcceptedAuto { request_id } => (
            StatusCode::ACCEPTED,
            Json(WebhookResponse {
                message: "accepted for auto execution".to_string(),
                status: "accepted".to_string(),
                request_id: Some(request_id),
                validation_error: None,
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Health Handlers
// ============================================================================

/// Lightweight liveness.
async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: state.clock.now(),
    })
}

/// Aggregate health; `503` when any provider is unhealthy.
#[instrument(skip_all)]
async fn handle_health_detailed(State(state): State<AppState>) -> Response {
    state.router.ensure_fresh_health().await;
    let health = state.router.health_snapshot().await;
    let breakers = state.router.breakers().snapshot().await;

    let mut providers = BTreeMap::new();
    let mut all_healthy = true;
    for (kind, entry) in &health {
        let breaker_state = breakers
            .get(kind)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed);
        let status = if !entry.healthy {
            all_healthy = false;
            "unhealthy"
        } else if breaker_state != CircuitState::Closed {
            "degraded"
        } else {
            "healthy"
        };
        providers.insert(kind.as_str().to_string(), status.to_string());
    }

    let active = state.pipeline.live_count().await + state.sessions.live_count().await;
    let total = state.worktrees.list_active().await.len();

    let body = DetailedHealthResponse {
        status: if all_healthy { "ok" } else { "degraded" }.to_string(),
        components: HealthComponents {
            webhook: "ok".to_string(),
            providers,
            worktrees: WorktreeStats { active, total },
        },
        timestamp: state.clock.now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// Per-provider health and breaker detail.
#[instrument(skip_all)]
async fn handle_health_providers(State(state): State<AppState>) -> Json<Vec<ProviderStatus>> {
    state.router.ensure_fresh_health().await;
    let health = state.router.health_snapshot().await;
    let breakers = state.router.breakers().snapshot().await;

    let mut statuses: Vec<ProviderStatus> = health
        .into_iter()
        .map(|(kind, entry)| ProviderStatus {
            name: kind.as_str().to_string(),
            healthy: entry.healthy,
            circuit_breaker_state: breakers
                .get(&kind)
                .map(|r| r.state)
                .unwrap_or(CircuitState::Closed)
                .as_str()
                .to_string(),
            last_check: entry.last_check,
            consecutive_errors: entry.consecutive_errors,
            last_error: entry.last_error,
            latency_ms: entry.latency_ms,
        })
        .collect();
    statuses.sort_by(|a, b| a.name.cmp(&b.name));

    Json(statuses)
}

// ============================================================================
// Response Types
// ============================================================================

/// Minimal message body for error statuses.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Webhook acceptance response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub message: String,
    pub status: String,

    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(rename = "validationError", skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<bool>,
}

/// Liveness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: Timestamp,
}

/// Detailed health response.
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub components: HealthComponents,
    pub timestamp: Timestamp,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct HealthComponents {
    pub webhook: String,
    pub providers: BTreeMap<String, String>,
    pub worktrees: WorktreeStats,
}

#[derive(Debug, Serialize)]
pub struct WorktreeStats {
    pub active: usize,
    pub total: usize,
}

/// Per-provider health record.
#[derive(Debug, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub healthy: bool,

    #[serde(rename = "circuitBreakerState")]
    pub circuit_breaker_state: String,

    #[serde(rename = "lastCheck")]
    pub last_check: Timestamp,

    #[serde(rename = "consecutiveErrors")]
    pub consecutive_errors: u32,

    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(rename = "latency", skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
