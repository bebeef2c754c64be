//! Webhook ingress and operator endpoints for escalated events

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use paygate_billing::webhooks::{
    PendingRetry, PipelineStats, WebhookReplayResult, SIGNATURE_HEADER,
};
use paygate_billing::{EscalationNotice, WebhookOutcome};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub outcome: WebhookOutcome,
}

/// POST /webhooks/{provider}
///
/// The body is verified byte-for-byte, so it is taken as raw `Bytes` rather than `Json`.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!(provider = %provider, "Webhook received without signature header");
            ApiError::MissingHeader(SIGNATURE_HEADER)
        })?;

    let outcome = state
        .resilience
        .webhooks
        .ingest(&provider, &body, signature)
        .await
        .map_err(|e| {
            if e.is_verification_failure() {
                tracing::warn!(provider = %provider, error = %e, "Webhook rejected");
            }
            ApiError::from(e)
        })?;

    Ok(Json(WebhookResponse { outcome }))
}

/// GET /health/webhooks
pub async fn webhook_stats(State(state): State<AppState>) -> Json<PipelineStats> {
    Json(state.resilience.webhooks.stats())
}

/// GET /admin/webhooks/escalated
pub async fn list_escalated(State(state): State<AppState>) -> Json<Vec<EscalationNotice>> {
    Json(state.resilience.webhooks.escalated())
}

/// GET /admin/webhooks/retries
pub async fn list_pending_retries(State(state): State<AppState>) -> Json<Vec<PendingRetry>> {
    Json(state.resilience.webhooks.pending_retries())
}

/// POST /admin/webhooks/escalated/{provider}/{event_id}/replay
pub async fn replay_escalated(
    State(state): State<AppState>,
    Path((provider, event_id)): Path<(String, String)>,
) -> ApiResult<Json<WebhookReplayResult>> {
    tracing::info!(
        provider = %provider,
        event_id = %event_id,
        "Operator replaying escalated webhook"
    );
    let result = state
        .resilience
        .webhooks
        .replay_escalated(&provider, &event_id)
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct ReplayAllQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ReplayAllResponse {
    pub replayed: usize,
    pub succeeded: usize,
    pub results: Vec<WebhookReplayResult>,
}

/// POST /admin/webhooks/escalated/replay?limit=N
pub async fn replay_all_escalated(
    State(state): State<AppState>,
    Query(query): Query<ReplayAllQuery>,
) -> Json<ReplayAllResponse> {
    let results = state
        .resilience
        .webhooks
        .replay_all_escalated(query.limit)
        .await;
    let succeeded = results.iter().filter(|r| r.success).count();

    tracing::info!(
        replayed = results.len(),
        succeeded = succeeded,
        "Bulk replay of escalated webhooks completed"
    );

    Json(ReplayAllResponse {
        replayed: results.len(),
        succeeded,
        results,
    })
}

/// POST /admin/webhooks/{provider}/{event_id}/reset
pub async fn reset_stuck(
    State(state): State<AppState>,
    Path((provider, event_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.resilience.webhooks.reset_stuck(&provider, &event_id)?;
    Ok(StatusCode::NO_CONTENT)
}
