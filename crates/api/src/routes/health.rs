use axum::{extract::State, Json};
use paygate_billing::GatewayStatus;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /health/gateways
///
/// Read-only: never claims a half-open trial.
pub async fn gateway_status(State(state): State<AppState>) -> Json<GatewayStatus> {
    Json(state.resilience.gateways.status())
}
