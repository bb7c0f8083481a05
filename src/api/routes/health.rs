//! Health check endpoint

use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::api::state::ApiState;

/// GET /api/v1/health
pub async fn health_check(State(state): State<ApiState>) -> Json<Value> {
    let agent = &state.agent;

    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_operations": agent.operations.get_stats().active,
        "connections": agent.registry().stats().total_active,
    }))
}
