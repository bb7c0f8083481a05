//! Adaptive interval and live connection introspection

use axum::{Json, extract::State};

use crate::adaptive::AdaptiveStats;
use crate::api::state::ApiState;
use crate::hub::ConnectionStats;

/// GET /api/v1/monitoring/intervals
pub async fn get_intervals(State(state): State<ApiState>) -> Json<AdaptiveStats> {
    Json(state.agent.controller.stats())
}

/// POST /api/v1/monitoring/intervals/reset
pub async fn reset_intervals(State(state): State<ApiState>) -> Json<AdaptiveStats> {
    state.agent.controller.reset_to_defaults();
    Json(state.agent.controller.stats())
}

/// GET /api/v1/monitoring/connections
pub async fn get_connections(State(state): State<ApiState>) -> Json<ConnectionStats> {
    Json(state.agent.registry().stats())
}
