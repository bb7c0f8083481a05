//! Rate limiter introspection

use std::collections::BTreeMap;

use axum::{Json, extract::State};

use crate::api::state::ApiState;
use crate::ratelimit::{OperationClass, RateLimit, RateLimiterStats};

/// GET /api/v1/rate-limits/stats
pub async fn get_stats(State(state): State<ApiState>) -> Json<RateLimiterStats> {
    Json(state.agent.limiter.stats())
}

/// GET /api/v1/rate-limits/config
pub async fn get_config(State(state): State<ApiState>) -> Json<BTreeMap<OperationClass, RateLimit>> {
    Json(state.agent.limiter.limits())
}
