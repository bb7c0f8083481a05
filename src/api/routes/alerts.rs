//! Alert history and threshold endpoints

use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::alerts::{AlertThreshold, SensorClass};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::ApiState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

/// GET /api/v1/alerts/history?limit=
pub async fn get_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let alerts = state.agent.alerts.history(query.limit);

    Json(json!({
        "count": alerts.len(),
        "alerts": alerts,
    }))
}

/// GET /api/v1/alerts/thresholds
pub async fn get_thresholds(
    State(state): State<ApiState>,
) -> Json<BTreeMap<SensorClass, AlertThreshold>> {
    Json(state.agent.alerts.thresholds())
}

/// PUT /api/v1/alerts/thresholds/:class
pub async fn set_threshold(
    State(state): State<ApiState>,
    Path(class): Path<String>,
    body: Result<Json<AlertThreshold>, JsonRejection>,
) -> ApiResult<Json<AlertThreshold>> {
    let class: SensorClass = class.parse().map_err(ApiError::NotFound)?;
    let Json(threshold) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;

    state.agent.alerts.set_threshold(class, threshold)?;

    Ok(Json(threshold))
}
