//! Operation registry endpoints

use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::ApiState;
use crate::operations::{
    Operation, OperationFilter, OperationList, OperationRequest, OperationStats, OperationStatus,
    OperationType,
};

use super::client_id;

/// Query parameters for listing operations
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    op_type: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl ListQuery {
    fn into_filter(self) -> ApiResult<OperationFilter> {
        let status = self
            .status
            .map(|s| s.parse::<OperationStatus>())
            .transpose()
            .map_err(|s| ApiError::InvalidRequest(format!("unknown status: {s}")))?;

        let op_type = self
            .op_type
            .map(|t| t.parse::<OperationType>())
            .transpose()
            .map_err(|t| ApiError::InvalidRequest(format!("unknown operation type: {t}")))?;

        Ok(OperationFilter {
            status,
            op_type,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

/// POST /api/v1/operations
pub async fn start_operation(
    State(state): State<ApiState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Result<Json<OperationRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(request) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;

    let operation = state
        .agent
        .operations
        .start_operation(request, &client_id(connect_info))?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": operation.id,
            "type": operation.op_type,
            "status": operation.status,
            "description": operation.description,
            "cancellable": operation.cancellable,
            "started": operation.started,
        })),
    ))
}

/// GET /api/v1/operations?status=&type=&limit=&offset=
pub async fn list_operations(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<OperationList>> {
    let filter = query.into_filter()?;
    Ok(Json(state.agent.operations.list_operations(&filter)))
}

/// GET /api/v1/operations/:id
pub async fn get_operation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Operation>> {
    Ok(Json(state.agent.operations.get_operation(&id)?))
}

/// DELETE /api/v1/operations/:id
pub async fn cancel_operation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Operation>> {
    Ok(Json(state.agent.operations.cancel_operation(&id)?))
}

/// GET /api/v1/operations/stats
pub async fn get_stats(State(state): State<ApiState>) -> Json<OperationStats> {
    Json(state.agent.operations.get_stats())
}

/// GET /api/v1/operations/types
pub async fn list_types(State(state): State<ApiState>) -> Json<Value> {
    let types: Vec<Value> = state
        .agent
        .operations
        .executor_types()
        .into_iter()
        .map(|t| {
            json!({
                "type": t,
                "cancellable": t.is_cancellable(),
                "rate_class": t.rate_class(),
            })
        })
        .collect();

    Json(json!({ "types": types }))
}
