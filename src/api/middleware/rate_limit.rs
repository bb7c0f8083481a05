//! Request-level rate limiting under the `general` class

use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::ratelimit::OperationClass;

/// Admit the request if its client address is within the general limit
///
/// Requests without connection info share one anonymous bucket.
pub async fn rate_limit_middleware(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string());

    let limiter = &state.agent.limiter;

    if !limiter.allow(&client, OperationClass::General) {
        debug!("request from {client} rejected by the general rate limit");
        return Err(ApiError::RateLimited {
            class: OperationClass::General,
            limit: limiter.get_limit(OperationClass::General),
        });
    }

    Ok(next.run(request).await)
}
