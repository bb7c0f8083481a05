//! REST API and live WebSocket endpoints
//!
//! ## Endpoints
//!
//! - `GET /api/v1/health` - Health check
//! - `POST /api/v1/operations` - Submit an operation
//! - `GET /api/v1/operations` - List operations (`status`, `type`, `limit`, `offset`)
//! - `GET /api/v1/operations/stats` - Aggregate operation counts
//! - `GET /api/v1/operations/types` - Registered operation types
//! - `GET /api/v1/operations/{id}` - Operation snapshot
//! - `DELETE /api/v1/operations/{id}` - Request cancellation
//! - `GET /api/v1/rate-limits/stats` - Limiter counters
//! - `GET /api/v1/rate-limits/config` - Limits per class
//! - `GET /api/v1/alerts/history` - Recent alerts
//! - `GET /api/v1/alerts/thresholds` - Thresholds per sensor class
//! - `PUT /api/v1/alerts/thresholds/{class}` - Replace one class's thresholds
//! - `GET /api/v1/monitoring/intervals` - Adaptive interval state
//! - `POST /api/v1/monitoring/intervals/reset` - Reset adaptive state
//! - `GET /api/v1/monitoring/connections` - Live subscriber counts
//! - `WS /api/v1/ws/{endpoint}` - Live frames for one endpoint

#[cfg(feature = "api")]
pub mod error;
#[cfg(feature = "api")]
pub mod middleware;
#[cfg(feature = "api")]
pub mod routes;
#[cfg(feature = "api")]
pub mod state;
#[cfg(feature = "api")]
pub mod websocket;

pub use crate::config::ApiConfig;
#[cfg(feature = "api")]
pub use error::{ApiError, ApiResult};
#[cfg(feature = "api")]
pub use state::ApiState;

#[cfg(feature = "api")]
use axum::{
    Router,
    routing::{get, post, put},
};
#[cfg(feature = "api")]
use std::net::SocketAddr;
#[cfg(feature = "api")]
use tracing::info;

/// Build the router with all routes and layers
#[cfg(feature = "api")]
pub fn router(config: &ApiConfig, state: ApiState) -> Router {
    use tower_http::cors::{Any, CorsLayer};
    use tower_http::trace::TraceLayer;

    let mut app = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route(
            "/api/v1/operations",
            post(routes::operations::start_operation).get(routes::operations::list_operations),
        )
        .route("/api/v1/operations/stats", get(routes::operations::get_stats))
        .route("/api/v1/operations/types", get(routes::operations::list_types))
        .route(
            "/api/v1/operations/:id",
            get(routes::operations::get_operation).delete(routes::operations::cancel_operation),
        )
        .route("/api/v1/rate-limits/stats", get(routes::rate_limits::get_stats))
        .route("/api/v1/rate-limits/config", get(routes::rate_limits::get_config))
        .route("/api/v1/alerts/history", get(routes::alerts::get_history))
        .route("/api/v1/alerts/thresholds", get(routes::alerts::get_thresholds))
        .route("/api/v1/alerts/thresholds/:class", put(routes::alerts::set_threshold))
        .route("/api/v1/monitoring/intervals", get(routes::monitoring::get_intervals))
        .route(
            "/api/v1/monitoring/intervals/reset",
            post(routes::monitoring::reset_intervals),
        )
        .route(
            "/api/v1/monitoring/connections",
            get(routes::monitoring::get_connections),
        )
        .route("/api/v1/ws/*endpoint", get(websocket::websocket_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit_middleware,
        ))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    if let Some(token) = config.auth_token.clone() {
        app = app.layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    app
}

/// Spawn the API server
///
/// This starts an Axum HTTP server in a background task.
/// Returns the server's local address.
#[cfg(feature = "api")]
pub async fn spawn_api_server(config: ApiConfig, state: ApiState) -> anyhow::Result<SocketAddr> {
    info!("starting API server on {}", config.bind_addr);

    let app = router(&config, state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service).await {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok(addr)
}
