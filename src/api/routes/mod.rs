pub mod alerts;
pub mod health;
pub mod monitoring;
pub mod operations;
pub mod rate_limits;

use std::net::SocketAddr;

use axum::extract::ConnectInfo;

/// Client identity used for rate limiting and `created_by`
pub(crate) fn client_id(connect_info: Option<ConnectInfo<SocketAddr>>) -> String {
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}
