//! WebSocket handler for live endpoints
//!
//! Each connection becomes one subscriber of the [`ConnectionRegistry`]. The send
//! task drains the subscriber queue and pings on the heartbeat period; the
//! receive task marks the subscriber alive on every pong. Whichever side ends
//! first tears down the other, and the registry's close token ends both.
//!
//! [`ConnectionRegistry`]: crate::hub::ConnectionRegistry

use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, stream::StreamExt};
use tracing::{debug, info, warn};

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::hub::is_known_endpoint;

/// WebSocket upgrade handler
///
/// GET /api/v1/ws/*endpoint
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(endpoint): Path<String>,
    State(state): State<ApiState>,
) -> Result<Response, ApiError> {
    let endpoint = endpoint.trim_matches('/').to_string();

    if !is_known_endpoint(&endpoint) {
        return Err(ApiError::NotFound(format!("unknown live endpoint: {endpoint}")));
    }

    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, state, endpoint)))
}

/// Serve one subscriber until either side disconnects
async fn handle_websocket(socket: WebSocket, state: ApiState, endpoint: String) {
    let registry = state.agent.registry().clone();
    let subscription = registry.register(&endpoint);
    let id = subscription.id;
    let closed = subscription.closed.clone();
    let mut frames = subscription.frames;

    info!("live client {id} attached to {endpoint}");

    let (mut sender, mut receiver) = socket.split();
    let heartbeat = state.heartbeat();

    let mut send_task = tokio::spawn({
        let closed = closed.clone();
        async move {
            let mut ping = tokio::time::interval(heartbeat);
            ping.tick().await;

            loop {
                tokio::select! {
                    frame = frames.recv() => {
                        let Some(frame) = frame else { break };

                        let text = match serde_json::to_string(frame.as_ref()) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("failed to encode frame: {e}");
                                continue;
                            }
                        };

                        if sender.send(Message::Text(text)).await.is_err() {
                            debug!("WebSocket send failed, client disconnected");
                            break;
                        }
                    }

                    _ = ping.tick() => {
                        if sender.send(Message::Ping(vec![])).await.is_err() {
                            break;
                        }
                    }

                    _ = closed.cancelled() => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn({
        let registry = registry.clone();
        let endpoint = endpoint.clone();
        async move {
            while let Some(Ok(msg)) = receiver.next().await {
                match msg {
                    Message::Close(_) => break,
                    // any traffic proves liveness; pongs are the usual case
                    _ => registry.touch(&endpoint, id),
                }
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    registry.unregister(&endpoint, id);
    info!("live client {id} detached from {endpoint}");
}
