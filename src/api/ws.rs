// =============================================================================
// WebSocket Handler — typed event stream for dashboards
// =============================================================================
//
// Clients connect to `/api/v1/ws?token=<token>` and receive:
//   1. An immediate `status_update` frame on connect.
//   2. Typed events (`metrics_update`, `status_update`, `positions_update`,
//      `finviz_strategy_changed`, `order_status_change`) as they are
//      published by the pipeline and admin surface.
//
// A single broadcaster task watches the state version and pushes fresh
// metrics/status frames at most every 500 ms; the per-connection handler
// only forwards the broadcast channel and answers Ping frames.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::auth::validate_token;
use crate::app_state::{AppState, WsEvent};

// =============================================================================
// Broadcaster task
// =============================================================================

/// Push `metrics_update` + `status_update` frames whenever the state version
/// changed since the last check. Spawned once at startup.
pub async fn run_event_broadcaster(state: Arc<AppState>) {
    let mut last_version = 0u64;
    let mut push_interval = interval(Duration::from_millis(500));

    loop {
        push_interval.tick().await;
        let version = state.current_state_version();
        if version == last_version {
            continue;
        }
        last_version = version;
        // Sent directly on the channel: `publish` would bump the version and
        // re-trigger this loop forever.
        let _ = state
            .events
            .send(WsEvent::MetricsUpdate(state.metrics.snapshot()));
        let _ = state.events.send(WsEvent::StatusUpdate(state.status_payload()));
    }
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Axum handler for the WebSocket upgrade request.
///
/// Validates the token from the `?token=` query parameter before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("WebSocket connection rejected: invalid token");
        return (
            axum::http::StatusCode::FORBIDDEN,
            "Invalid or missing token",
        )
            .into_response();
    }

    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

/// Manages a single WebSocket connection lifecycle: forward published events,
/// answer Ping frames, disconnect cleanly.
async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.subscribe();

    // Immediate status frame so the client renders without waiting.
    let initial = WsEvent::StatusUpdate(state.status_payload());
    if send_event(&mut sender, &initial).await.is_err() {
        warn!("failed to send initial WebSocket frame");
        return;
    }

    loop {
        tokio::select! {
            // ── Event forwarding ────────────────────────────────────────
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            debug!("WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagged — events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // ── Client messages ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Treat any text message as a heartbeat.
                        debug!(msg = %text, "WebSocket text message received (heartbeat)");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Serialize and send one event.
async fn send_event<S>(sender: &mut S, event: &WsEvent) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "failed to serialize WebSocket event");
            Ok(())
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
