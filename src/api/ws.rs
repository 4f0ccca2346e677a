//! Subscription endpoint backing the broadcast hub (§4.7): a single duplex
//! WebSocket per project. Server -> client frames are one JSON [`Message`]
//! envelope per frame; client -> server carries only the keepalive pong.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use super::AppState;
use crate::broadcast::{self, Heartbeat};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, serde::Deserialize)]
pub struct SubscribeQuery {
    pub token: Option<String>,
}

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let project_id = id;
    if !broadcast::token_matches(state.token.as_deref(), query.token.as_deref()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, project_id))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, project_id: String) {
    let mut rx = state.orchestrator.hub.subscribe(&project_id);
    let mut heartbeat = Heartbeat::new();
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            received = rx.recv() => {
                let envelope = match received {
                    Ok(envelope) => envelope,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&envelope) else { continue };
                if socket.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if heartbeat.tick() {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                }
                if socket.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Pong(_))) => heartbeat.on_pong(),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
