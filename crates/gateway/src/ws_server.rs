//! WebSocket server handler using Axum.
//!
//! Each socket gets a bounded outbound queue drained by a writer task. Inbound frames become
//! [`RelayRequest`]s; the relay answers through the queue.

use crate::client::{ClientId, CLIENT_CHANNEL_BUFFER_SIZE};
use crate::error::{GatewayError, Result};
use crate::protocol::{ClientMessage, ErrorData, ServerMessage};
use crate::relay::{RelayRequest, RequestTx};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    pub requests: RequestTx,
    pub ping_interval: Duration,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state.requests.send(RelayRequest::Stats(reply_tx)).is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable"})),
        );
    }
    match reply_rx.await {
        Ok(stats) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "clients": stats.clients,
                "symbols": stats.symbols,
                "upstreamConnected": stats.upstream_connected,
            })),
        ),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unavailable"})),
        ),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_CHANNEL_BUFFER_SIZE);
    let client_id: ClientId = Uuid::new_v4();

    if state
        .requests
        .send(RelayRequest::Connect {
            client_id,
            tx: tx.clone(),
        })
        .is_err()
    {
        warn!("Relay unavailable, refusing client {}", client_id);
        let _ = ws_tx.close().await;
        return;
    }

    counter!("gateway_connections_total").increment(1);
    info!("Client {} connected", client_id);

    // Forward queued messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(state.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let reason = loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break "client closed".to_string(),
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, client_id, &tx, msg) {
                            match e {
                                GatewayError::RelayUnavailable => break e.to_string(),
                                e => {
                                    warn!("Error handling message from {}: {}", client_id, e);
                                    send_error(&tx, &e);
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", client_id, e);
                        break format!("transport error: {}", e);
                    }
                }
            }

            _ = ping_interval.tick() => {
                if tx.try_send(Message::Ping(Vec::new().into())).is_err() && tx.is_closed() {
                    break "send queue closed".to_string();
                }
            }
        }
    };

    let _ = state.requests.send(RelayRequest::Disconnect {
        client_id,
        reason: reason.clone(),
    });
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    info!("Client {} disconnected: {}", client_id, reason);
}

/// Handle a single WebSocket message.
fn handle_message(
    state: &AppState,
    client_id: ClientId,
    tx: &mpsc::Sender<Message>,
    msg: Message,
) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = serde_json::from_str(text.as_str())?;
            handle_client_message(state, client_id, tx, client_msg)
        }
        Message::Binary(data) => {
            let client_msg: ClientMessage = serde_json::from_slice(&data)?;
            handle_client_message(state, client_id, tx, client_msg)
        }
        Message::Ping(data) => tx
            .try_send(Message::Pong(data))
            .map_err(|_| GatewayError::ChannelSend),
        Message::Pong(_) | Message::Close(_) => Ok(()),
    }
}

/// Handle a parsed client message.
fn handle_client_message(
    state: &AppState,
    client_id: ClientId,
    tx: &mpsc::Sender<Message>,
    msg: ClientMessage,
) -> Result<()> {
    let request = match msg {
        ClientMessage::Subscribe(symbol) => {
            debug!("Client {} subscribing to {}", client_id, symbol);
            RelayRequest::Subscribe { client_id, symbol }
        }
        ClientMessage::Unsubscribe(symbol) => {
            debug!("Client {} unsubscribing from {}", client_id, symbol);
            RelayRequest::Unsubscribe { client_id, symbol }
        }
        ClientMessage::Ping => return send_direct(tx, &ServerMessage::Pong),
    };
    state.requests.send(request)
}

/// Queue a message produced by the socket task itself rather than the relay.
fn send_direct(tx: &mpsc::Sender<Message>, msg: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    tx.try_send(Message::Text(json.into()))
        .map_err(|_| GatewayError::ChannelSend)
}

fn send_error(tx: &mpsc::Sender<Message>, error: &GatewayError) {
    let msg = ServerMessage::Error(ErrorData {
        message: error.to_string(),
        code: error.code().to_string(),
    });
    if send_direct(tx, &msg).is_err() {
        debug!("Dropping error frame for a full or closed queue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayEvent, RelayStats};
    use serde_json::Value;

    fn state() -> (AppState, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let state = AppState {
            requests: RequestTx::new(events_tx),
            ping_interval: Duration::from_secs(30),
        };
        (state, events)
    }

    fn text(json: &str) -> Message {
        Message::Text(json.to_string().into())
    }

    fn next_frame(rx: &mut mpsc::Receiver<Message>) -> Value {
        match rx.try_recv() {
            Ok(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_frames_become_relay_requests() {
        let (state, mut requests) = state();
        let (tx, _rx) = mpsc::channel(8);
        let id = Uuid::new_v4();

        handle_message(&state, id, &tx, text(r#"{"event":"subscribe","data":"BTC-USD"}"#))
            .unwrap();
        handle_message(&state, id, &tx, text(r#"{"event":"unsubscribe","data":"BTC-USD"}"#))
            .unwrap();

        match requests.try_recv().unwrap() {
            RelayEvent::Request(RelayRequest::Subscribe { client_id, symbol }) => {
                assert_eq!(client_id, id);
                assert_eq!(symbol, "BTC-USD");
            }
            other => panic!("expected subscribe, got {:?}", other),
        }
        assert!(matches!(
            requests.try_recv().unwrap(),
            RelayEvent::Request(RelayRequest::Unsubscribe { .. })
        ));
    }

    #[test]
    fn test_ping_is_answered_locally() {
        let (state, mut requests) = state();
        let (tx, mut rx) = mpsc::channel(8);

        handle_message(&state, Uuid::new_v4(), &tx, text(r#"{"event":"ping"}"#)).unwrap();
        assert_eq!(next_frame(&mut rx), json!({"event": "pong"}));
        assert!(requests.try_recv().is_err());
    }

    #[test]
    fn test_invalid_frame_produces_error_event() {
        let (state, _requests) = state();
        let (tx, mut rx) = mpsc::channel(8);

        let err = handle_message(&state, Uuid::new_v4(), &tx, text("{not json")).unwrap_err();
        assert_eq!(err.code(), "INVALID_MESSAGE");

        send_error(&tx, &err);
        let frame = next_frame(&mut rx);
        assert_eq!(frame["event"], "error");
        assert_eq!(frame["data"]["code"], "INVALID_MESSAGE");
    }

    #[test]
    fn test_relay_gone_is_reported() {
        let (state, requests) = state();
        drop(requests);
        let (tx, _rx) = mpsc::channel(8);

        let err = handle_message(
            &state,
            Uuid::new_v4(),
            &tx,
            text(r#"{"event":"subscribe","data":"BTC-USD"}"#),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::RelayUnavailable));
    }

    #[tokio::test]
    async fn test_health_reports_relay_stats() {
        let (state, mut requests) = state();
        let relay = tokio::spawn(async move {
            if let Some(RelayEvent::Request(RelayRequest::Stats(reply))) = requests.recv().await {
                let _ = reply.send(RelayStats {
                    clients: 2,
                    symbols: 1,
                    upstream_connected: true,
                });
            }
        });

        let response = health_handler(State(Arc::new(state))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        relay.await.unwrap();
    }
}
