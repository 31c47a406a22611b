//! WebSocket protocol message types.
//!
//! Every frame in either direction is a JSON object `{"event": <name>, "data": <payload>}`.

use common::FeedStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Start receiving tickers for a symbol (e.g., "BTC-USD").
    Subscribe(String),
    /// Stop receiving tickers for a symbol.
    Unsubscribe(String),
    /// Ping message for keepalive.
    Ping,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Snapshot sent once when the client connects.
    ConnectionStatus(ConnectionStatus),
    /// Upstream ticker frame, passed through untouched.
    Ticker(Value),
    /// Upstream subscription acknowledgement, passed through untouched.
    SubscriptionConfirmed(Value),
    /// Upstream connectivity change, sent to every client.
    CoinbaseStatus(FeedStatus),
    /// Pong response to ping.
    Pong,
    /// Error processing a client frame.
    Error(ErrorData),
}

impl ServerMessage {
    /// The `event` name this message is sent under.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionStatus(_) => "connection-status",
            ServerMessage::Ticker(_) => "ticker",
            ServerMessage::SubscriptionConfirmed(_) => "subscription-confirmed",
            ServerMessage::CoinbaseStatus(_) => "coinbase-status",
            ServerMessage::Pong => "pong",
            ServerMessage::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub upstream_connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorData {
    pub message: String,
    pub code: String,
}
