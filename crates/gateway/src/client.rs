//! Connected subscribers and outbound delivery.
//!
//! The hub is owned by the relay task, so plain maps suffice. Each subscriber's socket task
//! drains a bounded channel; deliveries never wait on it. A full queue (slow client) or a closed
//! one (client already gone) just drops the message.

use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use chrono::Utc;
use metrics::{counter, gauge};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique client identifier.
pub type ClientId = Uuid;

/// Default buffer size for client message channels.
/// Sized for ~1 second of high-frequency updates at 1000 msgs/sec.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// State for a single connected client.
pub struct ClientState {
    /// Unique client identifier.
    pub id: ClientId,
    /// Channel to send messages to the client's WebSocket.
    tx: mpsc::Sender<Message>,
    /// Timestamp when client connected (ms).
    pub connected_at: i64,
}

impl ClientState {
    pub fn new(id: ClientId, tx: mpsc::Sender<Message>) -> Self {
        Self {
            id,
            tx,
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a pre-serialized frame. Returns false if it was dropped.
    fn push(&self, json: &str, event: &'static str) -> bool {
        match self.tx.try_send(Message::Text(json.to_owned().into())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                counter!("gateway_dropped_messages_total", "reason" => "full", "event" => event)
                    .increment(1);
                debug!("Client {} queue full, dropping {}", self.id, event);
                false
            }
            Err(TrySendError::Closed(_)) => {
                counter!("gateway_dropped_messages_total", "reason" => "closed", "event" => event)
                    .increment(1);
                debug!("Client {} already closed, dropping {}", self.id, event);
                false
            }
        }
    }
}

/// Registry of connected clients.
#[derive(Default)]
pub struct DownstreamHub {
    clients: HashMap<ClientId, ClientState>,
}

impl DownstreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client. Returns false if the id is already registered.
    pub fn register(&mut self, id: ClientId, tx: mpsc::Sender<Message>) -> bool {
        if self.clients.contains_key(&id) {
            warn!("Client {} already registered", id);
            return false;
        }
        self.clients.insert(id, ClientState::new(id, tx));
        gauge!("gateway_active_connections").set(self.clients.len() as f64);
        info!("Client {} registered", id);
        true
    }

    /// Unregister a client. Safe to call for unknown or already removed clients.
    pub fn unregister(&mut self, id: &ClientId) -> bool {
        let Some(client) = self.clients.remove(id) else {
            return false;
        };
        gauge!("gateway_active_connections").set(self.clients.len() as f64);
        let connected_for = Utc::now().timestamp_millis() - client.connected_at;
        info!("Client {} unregistered after {}ms", id, connected_for);
        true
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Get the total number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Deliver to one client if it is still connected.
    pub fn deliver_to(&self, id: &ClientId, msg: &ServerMessage) -> bool {
        self.deliver_to_each(std::iter::once(id), msg) == 1
    }

    /// Deliver to each listed client that is still connected. Serializes once.
    /// Returns how many clients the message was queued for.
    pub fn deliver_to_each<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ClientId>,
        msg: &ServerMessage,
    ) -> usize {
        let mut targets = ids
            .into_iter()
            .filter_map(|id| self.clients.get(id))
            .filter(|client| client.is_open())
            .peekable();
        if targets.peek().is_none() {
            return 0;
        }

        let Some(json) = serialize(msg) else {
            return 0;
        };
        targets
            .filter(|client| client.push(&json, msg.event_name()))
            .count()
    }

    /// Deliver to every connected client.
    pub fn broadcast(&self, msg: &ServerMessage) -> usize {
        self.deliver_to_each(self.clients.keys(), msg)
    }
}

fn serialize(msg: &ServerMessage) -> Option<String> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Failed to serialize {} message: {}", msg.event_name(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn recv_all(rx: &mut mpsc::Receiver<Message>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            match msg {
                Message::Text(text) => out.push(serde_json::from_str(text.as_str()).unwrap()),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        out
    }

    #[test]
    fn test_deliver_to_registered_client() {
        let mut hub = DownstreamHub::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        assert!(hub.register(id, tx));

        assert!(hub.deliver_to(&id, &ServerMessage::Pong));
        assert_eq!(recv_all(&mut rx), vec![json!({"event": "pong"})]);
    }

    #[test]
    fn test_deliver_to_unknown_or_closed_client_is_dropped() {
        let mut hub = DownstreamHub::new();
        assert!(!hub.deliver_to(&Uuid::new_v4(), &ServerMessage::Pong));

        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(8);
        hub.register(id, tx);
        drop(rx);
        assert!(!hub.deliver_to(&id, &ServerMessage::Pong));
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let mut hub = DownstreamHub::new();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(1);
        hub.register(id, tx);

        assert!(hub.deliver_to(&id, &ServerMessage::Pong));
        assert!(!hub.deliver_to(&id, &ServerMessage::Pong));
        assert_eq!(recv_all(&mut rx).len(), 1);
    }

    #[test]
    fn test_broadcast_reaches_every_client() {
        let mut hub = DownstreamHub::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = mpsc::channel(8);
            hub.register(Uuid::new_v4(), tx);
            receivers.push(rx);
        }

        assert_eq!(hub.broadcast(&ServerMessage::Pong), 3);
        for rx in &mut receivers {
            assert_eq!(recv_all(rx).len(), 1);
        }
    }

    #[test]
    fn test_register_and_unregister_are_idempotent() {
        let mut hub = DownstreamHub::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);
        assert!(hub.register(id, tx.clone()));
        assert!(!hub.register(id, tx));
        assert_eq!(hub.client_count(), 1);

        assert!(hub.unregister(&id));
        assert!(!hub.unregister(&id));
        assert!(!hub.contains(&id));
    }
}
