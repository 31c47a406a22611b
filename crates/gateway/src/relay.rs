//! Relay: subscriber requests in, upstream events out.
//!
//! One task owns the [`SubscriptionRegistry`], the [`DownstreamHub`] and the
//! [`UpstreamConnection`]. Socket tasks send [`RelayRequest`]s; the upstream's transport tasks and
//! reconnect timers send [`UpstreamSignal`]s. Both land in one [`RelayEvent`] queue, so inputs are
//! applied in arrival order, each to completion before the next is read, and nothing here is
//! locked.

use crate::client::{ClientId, DownstreamHub};
use crate::error::{GatewayError, Result};
use crate::protocol::{ConnectionStatus, ServerMessage};
use crate::subscription::SubscriptionRegistry;
use axum::extract::ws::Message;
use common::{
    Connector, FeedHandler, FeedStatus, SignalTx, UpstreamConfig, UpstreamConnection, UpstreamEvent,
    UpstreamSignal,
};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Requests from subscriber sockets (and the health endpoint) to the relay task.
#[derive(Debug)]
pub enum RelayRequest {
    /// A subscriber socket was accepted; `tx` feeds its outbound queue.
    Connect {
        client_id: ClientId,
        tx: mpsc::Sender<Message>,
    },
    Subscribe {
        client_id: ClientId,
        symbol: String,
    },
    Unsubscribe {
        client_id: ClientId,
        symbol: String,
    },
    /// The subscriber socket is gone, for whatever reason.
    Disconnect {
        client_id: ClientId,
        reason: String,
    },
    /// Snapshot of relay counters.
    Stats(oneshot::Sender<RelayStats>),
}

/// One input to the relay task.
#[derive(Debug)]
pub enum RelayEvent {
    Request(RelayRequest),
    Upstream(UpstreamSignal),
}

impl From<RelayRequest> for RelayEvent {
    fn from(request: RelayRequest) -> Self {
        Self::Request(request)
    }
}

impl From<UpstreamSignal> for RelayEvent {
    fn from(signal: UpstreamSignal) -> Self {
        Self::Upstream(signal)
    }
}

/// Handle subscriber sockets use to reach the relay task.
#[derive(Debug, Clone)]
pub struct RequestTx {
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RequestTx {
    pub(crate) fn new(events: mpsc::UnboundedSender<RelayEvent>) -> Self {
        Self { events }
    }

    pub fn send(&self, request: RelayRequest) -> Result<()> {
        self.events
            .send(RelayEvent::Request(request))
            .map_err(|_| GatewayError::RelayUnavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub clients: usize,
    pub symbols: usize,
    pub upstream_connected: bool,
}

/// Relay policy knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Re-send one subscribe for every registered symbol whenever the upstream (re)connects.
    pub resubscribe_on_reconnect: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            resubscribe_on_reconnect: true,
        }
    }
}

pub struct Relay<H, C> {
    registry: SubscriptionRegistry,
    hub: DownstreamHub,
    upstream: UpstreamConnection<H, C>,
    config: RelayConfig,
}

impl<H: FeedHandler, C: Connector> Relay<H, C> {
    /// Build a relay around a disconnected upstream.
    ///
    /// Returns the request handle for subscriber sockets and the event queue that must be passed
    /// to [`Relay::run`].
    pub fn new(
        handler: H,
        connector: C,
        upstream_config: UpstreamConfig,
        config: RelayConfig,
    ) -> (Self, RequestTx, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let upstream = UpstreamConnection::new(
            handler,
            connector,
            upstream_config,
            SignalTx::new(events_tx.clone()),
        );
        let relay = Self {
            registry: SubscriptionRegistry::new(),
            hub: DownstreamHub::new(),
            upstream,
            config,
        };
        (relay, RequestTx::new(events_tx), events)
    }

    /// Open the upstream connection.
    pub fn start(&mut self) {
        self.upstream.connect();
    }

    pub fn handle_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Request(request) => self.handle_request(request),
            RelayEvent::Upstream(signal) => self.handle_signal(signal),
        }
    }

    pub fn handle_request(&mut self, request: RelayRequest) {
        match request {
            RelayRequest::Connect { client_id, tx } => self.on_subscriber_connect(client_id, tx),
            RelayRequest::Subscribe { client_id, symbol } => {
                self.on_subscribe_request(client_id, &symbol)
            }
            RelayRequest::Unsubscribe { client_id, symbol } => {
                self.on_unsubscribe_request(client_id, &symbol)
            }
            RelayRequest::Disconnect { client_id, reason } => {
                self.on_subscriber_disconnect(client_id, &reason)
            }
            RelayRequest::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    pub fn handle_signal(&mut self, signal: UpstreamSignal) {
        if let Some(event) = self.upstream.handle(signal) {
            self.on_upstream_event(event);
        }
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            clients: self.hub.client_count(),
            symbols: self.registry.symbol_count(),
            upstream_connected: self.upstream.is_connected(),
        }
    }

    /// Drive the relay until `shutdown_rx` fires, then shut the upstream down.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<RelayEvent>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("Relay running");
        self.start();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Relay received shutdown signal");
                    break;
                }

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Relay event queue closed");
                        break;
                    }
                }
            }
        }

        self.upstream.shutdown();
        info!("Relay stopped");
    }

    fn on_subscriber_connect(&mut self, client_id: ClientId, tx: mpsc::Sender<Message>) {
        if !self.hub.register(client_id, tx) {
            return;
        }
        let status = ServerMessage::ConnectionStatus(ConnectionStatus {
            connected: true,
            upstream_connected: self.upstream.is_connected(),
        });
        self.hub.deliver_to(&client_id, &status);
    }

    fn on_subscribe_request(&mut self, client_id: ClientId, symbol: &str) {
        if !self.hub.contains(&client_id) {
            debug!("Ignoring subscribe to {} from unknown client {}", symbol, client_id);
            return;
        }

        let outcome = self.registry.add(client_id, symbol);
        counter!("gateway_subscriptions_total").increment(1);
        debug!("Client {} subscribed to {}", client_id, symbol);

        if outcome.first_subscriber_for_symbol {
            info!("First subscriber for {}, subscribing upstream", symbol);
            self.upstream.send_subscribe(symbol);
        }
    }

    fn on_unsubscribe_request(&mut self, client_id: ClientId, symbol: &str) {
        let outcome = self.registry.remove(client_id, symbol);
        debug!("Client {} unsubscribed from {}", client_id, symbol);

        if outcome.last_subscriber_for_symbol {
            info!("Last subscriber left {}, unsubscribing upstream", symbol);
            self.upstream.send_unsubscribe(symbol);
        }
    }

    fn on_subscriber_disconnect(&mut self, client_id: ClientId, reason: &str) {
        let known = self.hub.unregister(&client_id);
        let released = self.registry.remove_all(client_id);
        if !known && released.is_empty() {
            return;
        }

        info!(
            "Client {} disconnected ({}), releasing {} symbols",
            client_id,
            reason,
            released.len()
        );
        for (symbol, last) in released {
            if last {
                info!("Last subscriber left {}, unsubscribing upstream", symbol);
                self.upstream.send_unsubscribe(&symbol);
            }
        }
    }

    fn on_upstream_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::Ticker { symbol, payload } => self.on_upstream_ticker(&symbol, payload),
            UpstreamEvent::SubscriptionAck { symbols, payload } => {
                self.on_upstream_subscription_ack(&symbols, payload)
            }
            UpstreamEvent::StatusChanged(status) => self.on_upstream_status_changed(status),
        }
    }

    fn on_upstream_ticker(&self, symbol: &str, payload: Value) {
        let msg = ServerMessage::Ticker(payload);
        let delivered = self
            .hub
            .deliver_to_each(self.registry.subscribers_of(symbol), &msg);
        if delivered == 0 {
            debug!("No subscribers for ticker {}", symbol);
            return;
        }
        counter!("gateway_tickers_routed_total").increment(delivered as u64);
    }

    fn on_upstream_subscription_ack(&self, symbols: &[String], payload: Value) {
        let msg = ServerMessage::SubscriptionConfirmed(payload);
        for symbol in symbols {
            let delivered = self
                .hub
                .deliver_to_each(self.registry.subscribers_of(symbol), &msg);
            debug!("Subscription to {} confirmed to {} clients", symbol, delivered);
        }
    }

    fn on_upstream_status_changed(&mut self, status: FeedStatus) {
        let connected = status.connected;
        let delivered = self.hub.broadcast(&ServerMessage::CoinbaseStatus(status));
        debug!("Upstream status broadcast to {} clients", delivered);

        if connected && self.config.resubscribe_on_reconnect && !self.registry.is_empty() {
            let symbols = self.registry.symbols();
            info!("Resubscribing upstream to {} symbols", symbols.len());
            if !self.upstream.send_subscribe_all(&symbols) {
                warn!("Failed to resubscribe upstream to {:?}", symbols);
            }
        }
    }
}
