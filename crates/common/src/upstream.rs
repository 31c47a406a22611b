//! Upstream connection state machine.
//!
//! Owns the single logical connection to the feed. Connection attempts and reconnect timers run
//! as spawned tasks that report back through the [`SignalTx`] given to
//! [`UpstreamConnection::new`]. The owner feeds every received signal into
//! [`UpstreamConnection::handle`] from one task, so none of the state here is shared.

use crate::backoff::{ReconnectState, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::messages::{ControlCommand, SignalTx, TransportEvent, UpstreamSignal};
use crate::ws_handler::{FeedHandler, FeedMessage};
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection state of the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connectivity snapshot broadcast to subscribers whenever the upstream state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FeedStatus {
    pub fn connected() -> Self {
        Self {
            connected: true,
            error: None,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            connected: false,
            error: Some(error.into()),
        }
    }
}

/// Typed events emitted to the owner of an [`UpstreamConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Ticker { symbol: String, payload: Value },
    SubscriptionAck { symbols: Vec<String>, payload: Value },
    StatusChanged(FeedStatus),
}

impl From<FeedMessage> for UpstreamEvent {
    fn from(msg: FeedMessage) -> Self {
        match msg {
            FeedMessage::Ticker { symbol, payload } => Self::Ticker { symbol, payload },
            FeedMessage::SubscriptionAck { symbols, payload } => {
                Self::SubscriptionAck { symbols, payload }
            }
        }
    }
}

/// Handle to one running connection attempt.
pub struct Link {
    commands: mpsc::UnboundedSender<ControlCommand>,
    task: Option<JoinHandle<()>>,
}

impl Link {
    pub fn new(commands: mpsc::UnboundedSender<ControlCommand>, task: Option<JoinHandle<()>>) -> Self {
        Self { commands, task }
    }

    pub(crate) fn send(&self, cmd: ControlCommand) -> bool {
        self.commands.send(cmd).is_ok()
    }

    /// Ask the link to close. A link still in its handshake is aborted outright.
    fn close(self, established: bool) {
        let _ = self.commands.send(ControlCommand::Shutdown);
        if !established {
            if let Some(task) = self.task {
                task.abort();
            }
        }
    }
}

/// Opens transport links to the feed.
///
/// Implementations spawn whatever I/O they need and report [`TransportEvent`]s for `generation`
/// through `signals`. The real implementation is [`WsConnector`](crate::ws_manager::WsConnector).
pub trait Connector: Send + 'static {
    fn open(&mut self, url: &str, generation: u64, signals: SignalTx) -> Link;
}

/// Reconnect policy for the upstream connection.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Delay before the first reconnect attempt; doubled for each further attempt.
    pub base_delay: Duration,
    /// Automatic reconnect attempts before giving up.
    pub max_attempts: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// The single connection to the upstream feed.
pub struct UpstreamConnection<H, C> {
    handler: H,
    connector: C,
    state: UpstreamState,
    reconnect: ReconnectState,
    /// Bumped on every connection attempt; signals tagged with an older value are stale.
    generation: u64,
    link: Option<Link>,
    reconnect_timer: Option<JoinHandle<()>>,
    scheduled_delay: Option<Duration>,
    signals: SignalTx,
    shut_down: bool,
}

impl<H: FeedHandler, C: Connector> UpstreamConnection<H, C> {
    /// Create a disconnected upstream connection that reports through `signals`.
    ///
    /// Every signal sent there must come back through [`UpstreamConnection::handle`].
    pub fn new(handler: H, connector: C, config: UpstreamConfig, signals: SignalTx) -> Self {
        Self {
            handler,
            connector,
            state: UpstreamState::Disconnected,
            reconnect: ReconnectState::new(config.base_delay, config.max_attempts),
            generation: 0,
            link: None,
            reconnect_timer: None,
            scheduled_delay: None,
            signals,
            shut_down: false,
        }
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == UpstreamState::Connected
    }

    pub fn attempt_count(&self) -> u32 {
        self.reconnect.attempt_count()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Delay of the pending reconnect timer, if one is scheduled.
    pub fn scheduled_delay(&self) -> Option<Duration> {
        self.scheduled_delay
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Open a new connection unless one is already open or being opened.
    pub fn connect(&mut self) {
        if self.shut_down {
            debug!("Ignoring connect after shutdown");
            return;
        }
        if self.state != UpstreamState::Disconnected {
            return;
        }

        self.cancel_reconnect_timer();
        self.generation += 1;
        self.state = UpstreamState::Connecting;
        info!(
            feed = self.handler.name(),
            generation = self.generation,
            attempt = self.reconnect.attempt_count(),
            "Connecting to upstream feed: {}",
            self.handler.url()
        );

        let link = self
            .connector
            .open(self.handler.url(), self.generation, self.signals.clone());
        self.link = Some(link);
    }

    /// Apply one signal and return the event it produces, if any.
    pub fn handle(&mut self, signal: UpstreamSignal) -> Option<UpstreamEvent> {
        if self.shut_down {
            debug!("Ignoring upstream signal after shutdown: {:?}", signal);
            return None;
        }

        match signal {
            UpstreamSignal::Transport { generation, event } => {
                if generation != self.generation {
                    debug!(
                        "Ignoring {:?} from stale upstream link {} (current {})",
                        event, generation, self.generation
                    );
                    return None;
                }
                match event {
                    TransportEvent::Opened => self.on_open(),
                    TransportEvent::Message(text) => self.on_message(&text),
                    TransportEvent::Error(error) => self.on_error(error),
                    TransportEvent::Closed => self.on_close(),
                }
            }
            UpstreamSignal::ReconnectDue { generation } => {
                self.on_reconnect_due(generation);
                None
            }
        }
    }

    /// Send a raw frame. Dropped unless the connection is open.
    pub fn send(&self, frame: String) -> bool {
        if self.state != UpstreamState::Connected {
            debug!("Upstream not connected ({:?}), dropping frame: {}", self.state, frame);
            return false;
        }
        match &self.link {
            Some(link) => link.send(ControlCommand::Send(frame)),
            None => false,
        }
    }

    pub fn send_subscribe(&self, symbol: &str) -> bool {
        self.send_subscribe_all(&[symbol.to_string()])
    }

    pub fn send_unsubscribe(&self, symbol: &str) -> bool {
        match self.handler.unsubscribe_message(&[symbol.to_string()]) {
            Ok(frame) => {
                let sent = self.send(frame);
                if sent {
                    counter!("upstream_unsubscribes_sent_total", "feed" => self.handler.name())
                        .increment(1);
                }
                sent
            }
            Err(e) => {
                warn!("Failed to build unsubscribe frame for {}: {}", symbol, e);
                false
            }
        }
    }

    /// Subscribe to several symbols with a single frame.
    pub fn send_subscribe_all(&self, symbols: &[String]) -> bool {
        if symbols.is_empty() {
            return false;
        }
        match self.handler.subscribe_message(symbols) {
            Ok(frame) => {
                let sent = self.send(frame);
                if sent {
                    counter!("upstream_subscribes_sent_total", "feed" => self.handler.name())
                        .increment(1);
                }
                sent
            }
            Err(e) => {
                warn!("Failed to build subscribe frame for {:?}: {}", symbols, e);
                false
            }
        }
    }

    /// Tear down: abort any pending reconnect, close the link, and ignore all later signals.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.release();
        self.state = UpstreamState::Disconnected;
        gauge!("upstream_connected", "feed" => self.handler.name()).set(0.0);
        info!(feed = self.handler.name(), "Upstream connection shut down");
    }

    fn on_open(&mut self) -> Option<UpstreamEvent> {
        self.state = UpstreamState::Connected;
        self.reconnect.reset();
        gauge!("upstream_connected", "feed" => self.handler.name()).set(1.0);
        info!(
            feed = self.handler.name(),
            generation = self.generation,
            "Upstream feed connected"
        );
        Some(UpstreamEvent::StatusChanged(FeedStatus::connected()))
    }

    fn on_message(&self, text: &str) -> Option<UpstreamEvent> {
        counter!("upstream_messages_received_total", "feed" => self.handler.name()).increment(1);
        match self.handler.classify(text) {
            Ok(Some(msg)) => Some(msg.into()),
            Ok(None) => None,
            Err(e) => {
                counter!("upstream_malformed_messages_total", "feed" => self.handler.name())
                    .increment(1);
                warn!("Dropping malformed upstream message: {} ({})", e, text);
                None
            }
        }
    }

    fn on_error(&self, error: String) -> Option<UpstreamEvent> {
        counter!("upstream_errors_total", "feed" => self.handler.name()).increment(1);
        warn!(feed = self.handler.name(), "Upstream connection error: {}", error);
        Some(UpstreamEvent::StatusChanged(FeedStatus::failed(error)))
    }

    fn on_close(&mut self) -> Option<UpstreamEvent> {
        self.state = UpstreamState::Disconnected;
        self.link = None;
        gauge!("upstream_connected", "feed" => self.handler.name()).set(0.0);

        match self.reconnect.next_delay() {
            Some(delay) => self.schedule_reconnect(delay),
            None => warn!(
                feed = self.handler.name(),
                "Upstream closed after {} reconnect attempts; not retrying",
                self.reconnect.max_attempts()
            ),
        }

        Some(UpstreamEvent::StatusChanged(FeedStatus::disconnected()))
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.cancel_reconnect_timer();
        info!(
            feed = self.handler.name(),
            attempt = self.reconnect.attempt_count() + 1,
            "Upstream closed, reconnecting in {:?}",
            delay
        );
        counter!("upstream_reconnects_scheduled_total", "feed" => self.handler.name()).increment(1);

        let generation = self.generation;
        let signals = self.signals.clone();
        self.scheduled_delay = Some(delay);
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = signals.send(UpstreamSignal::ReconnectDue { generation });
        }));
    }

    fn on_reconnect_due(&mut self, generation: u64) {
        let pending = self.reconnect_timer.is_some();
        if generation != self.generation || self.state != UpstreamState::Disconnected || !pending {
            debug!("Ignoring stale reconnect timer for generation {}", generation);
            return;
        }
        self.reconnect_timer = None;
        self.scheduled_delay = None;
        self.reconnect.record_attempt();
        self.connect();
    }
}

impl<H, C> UpstreamConnection<H, C> {
    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.scheduled_delay = None;
    }

    fn release(&mut self) {
        self.cancel_reconnect_timer();
        if let Some(link) = self.link.take() {
            link.close(self.state == UpstreamState::Connected);
        }
    }
}

impl<H, C> Drop for UpstreamConnection<H, C> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingConnector, ScriptedFeed};
    use tokio::time::Instant;

    fn upstream(
        config: UpstreamConfig,
    ) -> (
        UpstreamConnection<ScriptedFeed, RecordingConnector>,
        RecordingConnector,
        mpsc::UnboundedReceiver<UpstreamSignal>,
    ) {
        let connector = RecordingConnector::default();
        let (signals_tx, signals) = mpsc::unbounded_channel::<UpstreamSignal>();
        let upstream = UpstreamConnection::new(
            ScriptedFeed,
            connector.clone(),
            config,
            SignalTx::new(signals_tx),
        );
        (upstream, connector, signals)
    }

    fn transport(
        upstream: &mut UpstreamConnection<ScriptedFeed, RecordingConnector>,
        event: TransportEvent,
    ) -> Option<UpstreamEvent> {
        let generation = upstream.generation();
        upstream.handle(UpstreamSignal::transport(generation, event))
    }

    #[tokio::test]
    async fn test_connect_is_noop_while_connecting_or_connected() {
        let (mut upstream, connector, _signals) = upstream(UpstreamConfig::default());

        upstream.connect();
        upstream.connect();
        assert_eq!(upstream.state(), UpstreamState::Connecting);
        assert_eq!(connector.open_count(), 1);

        transport(&mut upstream, TransportEvent::Opened);
        upstream.connect();
        assert_eq!(upstream.state(), UpstreamState::Connected);
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test]
    async fn test_open_emits_connected_status() {
        let (mut upstream, _connector, _signals) = upstream(UpstreamConfig::default());
        upstream.connect();

        let event = transport(&mut upstream, TransportEvent::Opened);
        assert_eq!(event, Some(UpstreamEvent::StatusChanged(FeedStatus::connected())));
        assert!(upstream.is_connected());
        assert_eq!(upstream.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_messages_are_classified() {
        let (mut upstream, _connector, _signals) = upstream(UpstreamConfig::default());
        upstream.connect();
        transport(&mut upstream, TransportEvent::Opened);

        let tick = r#"{"kind":"tick","symbol":"BTC-USD","price":"1"}"#;
        match transport(&mut upstream, TransportEvent::Message(tick.to_string())) {
            Some(UpstreamEvent::Ticker { symbol, payload }) => {
                assert_eq!(symbol, "BTC-USD");
                assert_eq!(payload["price"], "1");
            }
            other => panic!("expected ticker, got {:?}", other),
        }

        let ack = r#"{"kind":"ack","symbols":["BTC-USD","ETH-USD"]}"#;
        match transport(&mut upstream, TransportEvent::Message(ack.to_string())) {
            Some(UpstreamEvent::SubscriptionAck { symbols, .. }) => {
                assert_eq!(symbols, vec!["BTC-USD", "ETH-USD"]);
            }
            other => panic!("expected ack, got {:?}", other),
        }

        let other = r#"{"kind":"heartbeat"}"#;
        assert_eq!(transport(&mut upstream, TransportEvent::Message(other.to_string())), None);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (mut upstream, _connector, _signals) = upstream(UpstreamConfig::default());
        upstream.connect();
        transport(&mut upstream, TransportEvent::Opened);

        let event = transport(&mut upstream, TransportEvent::Message("not json{".to_string()));
        assert_eq!(event, None);
        assert!(upstream.is_connected());
    }

    #[tokio::test]
    async fn test_error_reports_status_without_closing() {
        let (mut upstream, _connector, _signals) = upstream(UpstreamConfig::default());
        upstream.connect();
        transport(&mut upstream, TransportEvent::Opened);

        let event = transport(&mut upstream, TransportEvent::Error("reset by peer".to_string()));
        assert_eq!(
            event,
            Some(UpstreamEvent::StatusChanged(FeedStatus::failed("reset by peer")))
        );
        assert!(upstream.is_connected());
        assert!(upstream.scheduled_delay().is_none());
    }

    #[tokio::test]
    async fn test_send_is_dropped_unless_connected() {
        let (mut upstream, connector, _signals) = upstream(UpstreamConfig::default());
        assert!(!upstream.send_subscribe("BTC-USD"));

        upstream.connect();
        assert!(!upstream.send_subscribe("BTC-USD"));
        assert!(connector.take_sent().is_empty());

        transport(&mut upstream, TransportEvent::Opened);
        assert!(upstream.send_subscribe("BTC-USD"));
        assert!(upstream.send_unsubscribe("BTC-USD"));
        assert_eq!(
            connector.take_sent(),
            vec![
                r#"{"op":"subscribe","symbols":["BTC-USD"]}"#.to_string(),
                r#"{"op":"unsubscribe","symbols":["BTC-USD"]}"#.to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule() {
        let (mut upstream, connector, mut signals) = upstream(UpstreamConfig::default());
        upstream.connect();

        for expected_ms in [5000u64, 10000, 20000, 40000, 80000] {
            let event = transport(&mut upstream, TransportEvent::Closed);
            assert_eq!(event, Some(UpstreamEvent::StatusChanged(FeedStatus::disconnected())));
            assert_eq!(upstream.state(), UpstreamState::Disconnected);

            let expected = Duration::from_millis(expected_ms);
            assert_eq!(upstream.scheduled_delay(), Some(expected));

            let started = Instant::now();
            let signal = signals.recv().await.expect("reconnect timer fires");
            assert!(started.elapsed() >= expected);
            assert!(matches!(signal, UpstreamSignal::ReconnectDue { .. }));

            upstream.handle(signal);
            assert_eq!(upstream.state(), UpstreamState::Connecting);
        }

        assert_eq!(upstream.attempt_count(), 5);
        assert_eq!(connector.open_count(), 6);

        // Sixth consecutive close: nothing further is scheduled.
        transport(&mut upstream, TransportEvent::Closed);
        assert!(upstream.scheduled_delay().is_none());
        let waited = tokio::time::timeout(Duration::from_secs(3600), signals.recv()).await;
        assert!(waited.is_err());
        assert_eq!(upstream.state(), UpstreamState::Disconnected);

        // An explicit connect still works once automatic retries are exhausted.
        upstream.connect();
        assert_eq!(upstream.state(), UpstreamState::Connecting);
        assert_eq!(connector.open_count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_backoff() {
        let (mut upstream, _connector, mut signals) = upstream(UpstreamConfig::default());
        upstream.connect();

        for _ in 0..2 {
            transport(&mut upstream, TransportEvent::Closed);
            let signal = signals.recv().await.expect("reconnect timer fires");
            upstream.handle(signal);
        }
        assert_eq!(upstream.attempt_count(), 2);

        transport(&mut upstream, TransportEvent::Opened);
        assert_eq!(upstream.attempt_count(), 0);

        transport(&mut upstream, TransportEvent::Closed);
        assert_eq!(upstream.scheduled_delay(), Some(Duration::from_millis(5000)));
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let (mut upstream, _connector, _signals) = upstream(UpstreamConfig::default());
        upstream.connect();
        let old = upstream.generation();
        transport(&mut upstream, TransportEvent::Closed);

        // External reconnect supersedes the pending timer.
        upstream.connect();
        assert!(upstream.scheduled_delay().is_none());
        assert_ne!(upstream.generation(), old);

        let event = upstream.handle(UpstreamSignal::transport(old, TransportEvent::Opened));
        assert_eq!(event, None);
        assert_eq!(upstream.state(), UpstreamState::Connecting);

        upstream.handle(UpstreamSignal::ReconnectDue { generation: old });
        assert_eq!(upstream.state(), UpstreamState::Connecting);
        assert_eq!(upstream.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let (mut upstream, connector, mut signals) = upstream(UpstreamConfig::default());
        upstream.connect();
        transport(&mut upstream, TransportEvent::Opened);
        transport(&mut upstream, TransportEvent::Closed);
        assert!(upstream.scheduled_delay().is_some());

        upstream.shutdown();
        assert!(upstream.is_shut_down());
        assert!(upstream.scheduled_delay().is_none());

        let waited = tokio::time::timeout(Duration::from_secs(3600), signals.recv()).await;
        assert!(waited.is_err());

        let generation = upstream.generation();
        upstream.handle(UpstreamSignal::ReconnectDue { generation });
        upstream.connect();
        assert_eq!(connector.open_count(), 1);
        assert_eq!(upstream.state(), UpstreamState::Disconnected);
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_link() {
        let (mut upstream, connector, _signals) = upstream(UpstreamConfig::default());
        upstream.connect();
        transport(&mut upstream, TransportEvent::Opened);

        upstream.shutdown();
        assert!(connector.was_shut_down());
        assert!(!upstream.send_subscribe("BTC-USD"));
    }

    #[test]
    fn test_feed_status_serialization() {
        let json = serde_json::to_value(FeedStatus::failed("boom")).unwrap();
        assert_eq!(json, serde_json::json!({"connected": false, "error": "boom"}));

        let json = serde_json::to_value(FeedStatus::connected()).unwrap();
        assert_eq!(json, serde_json::json!({"connected": true}));
    }
}
