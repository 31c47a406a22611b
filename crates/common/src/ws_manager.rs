//! WebSocket transport for the upstream feed.
//!
//! [`WsConnector`] spawns one task per connection attempt. The task resolves and connects,
//! performs the (TLS) WebSocket handshake, then pumps frames in both directions until the socket
//! closes or it is told to shut down. It never reconnects on its own: every outcome is reported
//! as a [`TransportEvent`] and the upstream state machine decides what happens next.

use crate::error::{Error, Result};
use crate::messages::{ControlCommand, SignalTx, TransportEvent, UpstreamSignal};
use crate::upstream::{Connector, Link};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector as TlsConnector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};
use url::Url;

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsManagerConfig {
    /// Interval between ping frames.
    pub ping_interval: Duration,
    /// Timeout for each TCP connect attempt.
    pub connect_timeout: Duration,
    /// Label for metrics (e.g., "coinbase").
    pub platform_label: String,
}

impl Default for WsManagerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            platform_label: "unknown".to_string(),
        }
    }
}

/// Opens real WebSocket links.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: WsManagerConfig,
}

impl WsConnector {
    pub fn new(config: WsManagerConfig) -> Self {
        Self { config }
    }
}

impl Connector for WsConnector {
    fn open(&mut self, url: &str, generation: u64, signals: SignalTx) -> Link {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = LinkTask {
            url: url.to_string(),
            config: self.config.clone(),
            generation,
            signals,
        };
        let handle = tokio::spawn(task.run(command_rx));
        Link::new(command_tx, Some(handle))
    }
}

struct LinkTask {
    url: String,
    config: WsManagerConfig,
    generation: u64,
    signals: SignalTx,
}

impl LinkTask {
    fn emit(&self, event: TransportEvent) {
        let _ = self
            .signals
            .send(UpstreamSignal::transport(self.generation, event));
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<ControlCommand>) {
        match self.connect_and_run_loop(&mut commands).await {
            Ok(()) => {
                info!("[{}] Upstream link {} closed", self.config.platform_label, self.generation);
            }
            Err(Error::ConnectionClosed) => {
                info!("[{}] Upstream closed the connection", self.config.platform_label);
            }
            Err(e) => {
                counter!("upstream_transport_errors_total", "platform" => self.config.platform_label.clone()).increment(1);
                warn!("[{}] Upstream link failed: {}", self.config.platform_label, e);
                self.emit(TransportEvent::Error(e.to_string()));
            }
        }
        self.emit(TransportEvent::Closed);
    }

    async fn connect_and_run_loop(
        &self,
        commands: &mut mpsc::UnboundedReceiver<ControlCommand>,
    ) -> Result<()> {
        let url = Url::parse(&self.url)?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Generic("No host in URL".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::Generic(format!("No port for scheme {}", url.scheme())))?;

        let tcp_stream = self.connect_tcp(host, port).await?;
        let connector = match url.scheme() {
            "wss" => tls_connector()?,
            _ => TlsConnector::Plain,
        };

        let (ws_stream, response) =
            client_async_tls_with_config(self.url.as_str(), tcp_stream, None, Some(connector))
                .await?;
        debug!(
            "[{}] WebSocket handshake complete, status: {:?}",
            self.config.platform_label,
            response.status()
        );

        gauge!("upstream_active_connections", "platform" => self.config.platform_label.clone())
            .increment(1.0);
        self.emit(TransportEvent::Opened);

        let result = self.pump(ws_stream, commands).await;

        gauge!("upstream_active_connections", "platform" => self.config.platform_label.clone())
            .decrement(1.0);
        result
    }

    /// Resolve `host` and connect, trying IPv4 addresses before IPv6.
    async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| Error::Generic(format!("DNS resolution failed: {}", e)))?
            .collect();

        let mut sorted_addrs: Vec<SocketAddr> =
            addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
        sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

        for addr in &sorted_addrs {
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => {
                    debug!("[{}] TCP connected to {}", self.config.platform_label, addr);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("[{}] TCP connect to {} failed: {}", self.config.platform_label, addr, e);
                }
                Err(_) => {
                    debug!("[{}] TCP connect to {} timed out", self.config.platform_label, addr);
                }
            }
        }

        Err(Error::Generic(format!(
            "All connection attempts to {}:{} failed",
            host, port
        )))
    }

    async fn pump(
        &self,
        ws_stream: FeedStream,
        commands: &mut mpsc::UnboundedReceiver<ControlCommand>,
    ) -> Result<()> {
        let label = &self.config.platform_label;
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = interval(self.config.ping_interval);
        ping_interval.reset();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.emit(TransportEvent::Message(text));
                        }
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => self.emit(TransportEvent::Message(text)),
                            Err(_) => debug!("[{}] Ignoring non-UTF-8 binary frame", label),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("[{}] Received pong", label);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("[{}] Received close frame: {:?}", label, frame);
                            return Err(Error::ConnectionClosed);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            error!("[{}] WebSocket error: {:?}", label, e);
                            return Err(Error::WebSocket(e));
                        }
                        None => {
                            info!("[{}] WebSocket stream ended", label);
                            return Err(Error::ConnectionClosed);
                        }
                    }
                }

                cmd = commands.recv() => {
                    match cmd {
                        Some(ControlCommand::Send(frame)) => {
                            debug!("[{}] Sending: {}", label, frame);
                            write.send(Message::Text(frame)).await?;
                        }
                        Some(ControlCommand::Shutdown) | None => {
                            let close_frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "Shutdown".into(),
                            };
                            let _ = write.send(Message::Close(Some(close_frame))).await;
                            return Ok(());
                        }
                    }
                }

                _ = ping_interval.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
            }
        }
    }
}

fn tls_connector() -> Result<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = root_store.add(cert);
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Generic(format!("TLS config error: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(TlsConnector::Rustls(Arc::new(config)))
}
