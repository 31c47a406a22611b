//! Coinbase Exchange feed adapter.
//!
//! Speaks the public `ticker` channel of the Exchange WebSocket feed:
//! builds subscribe/unsubscribe frames and classifies inbound frames for the relay.
//!
//! # Example
//!
//! ```ignore
//! use coinbase::CoinbaseHandler;
//! use common::{SignalTx, UpstreamConfig, UpstreamConnection, UpstreamSignal, WsConnector};
//!
//! let (signals_tx, signals) = tokio::sync::mpsc::unbounded_channel::<UpstreamSignal>();
//! let mut upstream = UpstreamConnection::new(
//!     CoinbaseHandler::default(),
//!     WsConnector::default(),
//!     UpstreamConfig::default(),
//!     SignalTx::new(signals_tx),
//! );
//! upstream.connect();
//! ```

pub mod handler;
pub mod types;

pub use handler::CoinbaseHandler;
pub use types::{build_subscription_message, build_unsubscription_message, TICKER_CHANNEL, WS_URL};
