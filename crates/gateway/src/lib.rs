//! Gateway service relaying one Coinbase ticker feed to many WebSocket clients.
//!
//! This service:
//! - Accepts WebSocket connections from clients
//! - Tracks which client wants which symbol
//! - Holds one upstream subscription per symbol with at least one interested client
//! - Routes upstream tickers only to the clients of that symbol
//!
//! ## Architecture
//!
//! ```text
//! Coinbase ws-feed (one connection, reconnect with backoff)
//!         ↓
//! Relay task (owns SubscriptionRegistry, DownstreamHub, UpstreamConnection)
//!         ↓
//! Bounded per-client queues
//!         ↓
//! WebSocket clients
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod subscription;
pub mod ws_server;

pub use client::{ClientId, DownstreamHub};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use protocol::{ClientMessage, ConnectionStatus, ErrorData, ServerMessage};
pub use relay::{Relay, RelayConfig, RelayEvent, RelayRequest, RelayStats, RequestTx};
pub use subscription::SubscriptionRegistry;
pub use ws_server::{create_router, AppState};
