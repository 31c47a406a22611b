//! Upstream feed plumbing for the ticker relay.
//!
//! - [`UpstreamConnection`]: connect/reconnect state machine with bounded exponential backoff
//! - [`FeedHandler`]: per-feed protocol plug-in (frame builders and inbound classification)
//! - [`WsConnector`]: the WebSocket transport that backs a connection attempt

pub mod backoff;
pub mod error;
pub mod messages;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod upstream;
pub mod ws_handler;
pub mod ws_manager;

pub use backoff::ReconnectState;
pub use error::Error;
pub use messages::{ControlCommand, SignalTx, TransportEvent, UpstreamSignal};
pub use upstream::{
    Connector, FeedStatus, Link, UpstreamConfig, UpstreamConnection, UpstreamEvent, UpstreamState,
};
pub use ws_handler::{FeedHandler, FeedMessage};
pub use ws_manager::{WsConnector, WsManagerConfig};
