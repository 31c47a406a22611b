//! Feed protocol trait implemented by upstream adapters.

use crate::error::Result;
use serde_json::Value;

/// An inbound feed frame that the relay cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// Quote update for one symbol. `payload` is the full frame, passed through untouched.
    Ticker { symbol: String, payload: Value },
    /// Acknowledgement listing every symbol the feed now has subscribed.
    SubscriptionAck { symbols: Vec<String>, payload: Value },
}

/// Trait that feed adapters implement to speak a particular upstream protocol.
/// The [`UpstreamConnection`](crate::upstream::UpstreamConnection) calls these to build
/// outbound frames and to classify inbound ones.
pub trait FeedHandler: Send + Sync + 'static {
    /// Short feed name used for log fields and metric labels.
    fn name(&self) -> &'static str;

    /// Returns the WebSocket URL to connect to.
    fn url(&self) -> &str;

    /// Builds the frame that subscribes to `symbols`.
    fn subscribe_message(&self, symbols: &[String]) -> Result<String>;

    /// Builds the frame that unsubscribes from `symbols`.
    fn unsubscribe_message(&self, symbols: &[String]) -> Result<String>;

    /// Classifies a text frame.
    ///
    /// Returns `Ok(None)` for well-formed frames of a type the relay ignores and `Err` for frames
    /// that do not parse.
    fn classify(&self, text: &str) -> Result<Option<FeedMessage>>;
}
