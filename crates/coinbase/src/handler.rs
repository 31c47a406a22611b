//! Coinbase feed handler.
//!
//! Classifies inbound frames by their `type`:
//! - `ticker` becomes a [`FeedMessage::Ticker`] carrying the whole frame as payload
//! - `subscriptions` becomes one [`FeedMessage::SubscriptionAck`] listing every acknowledged
//!   product across all channels
//! - `error` is logged; it and every other type produce nothing

use crate::types::{
    build_subscription_message, build_unsubscription_message, ChannelSubscription,
    InboundMessage, WS_URL,
};
use common::error::Result;
use common::{FeedHandler, FeedMessage};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Coinbase Exchange WebSocket handler.
#[derive(Debug, Clone)]
pub struct CoinbaseHandler {
    url: String,
}

impl CoinbaseHandler {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Union of product ids over all channels, in first-seen order.
    fn acknowledged_symbols(channels: &[ChannelSubscription]) -> Vec<String> {
        let mut symbols: Vec<String> = Vec::new();
        for channel in channels {
            debug!(
                "Coinbase acknowledged channel {} for {:?}",
                channel.name, channel.product_ids
            );
            for id in &channel.product_ids {
                if !symbols.contains(id) {
                    symbols.push(id.clone());
                }
            }
        }
        symbols
    }
}

impl Default for CoinbaseHandler {
    fn default() -> Self {
        Self::new(WS_URL)
    }
}

impl FeedHandler for CoinbaseHandler {
    fn name(&self) -> &'static str {
        "coinbase"
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn subscribe_message(&self, symbols: &[String]) -> Result<String> {
        build_subscription_message(symbols)
    }

    fn unsubscribe_message(&self, symbols: &[String]) -> Result<String> {
        build_unsubscription_message(symbols)
    }

    fn classify(&self, text: &str) -> Result<Option<FeedMessage>> {
        let payload: Value = serde_json::from_str(text)?;
        let message = InboundMessage::deserialize(&payload)?;

        match message {
            InboundMessage::Ticker { product_id } => Ok(Some(FeedMessage::Ticker {
                symbol: product_id,
                payload,
            })),
            InboundMessage::Subscriptions { channels } => {
                let symbols = Self::acknowledged_symbols(&channels);
                Ok(Some(FeedMessage::SubscriptionAck { symbols, payload }))
            }
            InboundMessage::Error { message, reason } => {
                warn!(
                    "Coinbase reported an error: {} ({})",
                    message,
                    reason.as_deref().unwrap_or("no reason given")
                );
                Ok(None)
            }
            InboundMessage::Other => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(text: &str) -> Result<Option<FeedMessage>> {
        CoinbaseHandler::default().classify(text)
    }

    #[test]
    fn test_ticker_passes_full_frame_through() {
        let text = r#"{"type":"ticker","product_id":"BTC-USD","price":"64000.01","best_bid":"64000.00","sequence":42}"#;
        match classify(text).unwrap() {
            Some(FeedMessage::Ticker { symbol, payload }) => {
                assert_eq!(symbol, "BTC-USD");
                assert_eq!(payload["price"], "64000.01");
                assert_eq!(payload["sequence"], 42);
                assert_eq!(payload["type"], "ticker");
            }
            other => panic!("expected ticker, got {:?}", other),
        }
    }

    #[test]
    fn test_subscriptions_ack_unions_channels() {
        let frame = json!({
            "type": "subscriptions",
            "channels": [
                {"name": "ticker", "product_ids": ["BTC-USD", "ETH-USD"]},
                {"name": "heartbeat", "product_ids": ["ETH-USD", "SOL-USD"]}
            ]
        });
        match classify(&frame.to_string()).unwrap() {
            Some(FeedMessage::SubscriptionAck { symbols, payload }) => {
                assert_eq!(symbols, vec!["BTC-USD", "ETH-USD", "SOL-USD"]);
                assert_eq!(payload, frame);
            }
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_ack_has_no_symbols() {
        match classify(r#"{"type":"subscriptions","channels":[]}"#).unwrap() {
            Some(FeedMessage::SubscriptionAck { symbols, .. }) => assert!(symbols.is_empty()),
            other => panic!("expected ack, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_types_are_ignored() {
        assert!(classify(r#"{"type":"heartbeat","sequence":1}"#).unwrap().is_none());
        assert!(classify(r#"{"type":"l2update","product_id":"BTC-USD"}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_error_frame_is_ignored() {
        let text = r#"{"type":"error","message":"Failed to subscribe","reason":"BAD-PAIR is not a valid product"}"#;
        assert!(classify(text).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        assert!(classify("not json").is_err());
        assert!(classify("42").is_err());
        assert!(classify(r#"{"product_id":"BTC-USD"}"#).is_err());
        assert!(classify(r#"{"type":"ticker","price":"1"}"#).is_err());
    }

    #[test]
    fn test_custom_url() {
        let handler = CoinbaseHandler::new("wss://ws-feed-public.sandbox.exchange.coinbase.com");
        assert_eq!(handler.url(), "wss://ws-feed-public.sandbox.exchange.coinbase.com");
        assert_eq!(handler.name(), "coinbase");
    }
}
