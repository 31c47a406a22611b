//! Coinbase Exchange WebSocket wire types.

use common::error::Result;
use serde::{Deserialize, Serialize};

/// Coinbase Exchange public feed URL.
pub const WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

/// The only channel the relay subscribes to.
pub const TICKER_CHANNEL: &str = "ticker";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
enum RequestType {
    Subscribe,
    Unsubscribe,
}

/// Subscribe/unsubscribe request.
#[derive(Debug, Serialize)]
struct SubscriptionRequest<'a> {
    #[serde(rename = "type")]
    msg_type: RequestType,
    product_ids: &'a [String],
    channels: [&'static str; 1],
}

fn build_request(msg_type: RequestType, product_ids: &[String]) -> Result<String> {
    let msg = SubscriptionRequest {
        msg_type,
        product_ids,
        channels: [TICKER_CHANNEL],
    };
    Ok(serde_json::to_string(&msg)?)
}

/// Build a `ticker` subscription frame for `product_ids`.
pub fn build_subscription_message(product_ids: &[String]) -> Result<String> {
    build_request(RequestType::Subscribe, product_ids)
}

/// Build a `ticker` unsubscription frame for `product_ids`.
pub fn build_unsubscription_message(product_ids: &[String]) -> Result<String> {
    build_request(RequestType::Unsubscribe, product_ids)
}

/// Inbound frames, discriminated by `type`. Fields not named here stay in the raw payload.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum InboundMessage {
    Ticker {
        product_id: String,
    },
    Subscriptions {
        #[serde(default)]
        channels: Vec<ChannelSubscription>,
    },
    Error {
        #[serde(default)]
        message: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// One entry of a `subscriptions` acknowledgement.
#[derive(Debug, Deserialize)]
pub(crate) struct ChannelSubscription {
    pub name: String,
    #[serde(default)]
    pub product_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_subscription_message() {
        let msg = build_subscription_message(&["BTC-USD".to_string()]).unwrap();
        assert_eq!(
            msg,
            r#"{"type":"subscribe","product_ids":["BTC-USD"],"channels":["ticker"]}"#
        );
    }

    #[test]
    fn test_build_unsubscription_message() {
        let msg = build_unsubscription_message(&["ETH-USD".to_string()]).unwrap();
        assert_eq!(
            msg,
            r#"{"type":"unsubscribe","product_ids":["ETH-USD"],"channels":["ticker"]}"#
        );
    }

    #[test]
    fn test_batched_subscription() {
        let ids = vec!["BTC-USD".to_string(), "ETH-USD".to_string()];
        let parsed: serde_json::Value =
            serde_json::from_str(&build_subscription_message(&ids).unwrap()).unwrap();
        assert_eq!(parsed["product_ids"], serde_json::json!(["BTC-USD", "ETH-USD"]));
    }

    #[test]
    fn test_constants() {
        assert_eq!(WS_URL, "wss://ws-feed.exchange.coinbase.com");
        assert_eq!(TICKER_CHANNEL, "ticker");
    }
}
