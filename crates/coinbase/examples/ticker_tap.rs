//! Quick live check against the Coinbase feed: connects, subscribes to the products given on
//! the command line (default `BTC-USD`), and prints classified events until Ctrl+C.

use coinbase::CoinbaseHandler;
use common::{
    SignalTx, UpstreamConfig, UpstreamConnection, UpstreamEvent, UpstreamSignal, WsConnector,
    WsManagerConfig,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut products: Vec<String> = std::env::args().skip(1).collect();
    if products.is_empty() {
        products.push("BTC-USD".to_string());
    }

    let connector = WsConnector::new(WsManagerConfig {
        platform_label: "coinbase".to_string(),
        ..WsManagerConfig::default()
    });
    let (signals_tx, mut signals) = mpsc::unbounded_channel::<UpstreamSignal>();
    let mut upstream = UpstreamConnection::new(
        CoinbaseHandler::default(),
        connector,
        UpstreamConfig::default(),
        SignalTx::new(signals_tx),
    );
    upstream.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            signal = signals.recv() => {
                let Some(signal) = signal else { break };
                match upstream.handle(signal) {
                    Some(UpstreamEvent::StatusChanged(status)) => {
                        println!("status: {:?}", status);
                        if status.connected {
                            upstream.send_subscribe_all(&products);
                        }
                    }
                    Some(UpstreamEvent::Ticker { symbol, payload }) => {
                        println!("{} {}", symbol, payload["price"]);
                    }
                    Some(UpstreamEvent::SubscriptionAck { symbols, .. }) => {
                        println!("subscribed: {:?}", symbols);
                    }
                    None => {}
                }
            }
        }
    }

    upstream.shutdown();
}
