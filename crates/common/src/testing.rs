//! In-memory stand-ins for the network, for tests in this and dependent crates.

use crate::error::Result;
use crate::messages::{ControlCommand, SignalTx};
use crate::upstream::{Connector, Link};
use crate::ws_handler::{FeedHandler, FeedMessage};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// One link opened through a [`RecordingConnector`].
struct RecordedLink {
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    shut_down: bool,
}

/// Connector that opens no sockets and records every command written to its links.
///
/// Clones share the same record, so a test can keep one clone while the upstream owns another.
#[derive(Clone, Default)]
pub struct RecordingConnector {
    links: Arc<Mutex<Vec<RecordedLink>>>,
}

impl RecordingConnector {
    fn links(&self) -> MutexGuard<'_, Vec<RecordedLink>> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open_count(&self) -> usize {
        self.links().len()
    }

    /// Drain the frames written to the most recent link.
    pub fn take_sent(&self) -> Vec<String> {
        let mut links = self.links();
        let Some(link) = links.last_mut() else {
            return Vec::new();
        };
        let mut sent = Vec::new();
        while let Ok(cmd) = link.commands.try_recv() {
            match cmd {
                ControlCommand::Send(frame) => sent.push(frame),
                ControlCommand::Shutdown => link.shut_down = true,
            }
        }
        sent
    }

    /// Whether the most recent link was asked to close.
    pub fn was_shut_down(&self) -> bool {
        self.take_sent();
        self.links().last().map(|link| link.shut_down).unwrap_or(false)
    }
}

impl Connector for RecordingConnector {
    fn open(&mut self, _url: &str, _generation: u64, _signals: SignalTx) -> Link {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        self.links().push(RecordedLink {
            commands,
            shut_down: false,
        });
        Link::new(commands_tx, None)
    }
}

/// Minimal JSON feed protocol.
///
/// Outbound: `{"op":"subscribe"|"unsubscribe","symbols":[...]}`.
/// Inbound: `{"kind":"tick","symbol":..}` and `{"kind":"ack","symbols":[..]}`; any other
/// `kind` is ignored and frames without a `kind` are malformed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptedFeed;

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ScriptedFrame {
    Tick {
        symbol: String,
    },
    Ack {
        #[serde(default)]
        symbols: Vec<String>,
    },
    #[serde(other)]
    Other,
}

impl ScriptedFeed {
    fn frame(op: &str, symbols: &[String]) -> Result<String> {
        Ok(serde_json::to_string(&json!({ "op": op, "symbols": symbols }))?)
    }
}

impl FeedHandler for ScriptedFeed {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn url(&self) -> &str {
        "ws://feed.test/ws"
    }

    fn subscribe_message(&self, symbols: &[String]) -> Result<String> {
        Self::frame("subscribe", symbols)
    }

    fn unsubscribe_message(&self, symbols: &[String]) -> Result<String> {
        Self::frame("unsubscribe", symbols)
    }

    fn classify(&self, text: &str) -> Result<Option<FeedMessage>> {
        let payload: Value = serde_json::from_str(text)?;
        let message = match ScriptedFrame::deserialize(&payload)? {
            ScriptedFrame::Tick { symbol } => FeedMessage::Ticker { symbol, payload },
            ScriptedFrame::Ack { symbols } => FeedMessage::SubscriptionAck { symbols, payload },
            ScriptedFrame::Other => return Ok(None),
        };
        Ok(Some(message))
    }
}
