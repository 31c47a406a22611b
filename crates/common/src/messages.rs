//! Messages exchanged between the upstream state machine and its transport tasks.

use std::sync::Arc;
use tokio::sync::mpsc;

/// Commands sent to a running upstream link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Write a text frame to the socket.
    Send(String),
    /// Close the socket with a normal close frame.
    Shutdown,
}

/// Lifecycle and data events reported by a transport task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(String),
    Error(String),
    Closed,
}

/// Input to [`UpstreamConnection::handle`](crate::upstream::UpstreamConnection::handle).
///
/// Every signal carries the generation of the connection attempt (or reconnect timer) that
/// produced it, so the state machine can discard signals from links it has already replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSignal {
    Transport { generation: u64, event: TransportEvent },
    ReconnectDue { generation: u64 },
}

impl UpstreamSignal {
    pub fn transport(generation: u64, event: TransportEvent) -> Self {
        Self::Transport { generation, event }
    }
}

/// Where transport tasks and reconnect timers report [`UpstreamSignal`]s.
///
/// Wraps any unbounded channel whose item can be built from a signal, so the owner of the
/// connection can read upstream signals from the same queue as its other inputs.
#[derive(Clone)]
pub struct SignalTx {
    send: Arc<dyn Fn(UpstreamSignal) -> bool + Send + Sync>,
}

impl SignalTx {
    pub fn new<E>(tx: mpsc::UnboundedSender<E>) -> Self
    where
        E: From<UpstreamSignal> + Send + 'static,
    {
        Self {
            send: Arc::new(move |signal| tx.send(E::from(signal)).is_ok()),
        }
    }

    /// Returns false once the receiving side is gone.
    pub fn send(&self, signal: UpstreamSignal) -> bool {
        (self.send)(signal)
    }
}

impl std::fmt::Debug for SignalTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalTx").finish_non_exhaustive()
    }
}
