//! Transports: LAN broadcast over UDP and broker relay. Both feed the same dispatcher
//! and event bus, and both keep their mutable maps in one [`SharedState`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sitrep_core::envelope::EnvelopeError;
use sitrep_core::wire::WireEncodeError;
use sitrep_core::Dispatcher;
use tokio::sync::{watch, Mutex};

pub mod broker;
pub mod local;

pub use broker::{BrokerClient, BrokerError, BrokerSecurity, BrokerSettings, BrokerTransport};
pub use local::{LocalBroadcastTransport, LocalSettings};

/// All mutable state touched by receive loops and senders: profile cache, throttle
/// windows and delivery ledger (inside the dispatcher), known peers and peer links.
/// Guarded by a single lock; never held across network I/O.
pub struct SharedState {
    pub dispatcher: Dispatcher,
    pub(crate) peers: HashSet<String>,
    pub(crate) links: HashMap<String, local::PeerLink>,
}

impl SharedState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            peers: HashSet::new(),
            links: HashMap::new(),
        }
    }
}

pub type Shared = Arc<Mutex<SharedState>>;

pub fn shared(dispatcher: Dispatcher) -> Shared {
    Arc::new(Mutex::new(SharedState::new(dispatcher)))
}

/// Lifecycle of one transport, observable for status indicators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

pub(crate) fn state_channel() -> watch::Sender<ConnectionState> {
    watch::channel(ConnectionState::Disconnected).0
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("transport not started")]
    NotStarted,
    #[error(transparent)]
    Encode(#[from] WireEncodeError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
