//! SITREP node: tokio host for `sitrep-core`. Runs the LAN broadcast and broker
//! transports, the coordinator that switches between them, and the event bus.

pub mod config;
pub mod coordinator;
pub mod events;
pub mod transport;

pub use config::{Config, ConfigError};
pub use coordinator::{
    CoordinatorError, CoordinatorSettings, OrderDraft, TransportCoordinator, TransportMode,
};
pub use events::EventBus;
pub use transport::{
    BrokerClient, BrokerError, BrokerSecurity, BrokerSettings, ConnectionState,
    LocalBroadcastTransport, LocalSettings, TransportError,
};
