//! Nostr relay client transport.
//!
//! This crate exposes a small surface:
//! - one relay connection with reconnect, resubscribe and an offline queue
//! - multi-relay pool fanout with per-relay tagged notifications
//! - relay-to-client message parsing

pub mod error;
pub mod handle;
pub mod message;
pub mod pool;
pub mod relay;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{ClientError, Result};
pub use handle::{Relay, parse_relay_url};
pub use message::RelayMessage;
pub use pool::{PoolConfig, PoolNotification, RelayPool};
pub use relay::{
    ConnectionState, DEFAULT_RECONNECT_DELAY, RelayConfig, RelayConnection, RelayNotification,
};
pub use subscription::{SubscriptionState, SubscriptionTracker, new_subscription_id};
pub use transport::{
    Connector, Transport, TransportEvent, TransportEvents, TransportState, WebSocketConnector,
    WebSocketTransport,
};
