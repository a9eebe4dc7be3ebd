//! Session-oriented messenger: framing, per-connection state machine, and a
//! multi-peer driver built on non-blocking TCP.
//!
//! [`connection::Connection`] owns the protocol-level state for a single peer
//! (sequence counters, queues, the primary/flag state machine) and is
//! transport-agnostic. [`messenger::Messenger`] is the process-wide piece:
//! it multiplexes many `Connection`s over `mio`, drives the banner/connect
//! handshake, and applies reconnect backoff.

pub mod connection;
pub mod entity;
pub mod error;
pub mod message;
pub mod messenger;
pub mod state;
pub mod tcp;
pub mod wire;

pub use connection::{Connection, ConnectionOps, DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_TIMEOUT};
pub use entity::{EntityType, Identity};
pub use error::{ConnectionError, Result};
pub use message::{Message, MessageHeader};
pub use messenger::{Messenger, MessengerEvent, PeerToken};
pub use state::{ConnFlags, ConnState};
