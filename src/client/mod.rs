//! The `client` module tracks which logical clients are reachable through
//! which live connections.
//!
//! `Connection` is the handle to one WebSocket; `ConnectionRegistry` maps
//! client identities to their live connections and back. The registry is
//! volatile, in-process state rebuilt as clients reconnect.

pub mod connection;
pub mod registry;

pub use connection::{Connection, ConnectionId, DeliveryError};
pub use registry::{ConnectionRegistry, SessionPolicy, Unregistered};
