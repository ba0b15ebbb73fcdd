//! # Roomcast
//!
//! `roomcast` keeps track of which connected clients belong to which topics
//! and broadcasts messages to every live member of a topic over WebSockets.
//!
//! ## Core Modules
//!
//! - `persistence`: the bidirectional topic/member index, in memory or on disk with sled.
//! - `client`: live connection handles and the client-to-connection registry.
//! - `broker`: connect/disconnect lifecycle, the disconnect cascade and topic fan-out.
//! - `transport`: the WebSocket server and its JSON wire messages.
//! - `config`: layered configuration from a file and `ROOMCAST__*` environment variables.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;
