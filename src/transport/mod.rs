//! The `transport` module is responsible for handling network communication
//! with clients via WebSockets.
//!
//! It defines the JSON envelope used between clients and the server and
//! implements the WebSocket server itself: each socket becomes a
//! `Connection`, its open and close events drive the hub lifecycle, and its
//! requests are forwarded to the hub.

pub mod message;
pub mod websocket;

#[cfg(test)]
mod tests;
