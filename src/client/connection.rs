use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

pub type ConnectionId = String;

/// Why a frame could not be handed to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The connection was closed before or during the send.
    #[error("connection closed")]
    Closed,

    /// The outbound buffer stayed full for the whole send timeout.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

/// Handle to one live WebSocket connection.
///
/// Frames go through a bounded channel to the socket writer task. Clones
/// share the channel and the close flag, so closing any clone invalidates
/// in-flight and future sends on all of them.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Process-unique connection identifier.
    pub id: ConnectionId,

    /// Channel to the writer task of the socket.
    sender: mpsc::Sender<WsMessage>,

    closed: Arc<watch::Sender<bool>>,
}

impl Connection {
    pub fn new(sender: mpsc::Sender<WsMessage>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), sender)
    }

    pub fn with_id(id: impl Into<ConnectionId>, sender: mpsc::Sender<WsMessage>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: id.into(),
            sender,
            closed: Arc::new(closed),
        }
    }

    /// Creates a connection together with the receiving end its writer task drains.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    /// Queues `msg` for the socket, waiting at most `timeout` for buffer space.
    pub async fn send(&self, msg: WsMessage, timeout: Duration) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed() => Err(DeliveryError::Closed),
            res = self.sender.send_timeout(msg, timeout) => match res {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::Timeout(timeout)),
                Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
            },
        }
    }

    /// Marks the connection closed and wakes everything waiting on it.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            tracing::debug!(connection_id = %self.id, "connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.sender.is_closed()
    }

    /// Resolves once `close` has been called on any clone.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
