//! The `error` module defines custom error types used within the `roomcast` application.
//!
//! Lookups of unknown clients, connections or topics are never errors: they
//! return empty results. Only backend failures and invariant violations are
//! surfaced as `Err`.

use thiserror::Error;

/// Failures raised by a membership store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend round trip failed. No state is assumed mutated and the
    /// caller may retry with backoff.
    #[error("membership backend unavailable: {0}")]
    Backend(String),

    /// The topic or client name cannot be encoded as a store key.
    #[error("invalid name {0:?}")]
    InvalidName(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Errors returned by the hub operations exposed to callers.
#[derive(Debug, Error)]
pub enum HubError {
    /// Membership store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A connection id is already registered to a different client.
    #[error("connection {connection_id} already belongs to {owner}, refusing to register it for {requested}")]
    Conflict {
        connection_id: String,
        owner: String,
        requested: String,
    },

    /// The broadcast message could not be encoded.
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HubError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, HubError::Store(StoreError::Backend(_)))
    }
}
